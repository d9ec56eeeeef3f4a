//! The traced memory image.  An image holds an ordered list of section
//! entries, each binding a shared [`Section`] to a virtual address in some
//! address space.  Reads walk the list front to back; entries that answer
//! reads move to the front and keep their mapping, so the hot working set
//! stays mapped while everything else is mapped on demand and dropped again
//! once the resident count exceeds the cache limit.
//!
//! Entries never overlap within one address space.  Adding a section on top
//! of existing entries shrinks, splits, or removes them; the displaced parts
//! survive as subsections of their original backing file.

use crate::asid::Asid;
use crate::error::{Error, Result};
use crate::log::LogDebug;
use crate::mapped_section::MappedSection;
use crate::section::{Section, SectionSharedPtr};
use std::rc::Rc;

/// Reads memory no section covers.  Captured state takes the place of the
/// usual opaque context pointer.
pub type ReadMemoryCallback = Box<dyn FnMut(&mut [u8], &Asid, u64) -> Result<usize>>;

const DEFAULT_CACHE: u16 = 10;

/// One element of the image's section list.
struct SectionEntry {
    msec: MappedSection,
    /// Whether this image currently holds a mapping of the section.
    mapped: bool,
    next: Option<usize>,
}

/// A singly linked list of section entries, stored in a slab so that a node
/// can be unlinked and relinked at the head in O(1) without moving it.
struct SectionList {
    slots: Vec<Option<SectionEntry>>,
    free: Vec<usize>,
    head: Option<usize>,
}

impl SectionList {
    fn new() -> SectionList {
        SectionList {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
        }
    }

    fn entry(&self, idx: usize) -> &SectionEntry {
        match self.slots[idx] {
            Some(ref entry) => entry,
            None => fatal!("stale section list slot {}", idx),
        }
    }

    fn entry_mut(&mut self, idx: usize) -> &mut SectionEntry {
        match self.slots[idx] {
            Some(ref mut entry) => entry,
            None => fatal!("stale section list slot {}", idx),
        }
    }

    fn next_of(&self, idx: usize) -> Option<usize> {
        self.entry(idx).next
    }

    fn alloc(&mut self, entry: SectionEntry) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    fn last(&self) -> Option<usize> {
        let mut cur = self.head?;
        loop {
            match self.entry(cur).next {
                Some(next) => cur = next,
                None => return Some(cur),
            }
        }
    }

    fn push_tail(&mut self, mut entry: SectionEntry) -> usize {
        entry.next = None;
        let last = self.last();
        let idx = self.alloc(entry);
        match last {
            None => self.head = Some(idx),
            Some(last) => self.entry_mut(last).next = Some(idx),
        }
        idx
    }

    /// Unlink the entry at `idx`; `prev` is the entry right before it, or
    /// None if `idx` is the head.
    fn unlink(&mut self, prev: Option<usize>, idx: usize) -> SectionEntry {
        let next = self.entry(idx).next;
        match prev {
            None => self.head = next,
            Some(prev) => self.entry_mut(prev).next = next,
        }
        self.free.push(idx);
        match self.slots[idx].take() {
            Some(entry) => entry,
            None => fatal!("stale section list slot {}", idx),
        }
    }

    /// Move the entry at `idx` to the head.  The slot index stays valid.
    fn promote(&mut self, prev: Option<usize>, idx: usize) {
        let prev = match prev {
            None => return,
            Some(prev) => prev,
        };
        let next = self.entry(idx).next;
        self.entry_mut(prev).next = next;
        self.entry_mut(idx).next = self.head;
        self.head = Some(idx);
    }

    fn iter(&self) -> Entries<'_> {
        Entries {
            list: self,
            cur: self.head,
        }
    }
}

struct Entries<'a> {
    list: &'a SectionList,
    cur: Option<usize>,
}

impl<'a> Iterator for Entries<'a> {
    type Item = &'a SectionEntry;

    fn next(&mut self) -> Option<&'a SectionEntry> {
        let idx = self.cur?;
        let entry = self.list.entry(idx);
        self.cur = entry.next;
        Some(entry)
    }
}

/// A collection of sections modeling the address spaces of traced processes.
pub struct Image {
    name: Option<String>,
    sections: SectionList,
    callback: Option<ReadMemoryCallback>,
    /// How many sections to keep mapped.
    cache: u16,
    /// How many sections currently are mapped.
    mapped: u16,
}

impl Image {
    pub fn new(name: Option<&str>) -> Image {
        Image {
            name: name.map(str::to_owned),
            sections: SectionList::new(),
            callback: None,
            cache: DEFAULT_CACHE,
            mapped: 0,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn cache(&self) -> u16 {
        self.cache
    }

    /// Change the number of sections kept mapped.  A smaller limit takes
    /// effect on the next read.
    pub fn set_cache(&mut self, limit: u16) {
        self.cache = limit;
    }

    /// Replace the fallback used for addresses no section covers.
    pub fn set_callback(&mut self, callback: Option<ReadMemoryCallback>) {
        self.callback = callback;
    }

    /// Add `section` at `vaddr` in `asid` (None means every address space).
    ///
    /// Existing entries in matching address spaces are shrunk, split, or
    /// removed to make room.  Adding the same file range at the same place
    /// again is a no-op.  On error the image is left exactly as it was.
    pub fn add(&mut self, section: &SectionSharedPtr, asid: Option<&Asid>, vaddr: u64) -> Result<()> {
        let asid = asid.copied().unwrap_or_default();
        let size = section.borrow().size();
        let begin = vaddr;
        let end = begin.checked_add(size).ok_or(Error::Invalid)?;
        let filename = section.borrow().filename().to_owned();

        let mut pending = vec![SectionEntry {
            msec: MappedSection::new(Rc::clone(section), asid, vaddr),
            mapped: false,
            next: None,
        }];
        let mut removed: Vec<SectionEntry> = Vec::new();
        let mut status: Result<()> = Ok(());

        let mut prev: Option<usize> = None;
        let mut cur = self.sections.head;
        while let Some(idx) = cur {
            let next = self.sections.next_of(idx);
            {
                let entry = self.sections.entry(idx);
                if !entry.msec.matches_asid(&asid) {
                    prev = Some(idx);
                    cur = next;
                    continue;
                }

                let lbegin = entry.msec.begin();
                let lend = entry.msec.end();
                if end <= lbegin || lend <= begin {
                    prev = Some(idx);
                    cur = next;
                    continue;
                }

                // The same file at the same place again; nothing to do.
                if lbegin == begin
                    && lend == end
                    && pending.len() == 1
                    && removed.is_empty()
                    && entry.msec.section().borrow().filename() == filename
                {
                    return Ok(());
                }
            }

            let mut entry = self.sections.unlink(prev, idx);
            if entry.mapped {
                let _ = entry.msec.section().borrow_mut().unmap();
                entry.mapped = false;
                self.mapped -= 1;
            }

            let easid = *entry.msec.asid();
            let lbegin = entry.msec.begin();
            let lend = entry.msec.end();
            let loffset = entry.msec.section().borrow().offset();

            if lbegin < begin {
                match Section::subsection(entry.msec.section(), loffset, begin - lbegin) {
                    Ok(sub) => pending.push(SectionEntry {
                        msec: MappedSection::new(sub, easid, lbegin),
                        mapped: false,
                        next: None,
                    }),
                    Err(err) => {
                        status = Err(err);
                        removed.push(entry);
                        break;
                    }
                }
            }
            if end < lend {
                match Section::subsection(entry.msec.section(), loffset + (end - lbegin), lend - end) {
                    Ok(sub) => pending.push(SectionEntry {
                        msec: MappedSection::new(sub, easid, end),
                        mapped: false,
                        next: None,
                    }),
                    Err(err) => {
                        status = Err(err);
                        removed.push(entry);
                        break;
                    }
                }
            }

            removed.push(entry);
            cur = next;
        }

        match status {
            Err(err) => {
                // Roll back.  The new entries are dropped; everything we
                // detached goes back in.
                for entry in removed {
                    self.sections.push_tail(entry);
                }
                Err(err)
            }
            Ok(()) => {
                drop(removed);
                log!(LogDebug, "add {} [{:#x}, {:#x}) {}", filename, begin, end, asid);
                for entry in pending {
                    self.sections.push_tail(entry);
                }
                Ok(())
            }
        }
    }

    /// Construct a section for `[offset, offset + size)` of the file at
    /// `filename` and add it.  The image list keeps the only reference.
    pub fn add_file(
        &mut self,
        filename: &str,
        offset: u64,
        size: u64,
        asid: Option<&Asid>,
        vaddr: u64,
    ) -> Result<()> {
        let section = Section::new(filename, offset, size)?;
        self.add(&section, asid, vaddr)
    }

    /// Remove the first entry binding exactly `section` at `vaddr` in a
    /// matching address space.
    pub fn remove(&mut self, section: &SectionSharedPtr, asid: Option<&Asid>, vaddr: u64) -> Result<()> {
        let asid = asid.copied().unwrap_or_default();

        let mut prev: Option<usize> = None;
        let mut cur = self.sections.head;
        while let Some(idx) = cur {
            let next = self.sections.next_of(idx);
            let found = {
                let entry = self.sections.entry(idx);
                entry.msec.matches_asid(&asid)
                    && Rc::ptr_eq(entry.msec.section(), section)
                    && entry.msec.vaddr() == vaddr
            };
            if found {
                let entry = self.sections.unlink(prev, idx);
                log!(LogDebug, "remove {}", entry.msec);
                self.release_entry(entry);
                return Ok(());
            }
            prev = Some(idx);
            cur = next;
        }

        Err(Error::BadImage)
    }

    /// Remove every entry backed by `filename` in a matching address space.
    /// Returns the number of entries removed.
    pub fn remove_by_filename(&mut self, filename: &str, asid: Option<&Asid>) -> usize {
        let asid = asid.copied().unwrap_or_default();

        let mut removed = 0;
        let mut prev: Option<usize> = None;
        let mut cur = self.sections.head;
        while let Some(idx) = cur {
            let next = self.sections.next_of(idx);
            let found = {
                let entry = self.sections.entry(idx);
                entry.msec.matches_asid(&asid)
                    && entry.msec.section().borrow().filename() == filename
            };
            if found {
                let entry = self.sections.unlink(prev, idx);
                self.release_entry(entry);
                removed += 1;
            } else {
                prev = Some(idx);
            }
            cur = next;
        }

        removed
    }

    /// Remove every entry in a matching address space.  Returns the number
    /// of entries removed.
    pub fn remove_by_asid(&mut self, asid: Option<&Asid>) -> usize {
        let asid = asid.copied().unwrap_or_default();

        let mut removed = 0;
        let mut prev: Option<usize> = None;
        let mut cur = self.sections.head;
        while let Some(idx) = cur {
            let next = self.sections.next_of(idx);
            let found = self.sections.entry(idx).msec.matches_asid(&asid);
            if found {
                let entry = self.sections.unlink(prev, idx);
                self.release_entry(entry);
                removed += 1;
            } else {
                prev = Some(idx);
            }
            cur = next;
        }

        removed
    }

    /// Add all of `src`'s entries to this image, sharing the sections.
    /// Additions that fail are skipped; returns how many were.
    pub fn copy(&mut self, src: &Image) -> usize {
        let mut ignored = 0;
        for entry in src.sections.iter() {
            let section = Rc::clone(entry.msec.section());
            let asid = *entry.msec.asid();
            if self.add(&section, Some(&asid), entry.msec.vaddr()).is_err() {
                ignored += 1;
            }
        }
        ignored
    }

    /// Read at most `buf.len()` bytes from `addr` in `asid`.
    ///
    /// Returns the number of bytes read; a read never crosses the boundary
    /// of the entry that answers it.  If no section covers `addr` the
    /// fallback callback is consulted.
    pub fn read(&mut self, buf: &mut [u8], asid: &Asid, addr: u64) -> Result<usize> {
        // Sections up to the first unmapped entry can answer without any
        // mapping work.
        let mut prev: Option<usize> = None;
        let mut cur = self.sections.head;
        while let Some(idx) = cur {
            if !self.sections.entry(idx).mapped {
                break;
            }

            match self.sections.entry(idx).msec.read_mapped(buf, asid, addr) {
                Ok(n) => {
                    self.sections.promote(prev, idx);
                    return Ok(n);
                }
                Err(_) => {
                    prev = Some(idx);
                    cur = self.sections.next_of(idx);
                }
            }
        }

        self.read_cold(prev, cur, buf, asid, addr)
    }

    /// Continue a read in the unmapped tail of the list, mapping sections
    /// speculatively.
    fn read_cold(
        &mut self,
        mut prev: Option<usize>,
        mut cur: Option<usize>,
        buf: &mut [u8],
        asid: &Asid,
        addr: u64,
    ) -> Result<usize> {
        while let Some(idx) = cur {
            let was_mapped = self.sections.entry(idx).mapped;
            let section = Rc::clone(self.sections.entry(idx).msec.section());
            if !was_mapped {
                section.borrow_mut().map()?;
            }

            let n = match self.sections.entry(idx).msec.read_mapped(buf, asid, addr) {
                Err(_) => {
                    if !was_mapped {
                        section.borrow_mut().unmap()?;
                    }
                    prev = Some(idx);
                    cur = self.sections.next_of(idx);
                    continue;
                }
                Ok(n) => n,
            };

            self.sections.promote(prev, idx);

            if !was_mapped {
                if self.cache == 0 {
                    section.borrow_mut().unmap()?;
                } else {
                    self.sections.entry_mut(idx).mapped = true;
                    self.mapped += 1;
                    if self.cache < self.mapped {
                        self.prune_cache()?;
                    }
                }
            }

            return Ok(n);
        }

        match self.callback.as_mut() {
            Some(callback) => callback(buf, asid, addr),
            None => Err(Error::NoMap),
        }
    }

    /// Unmap mapped entries beyond the cache limit, in list order.
    ///
    /// We traverse the entire list.  It isn't very long and this allows us
    /// to fix up any previous unmap errors.  The first error is reported but
    /// does not stop the pass.
    fn prune_cache(&mut self) -> Result<()> {
        let cache = self.cache;
        let mut status: Result<()> = Ok(());
        let mut mapped: u16 = 0;

        let mut cur = self.sections.head;
        while let Some(idx) = cur {
            let next = self.sections.next_of(idx);
            if self.sections.entry(idx).mapped {
                mapped += 1;
                if cache < mapped {
                    let section = Rc::clone(self.sections.entry(idx).msec.section());
                    let result = section.borrow_mut().unmap();
                    match result {
                        Ok(()) => {
                            self.sections.entry_mut(idx).mapped = false;
                            mapped -= 1;
                        }
                        Err(err) => {
                            if status.is_ok() {
                                status = Err(err);
                            }
                        }
                    }
                }
            }
            cur = next;
        }

        self.mapped = mapped;
        status
    }

    /// Drop an unlinked entry, giving up its mapping and its section
    /// reference.
    fn release_entry(&mut self, entry: SectionEntry) {
        if entry.mapped {
            let _ = entry.msec.section().borrow_mut().unmap();
            self.mapped -= 1;
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let mut cur = self.sections.head;
        while let Some(idx) = cur {
            cur = self.sections.next_of(idx);
            let entry = self.sections.entry(idx);
            if entry.mapped {
                let _ = entry.msec.section().borrow_mut().unmap();
            }
        }
    }
}
