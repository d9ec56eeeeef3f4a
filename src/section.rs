//! File-backed sections.  A section names a byte range of a file on disk;
//! its content only becomes readable once the section is mapped.  Sections
//! are shared between images through `SectionSharedPtr` and never touch the
//! filesystem before the first `map()`.

use crate::error::{Error, Result};
use crate::log::{LogDebug, LogError};
use crate::scoped_fd::ScopedFd;
use crate::util::floor_page_size;
use libc::{c_void, off_t};
use nix::sys::stat::fstat;
use std::cell::RefCell;
use std::ptr;
use std::rc::Rc;
use std::slice;

pub type SectionSharedPtr = Rc<RefCell<Section>>;

/// The mmap'd byte window of a mapped section.  `base` is page aligned;
/// the first section byte sits `delta` bytes into the window.
#[derive(Debug, PartialEq)]
struct MappedRange {
    base: *mut c_void,
    map_len: usize,
    delta: usize,
    size: usize,
}

impl MappedRange {
    fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts((self.base as *const u8).add(self.delta), self.size) }
    }
}

/// A byte range `[offset, offset + size)` of the file at `filename`.
///
/// Identity is immutable after creation.  Mapping is nest counted: `map()`
/// creates the byte window on the first call and `unmap()` destroys it when
/// the count returns to zero.
#[derive(Debug, PartialEq)]
pub struct Section {
    filename: String,
    offset: u64,
    size: u64,
    mapping: Option<MappedRange>,
    mcount: u32,
    /// Remaining `subsection` calls allowed to succeed, if limited.
    #[cfg(test)]
    pub(crate) subsection_budget: Option<u32>,
}

impl Section {
    /// An empty section is not allowed; everything else is taken on faith
    /// until `map()` inspects the file.
    pub fn new(filename: &str, offset: u64, size: u64) -> Result<SectionSharedPtr> {
        if size == 0 {
            return Err(Error::Invalid);
        }
        offset.checked_add(size).ok_or(Error::Invalid)?;

        Ok(Rc::new(RefCell::new(Section {
            filename: filename.to_owned(),
            offset,
            size,
            mapping: None,
            mcount: 0,
            #[cfg(test)]
            subsection_budget: None,
        })))
    }

    /// A new section covering a subrange of `parent`'s file range.  The
    /// child maps its own window and stays usable after the parent is gone.
    pub fn subsection(parent: &SectionSharedPtr, offset: u64, size: u64) -> Result<SectionSharedPtr> {
        #[cfg(test)]
        {
            let mut p = parent.borrow_mut();
            if let Some(left) = p.subsection_budget {
                if left == 0 {
                    return Err(Error::NoMem);
                }
                p.subsection_budget = Some(left - 1);
            }
        }

        let p = parent.borrow();
        if size == 0 {
            return Err(Error::Invalid);
        }
        let end = offset.checked_add(size).ok_or(Error::Invalid)?;
        if offset < p.offset || p.offset + p.size < end {
            return Err(Error::Invalid);
        }

        Section::new(&p.filename, offset, size)
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.mcount > 0
    }

    /// Make the section's bytes readable.  Nested calls only bump the map
    /// count; the window is created once.
    pub fn map(&mut self) -> Result<()> {
        if self.mcount > 0 {
            self.mcount += 1;
            return Ok(());
        }

        let fd = ScopedFd::open_ro(self.filename.as_str()).map_err(|_| Error::Invalid)?;
        let st = fstat(fd.as_raw()).map_err(|_| Error::Invalid)?;
        let end = self.offset + self.size;
        if (st.st_size as u64) < end {
            return Err(Error::Invalid);
        }

        let map_off = floor_page_size(self.offset);
        let delta = (self.offset - map_off) as usize;
        let map_len = self.size as usize + delta;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd.as_raw(),
                map_off as off_t,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::NoMem);
        }

        self.mapping = Some(MappedRange {
            base,
            map_len,
            delta,
            size: self.size as usize,
        });
        self.mcount = 1;
        log!(LogDebug, "mapped {} [{:#x}, {:#x})", self.filename, self.offset, end);
        Ok(())
    }

    /// Undo one `map()`.  If releasing the window fails the section stays
    /// mapped and the caller may retry.
    pub fn unmap(&mut self) -> Result<()> {
        if self.mcount == 0 {
            return Err(Error::Internal);
        }
        if self.mcount > 1 {
            self.mcount -= 1;
            return Ok(());
        }

        let range = self.mapping.take().ok_or(Error::Internal)?;
        let ret = unsafe { libc::munmap(range.base, range.map_len) };
        if ret != 0 {
            self.mapping = Some(range);
            return Err(Error::Internal);
        }

        self.mcount = 0;
        log!(LogDebug, "unmapped {} [{:#x}, {:#x})", self.filename, self.offset, self.offset + self.size);
        Ok(())
    }

    /// Copy bytes starting `offset` bytes into the section.  Truncates at
    /// the section end; a read at or past the end is an error.
    pub fn read_mapped(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let range = self.mapping.as_ref().ok_or(Error::NotMapped)?;
        if offset >= self.size {
            return Err(Error::NoMap);
        }

        let begin = offset as usize;
        let window = range.bytes();
        let n = buf.len().min(window.len() - begin);
        buf[..n].copy_from_slice(&window[begin..begin + n]);
        Ok(n)
    }
}

impl Drop for Section {
    fn drop(&mut self) {
        if let Some(range) = self.mapping.take() {
            let ret = unsafe { libc::munmap(range.base, range.map_len) };
            if ret != 0 {
                log!(LogError, "failed to unmap {} on drop", self.filename);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestFile;

    fn counting_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn empty_section_rejected() {
        assert!(Section::new("/a", 0, 0).is_err());
    }

    #[test]
    fn construction_is_lazy() {
        let section = Section::new("/definitely/not/there", 0, 16).unwrap();
        assert_eq!("/definitely/not/there", section.borrow().filename());
        assert_eq!(Err(Error::Invalid), section.borrow_mut().map());
    }

    #[test]
    fn map_read_unmap() {
        let file = TestFile::new("secmap", &counting_bytes(16));
        let section = Section::new(file.path(), 0, 16).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(
            Err(Error::NotMapped),
            section.borrow().read_mapped(&mut buf, 0)
        );

        section.borrow_mut().map().unwrap();
        assert!(section.borrow().is_mapped());
        assert_eq!(Ok(4), section.borrow().read_mapped(&mut buf, 4));
        assert_eq!([4, 5, 6, 7], buf);

        section.borrow_mut().unmap().unwrap();
        assert!(!section.borrow().is_mapped());
        assert_eq!(
            Err(Error::NotMapped),
            section.borrow().read_mapped(&mut buf, 4)
        );
    }

    #[test]
    fn nested_map_counting() {
        let file = TestFile::new("secnest", &counting_bytes(16));
        let section = Section::new(file.path(), 0, 16).unwrap();
        let mut buf = [0u8; 1];

        section.borrow_mut().map().unwrap();
        section.borrow_mut().map().unwrap();

        section.borrow_mut().unmap().unwrap();
        assert_eq!(Ok(1), section.borrow().read_mapped(&mut buf, 0));

        section.borrow_mut().unmap().unwrap();
        assert_eq!(
            Err(Error::NotMapped),
            section.borrow().read_mapped(&mut buf, 0)
        );
        assert_eq!(Err(Error::Internal), section.borrow_mut().unmap());
    }

    #[test]
    fn read_truncates_at_end() {
        let file = TestFile::new("sectrunc", &counting_bytes(16));
        let section = Section::new(file.path(), 0, 16).unwrap();
        section.borrow_mut().map().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(Ok(4), section.borrow().read_mapped(&mut buf, 12));
        assert_eq!([12, 13, 14, 15], buf[..4]);
        assert_eq!(Err(Error::NoMap), section.borrow().read_mapped(&mut buf, 16));
        assert_eq!(Err(Error::NoMap), section.borrow().read_mapped(&mut buf, 100));
    }

    #[test]
    fn window_honors_file_offset() {
        let file = TestFile::new("secoff", &counting_bytes(32));
        let section = Section::new(file.path(), 8, 8).unwrap();
        section.borrow_mut().map().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(Ok(8), section.borrow().read_mapped(&mut buf, 0));
        assert_eq!([8, 9, 10, 11, 12, 13, 14, 15], buf);
    }

    #[test]
    fn window_must_lie_inside_file() {
        let file = TestFile::new("secshort", &counting_bytes(16));
        let section = Section::new(file.path(), 8, 16).unwrap();
        assert_eq!(Err(Error::Invalid), section.borrow_mut().map());
    }

    #[test]
    fn subsection_bounds() {
        let parent = Section::new("/a", 0x100, 0x100).unwrap();
        assert!(Section::subsection(&parent, 0x100, 0x100).is_ok());
        assert!(Section::subsection(&parent, 0x180, 0x80).is_ok());
        assert_eq!(
            Err(Error::Invalid),
            Section::subsection(&parent, 0x80, 0x100)
        );
        assert_eq!(
            Err(Error::Invalid),
            Section::subsection(&parent, 0x180, 0x100)
        );
        assert_eq!(Err(Error::Invalid), Section::subsection(&parent, 0x100, 0));
    }

    #[test]
    fn subsection_outlives_parent() {
        let file = TestFile::new("secsub", &counting_bytes(32));
        let parent = Section::new(file.path(), 0, 32).unwrap();
        let child = Section::subsection(&parent, 16, 8).unwrap();
        drop(parent);

        child.borrow_mut().map().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(Ok(4), child.borrow().read_mapped(&mut buf, 0));
        assert_eq!([16, 17, 18, 19], buf);
    }

    #[test]
    fn subsection_maps_independently() {
        let file = TestFile::new("secind", &counting_bytes(32));
        let parent = Section::new(file.path(), 0, 32).unwrap();
        let child = Section::subsection(&parent, 8, 8).unwrap();

        parent.borrow_mut().map().unwrap();
        assert!(!child.borrow().is_mapped());

        child.borrow_mut().map().unwrap();
        parent.borrow_mut().unmap().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(Ok(1), child.borrow().read_mapped(&mut buf, 0));
        assert_eq!(8, buf[0]);
    }

    #[test]
    fn subsection_budget_is_enforced() {
        let parent = Section::new("/a", 0, 0x100).unwrap();
        parent.borrow_mut().subsection_budget = Some(1);
        assert!(Section::subsection(&parent, 0, 0x10).is_ok());
        assert_eq!(
            Err(Error::NoMem),
            Section::subsection(&parent, 0x10, 0x10)
        );
    }

    #[test]
    fn sharing_counts_references() {
        let section = Section::new("/a", 0, 0x10).unwrap();
        assert_eq!(1, Rc::strong_count(&section));
        let other = Rc::clone(&section);
        assert_eq!(2, Rc::strong_count(&section));
        drop(other);
        assert_eq!(1, Rc::strong_count(&section));
    }
}
