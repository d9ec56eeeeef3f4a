use crate::asid::Asid;
use crate::error::{Error, Result};
use crate::section::SectionSharedPtr;
use std::fmt::{Display, Formatter};

/// A section bound to a virtual address in one address space.
///
/// Byte 0 of the section appears at `vaddr`; the binding covers
/// `[begin(), end())`.  The binding itself is immutable.
pub struct MappedSection {
    section: SectionSharedPtr,
    asid: Asid,
    vaddr: u64,
}

impl MappedSection {
    pub fn new(section: SectionSharedPtr, asid: Asid, vaddr: u64) -> MappedSection {
        MappedSection {
            section,
            asid,
            vaddr,
        }
    }

    pub fn section(&self) -> &SectionSharedPtr {
        &self.section
    }

    pub fn asid(&self) -> &Asid {
        &self.asid
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    pub fn begin(&self) -> u64 {
        self.vaddr
    }

    pub fn end(&self) -> u64 {
        self.vaddr + self.section.borrow().size()
    }

    pub fn matches_asid(&self, asid: &Asid) -> bool {
        self.asid.matches(asid)
    }

    /// Read from `addr` in `asid`.  Returns up to `min(buf.len(), end() - addr)`
    /// bytes; never crosses the end of this binding.
    pub fn read_mapped(&self, buf: &mut [u8], asid: &Asid, addr: u64) -> Result<usize> {
        if !self.matches_asid(asid) {
            return Err(Error::NoMap);
        }
        if addr < self.begin() || self.end() <= addr {
            return Err(Error::NoMap);
        }

        self.section.borrow().read_mapped(buf, addr - self.vaddr)
    }
}

impl Display for MappedSection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let section = self.section.borrow();
        write!(
            f,
            "{:#x}-{:#x} {} {}",
            self.begin(),
            self.end(),
            self.asid,
            section.filename()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::section::Section;
    use crate::testutil::TestFile;

    fn counting_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn begin_end() {
        let section = Section::new("/a", 0, 0x100).unwrap();
        let msec = MappedSection::new(section, Asid::default(), 0x10000);
        assert_eq!(0x10000, msec.begin());
        assert_eq!(0x10100, msec.end());
    }

    #[test]
    fn asid_gates_reads() {
        let file = TestFile::new("msecasid", &counting_bytes(16));
        let section = Section::new(file.path(), 0, 16).unwrap();
        section.borrow_mut().map().unwrap();
        let msec = MappedSection::new(section, Asid::new(Some(1), None), 0);

        let mut buf = [0u8; 4];
        let other = Asid::new(Some(2), None);
        assert_eq!(Err(Error::NoMap), msec.read_mapped(&mut buf, &other, 0));
        assert_eq!(Ok(4), msec.read_mapped(&mut buf, &Asid::default(), 0));
    }

    #[test]
    fn reads_are_translated_to_file_offsets() {
        let file = TestFile::new("msecoff", &counting_bytes(32));
        let section = Section::new(file.path(), 8, 16).unwrap();
        section.borrow_mut().map().unwrap();
        let msec = MappedSection::new(section, Asid::default(), 0x100);

        let mut buf = [0u8; 4];
        assert_eq!(Ok(4), msec.read_mapped(&mut buf, &Asid::default(), 0x104));
        // vaddr 0x104 is 4 bytes into the section, which starts at file
        // offset 8.
        assert_eq!([12, 13, 14, 15], buf);
    }

    #[test]
    fn reads_stop_at_the_binding() {
        let file = TestFile::new("msecend", &counting_bytes(16));
        let section = Section::new(file.path(), 0, 16).unwrap();
        section.borrow_mut().map().unwrap();
        let msec = MappedSection::new(section, Asid::default(), 0x100);

        let mut buf = [0u8; 8];
        let any = Asid::default();
        assert_eq!(Ok(2), msec.read_mapped(&mut buf, &any, 0x10e));
        assert_eq!([14, 15], buf[..2]);
        assert_eq!(Err(Error::NoMap), msec.read_mapped(&mut buf, &any, 0x110));
        assert_eq!(Err(Error::NoMap), msec.read_mapped(&mut buf, &any, 0xff));
    }

    #[test]
    fn unmapped_section_reports_lifecycle_error() {
        let file = TestFile::new("msecunmapped", &counting_bytes(16));
        let section = Section::new(file.path(), 0, 16).unwrap();
        let msec = MappedSection::new(section, Asid::default(), 0);

        let mut buf = [0u8; 4];
        assert_eq!(
            Err(Error::NotMapped),
            msec.read_mapped(&mut buf, &Asid::default(), 0)
        );
    }
}
