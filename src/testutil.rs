use crate::scoped_fd::ScopedFd;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::{getpid, write};
use std::ffi::CString;

/// An anonymous backing file for tests.  The file lives in memory and is
/// reached through its /proc/self/fd path, so nothing is left on disk.
pub struct TestFile {
    #[allow(dead_code)]
    fd: ScopedFd,
    path: String,
}

impl TestFile {
    pub fn new(tag: &str, bytes: &[u8]) -> TestFile {
        let name = CString::new(format!("timg-test-{}-{}", getpid(), tag)).unwrap();
        let fd = ScopedFd::from_raw(memfd_create(&name, MemFdCreateFlag::empty()).unwrap());

        let mut written = 0;
        while written < bytes.len() {
            written += write(fd.as_raw(), &bytes[written..]).unwrap();
        }

        let path = format!("/proc/{}/fd/{}", getpid(), fd.as_raw());
        TestFile { fd, path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}
