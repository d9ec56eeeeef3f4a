use crate::log::LogWarn;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;
use nix::NixPath;
use std::os::unix::io::RawFd;

/// Closes the wrapped fd when dropped.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn open_ro<P: ?Sized + NixPath>(path: &P) -> nix::Result<ScopedFd> {
        let fd = open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())?;
        Ok(ScopedFd { fd })
    }

    pub fn from_raw(fd: RawFd) -> ScopedFd {
        ScopedFd { fd }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            if close(self.fd).is_err() {
                log!(LogWarn, "failed to close fd {}", self.fd);
            }
        }

        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_fails() {
        assert!(ScopedFd::open_ro("/definitely/not/there").is_err());
    }

    #[test]
    fn open_and_close() {
        let mut fd = ScopedFd::open_ro("/dev/null").unwrap();
        assert!(fd.is_open());
        fd.close();
        assert!(!fd.is_open());
    }
}
