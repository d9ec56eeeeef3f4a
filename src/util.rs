use nix::unistd::{sysconf, SysconfVar};
use std::convert::TryInto;

lazy_static! {
    static ref SYSTEM_PAGE_SIZE: usize = page_size_init();
}

fn page_size_init() -> usize {
    sysconf(SysconfVar::PAGE_SIZE).unwrap().unwrap().try_into().unwrap()
}

pub fn page_size() -> usize {
    *SYSTEM_PAGE_SIZE
}

pub fn floor_page_size(off: u64) -> u64 {
    off & !(page_size() as u64 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_test() {
        let page = page_size() as u64;
        assert_eq!(0, floor_page_size(0));
        assert_eq!(0, floor_page_size(page - 1));
        assert_eq!(page, floor_page_size(page));
        assert_eq!(page, floor_page_size(page + 1));
    }
}
