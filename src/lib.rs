//! An in-memory model of the virtual address spaces of one or more traced
//! processes.  An instruction-trace decoder replays control flow long after
//! the traced processes are gone; whenever it needs to know "what byte was
//! at this virtual address in this address space", it asks an [`Image`].
//!
//! An image is an ordered collection of file-backed [`Section`]s, each bound
//! to a virtual address in some address space ([`Asid`]).  Sections are
//! shared between images and mapped on demand; the image keeps a bounded
//! number of recently used sections mapped and evicts the rest.

#[macro_use]
extern crate lazy_static;

#[macro_use]
mod log;

pub mod asid;
pub mod error;
pub mod image;
pub mod mapped_section;
pub mod scoped_fd;
pub mod section;
mod util;

#[cfg(test)]
mod testutil;

pub use crate::asid::{Asid, RawAsid};
pub use crate::error::{Error, Result};
pub use crate::image::{Image, ReadMemoryCallback};
pub use crate::mapped_section::MappedSection;
pub use crate::section::{Section, SectionSharedPtr};
