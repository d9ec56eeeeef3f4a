use std::fmt::{Display, Formatter};

/// Errors reported by images and their sections.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// A precondition the caller was contractually required to meet did not
    /// hold.  Indicates a bug in the caller or in this library.
    Internal,
    /// Malformed user input.
    Invalid,
    /// An allocation or resource reservation failed.
    NoMem,
    /// No section and no read-memory callback covers the requested address.
    NoMap,
    /// The image does not contain the specified entry.
    BadImage,
    /// A malformed address-space identifier.
    BadAsid,
    /// The end of the data stream was reached.
    Eos,
    /// The section does not currently hold a mapping.
    NotMapped,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let desc = match self {
            Error::Internal => "internal error",
            Error::Invalid => "invalid argument",
            Error::NoMem => "out of memory",
            Error::NoMap => "no memory mapped at this address",
            Error::BadImage => "unknown image section",
            Error::BadAsid => "bad address space identifier",
            Error::Eos => "reached end of stream",
            Error::NotMapped => "section not mapped",
        };
        write!(f, "{}", desc)
    }
}

impl std::error::Error for Error {}
