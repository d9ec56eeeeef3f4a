use crate::error::{Error, Result};
use std::fmt::{Display, Formatter};
use std::mem::size_of;

/// Sentinel cr3 value meaning "no cr3".
pub const NO_CR3: u64 = !0u64;
/// Sentinel vmcs base meaning "no vmcs".
pub const NO_VMCS: u64 = !0u64;

/// Identifies one of possibly several coexisting virtual address spaces of
/// traced code.
///
/// A field left at its sentinel acts as a wildcard in [`Asid::matches`]; an
/// asid with both fields at their sentinels matches every address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Asid {
    cr3: u64,
    vmcs: u64,
}

/// The layout in which tooling hands us an address-space identifier.
///
/// `size` says how much of the struct the supplying build actually provides;
/// fields beyond `size` are taken as absent.  This lets older suppliers omit
/// trailing fields and newer suppliers be rejected cleanly.
#[derive(Copy, Clone, Debug)]
pub struct RawAsid {
    pub size: usize,
    pub cr3: u64,
    pub vmcs: u64,
}

impl Default for Asid {
    fn default() -> Asid {
        Asid {
            cr3: NO_CR3,
            vmcs: NO_VMCS,
        }
    }
}

impl Asid {
    pub fn new(cr3: Option<u64>, vmcs: Option<u64>) -> Asid {
        Asid {
            cr3: cr3.unwrap_or(NO_CR3),
            vmcs: vmcs.unwrap_or(NO_VMCS),
        }
    }

    /// Normalize a user-supplied identifier.  A missing identifier means
    /// "any address space".
    pub fn from_raw(raw: Option<&RawAsid>) -> Result<Asid> {
        let raw = match raw {
            None => return Ok(Asid::default()),
            Some(raw) => raw,
        };

        if raw.size > size_of::<RawAsid>() {
            return Err(Error::BadAsid);
        }

        let mut asid = Asid::default();
        if raw.size >= size_of::<usize>() + size_of::<u64>() {
            asid.cr3 = raw.cr3;
        }
        if raw.size >= size_of::<usize>() + 2 * size_of::<u64>() {
            asid.vmcs = raw.vmcs;
        }

        Ok(asid)
    }

    pub fn cr3(&self) -> Option<u64> {
        if self.cr3 == NO_CR3 {
            None
        } else {
            Some(self.cr3)
        }
    }

    pub fn vmcs(&self) -> Option<u64> {
        if self.vmcs == NO_VMCS {
            None
        } else {
            Some(self.vmcs)
        }
    }

    /// True iff both identifiers could name the same address space.  A
    /// sentinel on either side wildcards that field.
    pub fn matches(&self, other: &Asid) -> bool {
        (self.cr3 == NO_CR3 || other.cr3 == NO_CR3 || self.cr3 == other.cr3)
            && (self.vmcs == NO_VMCS || other.vmcs == NO_VMCS || self.vmcs == other.vmcs)
    }
}

impl Display for Asid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.cr3() {
            Some(cr3) => write!(f, "cr3={:#x}", cr3)?,
            None => write!(f, "cr3=*")?,
        }
        match self.vmcs() {
            Some(vmcs) => write!(f, " vmcs={:#x}", vmcs),
            None => write!(f, " vmcs=*"),
        }
    }
}
