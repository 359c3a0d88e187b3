use crate::result::*;

/// A checked cast from u64 to usize
///
/// We could use the `cast` crate,
/// (https://docs.rs/cast/0.2.3/cast/)
/// but this is the only one we really need.
pub fn usize<I: Into<u64>>(i: I) -> ArchiveResult<usize> {
    usize::try_from(i.into()).map_err(|_| ArchiveError::InsufficientAddressSpace)
}
