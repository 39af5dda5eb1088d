use crate::SpyError;
use cache_side_channel::{ChannelHandle, ProbeSet};
use cache_utils::mmap::MMappedFile;
use cache_utils::{cache_line_of, page_of};
use core::marker::PhantomData;

/// A probe pinned to an address inside the target mapping.
///
/// Borrows the mapping, so it cannot outlive it.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedProbe<'m> {
    label: char,
    offset: usize,
    address: *const u8,
    _mapping: PhantomData<&'m MMappedFile>,
}

impl ResolvedProbe<'_> {
    pub fn offset(&self) -> usize {
        self.offset
    }
}

// address is inside the borrowed mapping
unsafe impl ChannelHandle for ResolvedProbe<'_> {
    fn label(&self) -> char {
        self.label
    }

    fn to_const_u8_pointer(&self) -> *const u8 {
        self.address
    }
}

/// `raw_address` is an offset from the start of the mapping.
pub fn resolve_offset(raw_address: u64, length: usize) -> Option<usize> {
    usize::try_from(raw_address)
        .ok()
        .filter(|&offset| offset < length)
}

/// Resolve every probe, in order, or none at all.
pub fn resolve<'m>(
    mapping: &'m MMappedFile,
    probes: &ProbeSet,
) -> Result<Vec<ResolvedProbe<'m>>, SpyError> {
    let mut resolved = Vec::with_capacity(probes.len());
    for probe in probes {
        let offset = resolve_offset(probe.raw_address(), mapping.len()).ok_or(
            SpyError::AddressOutOfRange {
                label: probe.label(),
                offset: probe.raw_address(),
                length: mapping.len(),
            },
        )?;
        let address = mapping.base().wrapping_add(offset);
        debug_assert!(mapping.contains(address));
        tracing::debug!(
            label = %probe.label(),
            offset = format_args!("{:#x}", offset),
            line = format_args!("{:#x}", cache_line_of(address)),
            page = format_args!("{:#x}", page_of(address)),
            "resolved probe"
        );
        resolved.push(ResolvedProbe {
            label: probe.label(),
            offset,
            address,
            _mapping: PhantomData,
        });
    }
    Ok(resolved)
}
