use kernel_memory_addresses::PhysicalAddress;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemBlockError {
    /// A region array is full and growth has not been enabled.
    #[error("{set} region array is full and can't be resized")]
    ResizeDisabled { set: &'static str },
    #[error("no free memory range satisfies the request")]
    OutOfMemory,
    #[error("range {base:?}+{size:#x} overlaps an existing reservation")]
    AlreadyReserved { base: PhysicalAddress, size: u64 },
    #[error("range {base:?}+{size:#x} is not fully backed by memory")]
    NotMemory { base: PhysicalAddress, size: u64 },
    #[error("range {base:?}+{size:#x} overlaps a region on another node")]
    AttributeConflict { base: PhysicalAddress, size: u64 },
    #[error("alignment {0:#x} is not a power of two")]
    InvalidAlignment(u64),
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("memory has been handed off; region sets are read-only")]
    Finalized,
}

impl MemBlockError {
    /// Errors that leave boot without a way forward.
    ///
    /// Everything else describes a request that can be retried differently or
    /// skipped.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ResizeDisabled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_resize_failures_are_fatal() {
        assert!(MemBlockError::ResizeDisabled { set: "reserved" }.is_fatal());
        assert!(!MemBlockError::OutOfMemory.is_fatal());
        assert!(!MemBlockError::Finalized.is_fatal());
    }

    #[test]
    fn messages_name_the_range() {
        let err = MemBlockError::AlreadyReserved {
            base: PhysicalAddress::new(0x1000),
            size: 0x2000,
        };
        assert_eq!(
            err.to_string(),
            "range PA(0x0000000000001000)+0x2000 overlaps an existing reservation"
        );
    }
}
