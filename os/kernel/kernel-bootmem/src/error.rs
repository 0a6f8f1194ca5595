use crate::Phase;
use kernel_memblock::MemBlockError;

/// Failures that stop early memory initialization.
///
/// Optional steps (ramdisk, crash kernel, core-dump header, firmware
/// reservations) never surface here; they log a warning and move on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootMemoryError {
    #[error("firmware described no usable memory")]
    NoMemory,
    #[error("failed to reserve the kernel image: {0}")]
    KernelImage(MemBlockError),
    #[error("failed to reserve the early page tables: {0}")]
    PageTables(MemBlockError),
    #[error("boot memory phase {found:?} requested while {expected:?} is due")]
    PhaseOrder { expected: Phase, found: Phase },
    #[error(transparent)]
    MemBlock(#[from] MemBlockError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_cause() {
        let err = BootMemoryError::PhaseOrder {
            expected: Phase::Populate,
            found: Phase::HandOff,
        };
        assert_eq!(
            err.to_string(),
            "boot memory phase HandOff requested while Populate is due"
        );

        let err = BootMemoryError::from(MemBlockError::OutOfMemory);
        assert_eq!(err.to_string(), MemBlockError::OutOfMemory.to_string());
    }
}
