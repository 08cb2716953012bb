use thiserror::Error;

/// Why an allocation request failed.
///
/// Every failure leaves the heap exactly as it was before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("cannot allocate a zero-sized block")]
    ZeroSize,

    #[error("requested {requested} bytes, more than the {max} byte limit for one block")]
    TooLarge { requested: usize, max: usize },

    #[error("{count} elements of {unit_size} bytes overflows the size domain")]
    Overflow { count: usize, unit_size: usize },

    /// The growth primitive could not extend the region by `requested` bytes.
    #[error("out of memory: could not grow the heap by {requested} bytes")]
    OutOfMemory { requested: usize },
}

impl AllocError {
    /// Whether the request itself was unacceptable, as opposed to the heap
    /// running out of room.
    pub fn is_invalid_argument(&self) -> bool {
        !matches!(self, AllocError::OutOfMemory { .. })
    }
}
