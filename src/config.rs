/// Run-time policy for a heap.
///
/// ```
/// use linked_heap::HeapConfig;
///
/// let config = HeapConfig::new().coalesce_on_release(true);
/// assert!(config.coalesce_on_release);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Merge a released block with its free, address-adjacent neighbours as
    /// soon as it is released. Off by default: merging otherwise only happens
    /// when `defragment` is called.
    pub coalesce_on_release: bool,

    /// Ignore (and log) releases of blocks that are not tagged as allocated,
    /// catching most double releases. On by default in debug builds.
    pub check_release: bool,
}

impl HeapConfig {
    pub const fn new() -> Self {
        HeapConfig {
            coalesce_on_release: false,
            check_release: cfg!(debug_assertions),
        }
    }

    pub const fn coalesce_on_release(self, coalesce: bool) -> Self {
        HeapConfig {
            coalesce_on_release: coalesce,
            ..self
        }
    }

    pub const fn check_release(self, check: bool) -> Self {
        HeapConfig {
            check_release: check,
            ..self
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}
