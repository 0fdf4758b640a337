//! Trap runtime configuration
//!
//! All sizes are resolved against the OS page size when the runtime or a
//! thread's guard zones are set up, so the defaults stay portable between
//! 4 KiB and 16 KiB page systems.

use crate::{
    error::{RuntimeError, RuntimeResult},
    os,
    stubs::STUB_SIZE,
};

/// Default number of recoverable (yellow) guard pages per thread
pub const DEFAULT_YELLOW_ZONE_PAGES: usize = 2;

/// Default number of unrecoverable (red) guard pages per thread
pub const DEFAULT_RED_ZONE_PAGES: usize = 1;

/// Default transition stub arena size: 10 KiB
pub const DEFAULT_STUB_ARENA_SIZE: usize = 10 * 1024;

/// Configuration for the trap runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapConfig {
    /// Pages in the yellow zone. Overflow into these is reported to managed code.
    pub yellow_zone_pages: usize,
    /// Pages in the red zone. Overflow into these is fatal.
    pub red_zone_pages: usize,
    /// Whether guard zones are actually protected with `mprotect`.
    ///
    /// Disabling this keeps the zone bookkeeping but no page will ever fault.
    pub protect_guard_pages: bool,
    /// Size in bytes of the pre-committed transition stub arena
    pub stub_arena_size: usize,
    /// Forward unrecognized faults to handlers installed before ours
    pub use_signal_chaining: bool,
    /// Leave pre-existing foreign handlers in place instead of replacing them
    pub allow_user_signal_handlers: bool,
    /// Allocate the memory serialization page used as a store-buffer barrier
    pub use_serialization_page: bool,
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self {
            yellow_zone_pages: DEFAULT_YELLOW_ZONE_PAGES,
            red_zone_pages: DEFAULT_RED_ZONE_PAGES,
            protect_guard_pages: true,
            stub_arena_size: DEFAULT_STUB_ARENA_SIZE,
            use_signal_chaining: true,
            allow_user_signal_handlers: false,
            use_serialization_page: true,
        }
    }
}

impl TrapConfig {
    /// Set the guard zone sizes in pages
    pub fn with_guard_pages(mut self, yellow: usize, red: usize) -> Self {
        self.yellow_zone_pages = yellow;
        self.red_zone_pages = red;
        self
    }

    /// Enable or disable `mprotect` of the guard zones
    pub fn with_protected_guard_pages(mut self, protect: bool) -> Self {
        self.protect_guard_pages = protect;
        self
    }

    /// Set the transition stub arena size in bytes
    pub fn with_stub_arena_size(mut self, size: usize) -> Self {
        self.stub_arena_size = size;
        self
    }

    /// Enable or disable forwarding to previously installed handlers
    pub fn with_signal_chaining(mut self, enabled: bool) -> Self {
        self.use_signal_chaining = enabled;
        self
    }

    /// Enable or disable the memory serialization page
    pub fn with_serialization_page(mut self, enabled: bool) -> Self {
        self.use_serialization_page = enabled;
        self
    }

    /// Check that the configuration describes a usable runtime
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.yellow_zone_pages == 0 {
            return Err(RuntimeError::InvalidConfig {
                reason: "yellow zone must span at least one page".into(),
            });
        }
        if self.red_zone_pages == 0 {
            return Err(RuntimeError::InvalidConfig {
                reason: "red zone must span at least one page".into(),
            });
        }
        if self.stub_arena_size < STUB_SIZE {
            return Err(RuntimeError::InvalidConfig {
                reason: format!(
                    "stub arena of {} bytes cannot hold a single {STUB_SIZE}-byte stub",
                    self.stub_arena_size
                ),
            });
        }
        Ok(())
    }

    /// Yellow zone size in bytes
    pub fn yellow_zone_size(&self) -> usize {
        self.yellow_zone_pages * os::page_size()
    }

    /// Red zone size in bytes
    pub fn red_zone_size(&self) -> usize {
        self.red_zone_pages * os::page_size()
    }

    /// Number of stubs the arena holds per generation
    pub fn stub_capacity(&self) -> usize {
        self.stub_arena_size / STUB_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TrapConfig::default();
        config.validate().expect("default config should validate");
        assert_eq!(config.stub_capacity(), DEFAULT_STUB_ARENA_SIZE / STUB_SIZE);
    }

    #[test]
    fn test_zero_sized_zones_rejected() {
        let config = TrapConfig::default().with_guard_pages(0, 1);
        assert!(matches!(
            config.validate(),
            Err(RuntimeError::InvalidConfig { .. })
        ));

        let config = TrapConfig::default().with_guard_pages(2, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_arena_rejected() {
        let config = TrapConfig::default().with_stub_arena_size(STUB_SIZE - 1);
        assert!(config.validate().is_err());

        let config = TrapConfig::default().with_stub_arena_size(STUB_SIZE);
        config.validate().expect("one stub should be enough");
        assert_eq!(config.stub_capacity(), 1);
    }

    #[test]
    fn test_zone_sizes_follow_page_size() {
        let config = TrapConfig::default().with_guard_pages(3, 2);
        assert_eq!(config.yellow_zone_size(), 3 * os::page_size());
        assert_eq!(config.red_zone_size(), 2 * os::page_size());
    }
}
