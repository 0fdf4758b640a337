//! Per-thread stack guard zones
//!
//! Two nested ranges sit just above a thread's stack limit:
//!
//! ```text
//! stack base (high)
//!   ...
//!   +-----------------+ yellow.end
//!   |  yellow zone    |  recoverable: overflow is reported to managed code
//!   +-----------------+ red.end == yellow.start
//!   |  red zone       |  unrecoverable: overflow is fatal
//!   +-----------------+ red.start == page-aligned stack limit
//! stack limit (low)
//! ```
//!
//! The zones are owned by a single thread and only that thread touches them,
//! so state lives in a `Cell`. Transitions are idempotent: a second overflow
//! report for a zone that is already disabled changes nothing.

use std::{cell::Cell, ops::Range};

use crate::{
    config::TrapConfig,
    error::RuntimeResult,
    os::{self, Protection},
    thread::StackBounds,
};

/// Protection state of a thread's guard zones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Both zones are armed
    Enabled,
    /// The yellow zone was given up to let the thread raise an overflow error
    YellowDisabled,
    /// Both zones are open; the thread is about to die
    Disabled,
}

/// Yellow and red guard zones of one thread stack
#[derive(Debug)]
pub struct GuardZones {
    red: Range<usize>,
    yellow: Range<usize>,
    state: Cell<GuardState>,
    protect_pages: bool,
}

impl GuardZones {
    /// Lay out guard zones of the given sizes above the stack limit
    ///
    /// The zones start armed. Call [`GuardZones::protect_initial`] to back them
    /// with real page protection.
    pub fn new(bounds: StackBounds, yellow_size: usize, red_size: usize, protect_pages: bool) -> Self {
        let limit = os::align_up(bounds.limit(), os::page_size());
        let red = limit..limit + red_size;
        let yellow = red.end..red.end + yellow_size;
        Self {
            red,
            yellow,
            state: Cell::new(GuardState::Enabled),
            protect_pages,
        }
    }

    /// Lay out guard zones using the sizes from `config`
    pub fn from_config(bounds: StackBounds, config: &TrapConfig) -> Self {
        Self::new(
            bounds,
            config.yellow_zone_size(),
            config.red_zone_size(),
            config.protect_guard_pages,
        )
    }

    /// Apply `PROT_NONE` to both zones
    ///
    /// Not for use in signal context: it reports failures through
    /// [`RuntimeError`](crate::RuntimeError).
    pub fn protect_initial(&self) -> RuntimeResult<()> {
        if !self.protect_pages {
            return Ok(());
        }
        os::protect_checked(self.red.start..self.yellow.end, Protection::None)
    }

    /// Current protection state
    pub fn state(&self) -> GuardState {
        self.state.get()
    }

    /// Address range of the red zone
    pub fn red_zone(&self) -> Range<usize> {
        self.red.clone()
    }

    /// Address range of the yellow zone
    pub fn yellow_zone(&self) -> Range<usize> {
        self.yellow.clone()
    }

    #[inline]
    pub fn in_yellow_zone(&self, addr: usize) -> bool {
        self.yellow.contains(&addr)
    }

    #[inline]
    pub fn in_red_zone(&self, addr: usize) -> bool {
        self.red.contains(&addr)
    }

    /// Open the yellow zone so the overflowing thread has room to unwind
    ///
    /// Returns `false` if it was already open. Async-signal-safe.
    pub fn disable_yellow(&self) -> bool {
        if self.state.get() != GuardState::Enabled {
            return false;
        }
        self.unprotect(self.yellow.clone());
        self.state.set(GuardState::YellowDisabled);
        true
    }

    /// Open the red zone, opening yellow first if needed
    ///
    /// Returns `false` if the red zone was already open. Async-signal-safe.
    pub fn disable_red(&self) -> bool {
        self.disable_yellow();
        if self.state.get() != GuardState::YellowDisabled {
            return false;
        }
        self.unprotect(self.red.clone());
        self.state.set(GuardState::Disabled);
        true
    }

    /// Re-arm both zones once the stack has unwound past the yellow zone
    ///
    /// Returns `true` if the zones were re-armed, `false` if they were already
    /// armed or `sp` is still too deep. Must only be called while unwinding,
    /// never from the fault handler.
    pub fn reenable(&self, sp: usize) -> bool {
        if self.state.get() == GuardState::Enabled || sp <= self.yellow.end {
            return false;
        }
        if self.protect_pages && !os::protect(self.red.start..self.yellow.end, Protection::None) {
            return false;
        }
        self.state.set(GuardState::Enabled);
        true
    }

    /// Drop protection from both zones for good, e.g. when the thread detaches
    ///
    /// The stack may be reused by a later thread, which lays out its own zones.
    pub fn release(&self) {
        if self.state.replace(GuardState::Disabled) != GuardState::Disabled {
            self.unprotect(self.red.start..self.yellow.end);
        }
    }

    fn unprotect(&self, range: Range<usize>) {
        if self.protect_pages {
            // A failure here leaves the page armed and the thread faults again
            // into the same zone, which the state machine then treats as handled.
            os::protect(range, Protection::ReadWrite);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zones() -> GuardZones {
        let page = os::page_size();
        // 64 pages of stack, base page-aligned so the limit is too
        let bounds = StackBounds::new(0x1000_0000, 64 * page);
        GuardZones::new(bounds, 2 * page, page, false)
    }

    #[test]
    fn test_zone_layout() {
        let page = os::page_size();
        let zones = zones();
        let limit = 0x1000_0000 - 64 * page;
        assert_eq!(zones.red_zone(), limit..limit + page);
        assert_eq!(zones.yellow_zone(), limit + page..limit + 3 * page);
        assert!(zones.in_red_zone(limit));
        assert!(!zones.in_yellow_zone(limit));
        assert!(zones.in_yellow_zone(limit + page));
        assert!(!zones.in_yellow_zone(limit + 3 * page));
    }

    #[test]
    fn test_release_opens_both_zones() {
        let zones = zones();
        zones.release();
        assert_eq!(zones.state(), GuardState::Disabled);
        zones.release();
        assert!(!zones.disable_red());
    }

    #[test]
    fn test_disable_yellow_is_idempotent() {
        let zones = zones();
        assert!(zones.disable_yellow());
        assert_eq!(zones.state(), GuardState::YellowDisabled);
        assert!(!zones.disable_yellow());
        assert_eq!(zones.state(), GuardState::YellowDisabled);
    }

    #[test]
    fn test_disable_red_disables_yellow_first() {
        let zones = zones();
        assert!(zones.disable_red());
        assert_eq!(zones.state(), GuardState::Disabled);
        assert!(!zones.disable_red());
        assert!(!zones.disable_yellow());
    }

    #[test]
    fn test_reenable_requires_unwound_stack() {
        let zones = zones();
        zones.disable_yellow();

        let too_deep = zones.yellow_zone().end - 8;
        assert!(!zones.reenable(too_deep));
        assert_eq!(zones.state(), GuardState::YellowDisabled);

        let unwound = zones.yellow_zone().end + 4096;
        assert!(zones.reenable(unwound));
        assert_eq!(zones.state(), GuardState::Enabled);
        assert!(!zones.reenable(unwound), "already armed");
    }

    #[test]
    fn test_protected_zones_on_real_mapping() {
        let page = os::page_size();
        let len = 8 * page;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED);
        let base = base as usize;

        let zones = GuardZones::new(StackBounds::new(base + len, len), 2 * page, page, true);
        zones.protect_initial().expect("protect should succeed");
        assert!(zones.disable_red());
        assert!(zones.reenable(base + len));
        // Leave the mapping writable before unmapping it
        assert!(os::protect(base..base + len, Protection::ReadWrite));

        unsafe { libc::munmap(base as *mut libc::c_void, len) };
    }
}
