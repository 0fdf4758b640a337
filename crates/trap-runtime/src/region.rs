//! Executable memory for transition stubs
//!
//! # Platform-Specific Implementation
//!
//! - **macOS**: `MAP_JIT` with `pthread_jit_write_protect_np` for the W^X toggle
//! - **Linux**: `memfd_create` + dual `mmap`, one RW view and one RX view
//!
//! The region is committed once at its final size. Writers go through
//! [`CodeRegion::write`], which the stub allocator serializes; readers only
//! ever look at the executable view.

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::CodeRegion;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::CodeRegion;
