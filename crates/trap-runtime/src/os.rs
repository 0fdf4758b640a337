//! Thin wrappers over the OS services used by the trap path
//!
//! Everything here except [`page_size`], [`protect_checked`] and
//! [`current_thread_stack`] is async-signal-safe: plain syscalls, no
//! allocation, no locks.

use std::{io, ops::Range, ptr, sync::OnceLock};

use libc::{c_int, c_void};

use crate::{
    error::{RuntimeError, RuntimeResult},
    thread::StackBounds,
};

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// OS page size, queried once
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    })
}

/// Round `value` up to a multiple of `align` (a power of two)
#[inline]
pub fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Page protection levels used by guard zones and the serialization page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

impl Protection {
    fn flags(self) -> c_int {
        match self {
            Protection::None => libc::PROT_NONE,
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// Change the protection of a page-aligned range. Async-signal-safe.
pub fn protect(range: Range<usize>, protection: Protection) -> bool {
    if range.is_empty() {
        return true;
    }
    let rc = unsafe {
        libc::mprotect(
            range.start as *mut c_void,
            range.end - range.start,
            protection.flags(),
        )
    };
    rc == 0
}

/// Like [`protect`], but reports the OS error
pub fn protect_checked(range: Range<usize>, protection: Protection) -> RuntimeResult<()> {
    if protect(range.clone(), protection) {
        return Ok(());
    }
    Err(RuntimeError::ProtectionError {
        addr: range.start,
        len: range.end - range.start,
        reason: io::Error::last_os_error().to_string(),
    })
}

/// Copy memory at `addr` into `buf` without risking a fault
///
/// Returns the number of bytes copied; unmapped or unreadable memory yields a
/// short (possibly zero) count instead of a signal.
#[cfg(target_os = "linux")]
pub fn read_memory(addr: usize, buf: &mut [u8]) -> usize {
    if addr == 0 || buf.is_empty() {
        return 0;
    }
    let local = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };
    let remote = libc::iovec {
        iov_base: addr as *mut c_void,
        iov_len: buf.len(),
    };
    let copied = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if copied < 0 {
        0
    } else {
        copied as usize
    }
}

/// Without a fault-free copy primitive nothing is read
#[cfg(not(target_os = "linux"))]
pub fn read_memory(_addr: usize, _buf: &mut [u8]) -> usize {
    0
}

/// Write all of `bytes` to stderr with raw `write(2)`. Async-signal-safe.
pub fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let written =
            unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr() as *const c_void, bytes.len()) };
        if written <= 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

/// Query the bounds of the calling thread's stack
#[cfg(target_os = "linux")]
pub fn current_thread_stack() -> RuntimeResult<StackBounds> {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        let rc = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
        if rc != 0 {
            return Err(RuntimeError::StackQueryError {
                reason: io::Error::from_raw_os_error(rc).to_string(),
            });
        }
        let mut stack_addr: *mut c_void = ptr::null_mut();
        let mut stack_size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return Err(RuntimeError::StackQueryError {
                reason: io::Error::from_raw_os_error(rc).to_string(),
            });
        }
        Ok(StackBounds::new(stack_addr as usize + stack_size, stack_size))
    }
}

/// Query the bounds of the calling thread's stack
#[cfg(target_os = "macos")]
pub fn current_thread_stack() -> RuntimeResult<StackBounds> {
    unsafe {
        let this_thread = libc::pthread_self();
        let top = libc::pthread_get_stackaddr_np(this_thread) as usize;
        let size = libc::pthread_get_stacksize_np(this_thread);
        if top == 0 || size == 0 {
            return Err(RuntimeError::StackQueryError {
                reason: "pthread reported an empty stack".into(),
            });
        }
        Ok(StackBounds::new(top, size))
    }
}

/// errno captured on handler entry and restored on exit
pub(crate) struct SavedErrno(c_int);

impl SavedErrno {
    pub(crate) fn save() -> Self {
        Self(unsafe { *errno_location() })
    }

    pub(crate) fn restore(self) {
        unsafe { *errno_location() = self.0 }
    }
}

#[cfg(target_os = "linux")]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno_location()
}

#[cfg(target_os = "macos")]
unsafe fn errno_location() -> *mut c_int {
    libc::__error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(page_size() >= 4096);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_read_memory_of_null_is_empty() {
        let mut buf = [0u8; 8];
        assert_eq!(read_memory(0, &mut buf), 0);
    }

    #[test]
    fn test_read_memory_never_overruns() {
        let source = [0xAAu8; 16];
        let mut buf = [0u8; 16];
        let copied = read_memory(source.as_ptr() as usize, &mut buf);
        assert!(copied <= buf.len());
        assert!(buf[..copied].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_current_thread_stack_contains_local() {
        let local = 0u64;
        let bounds = current_thread_stack().expect("stack query should succeed");
        assert!(
            bounds.contains(&local as *const u64 as usize),
            "stack {:?} should contain a local variable",
            bounds
        );
    }

    #[test]
    fn test_errno_round_trip() {
        unsafe { *errno_location() = 42 };
        let saved = SavedErrno::save();
        unsafe { *errno_location() = 7 };
        saved.restore();
        assert_eq!(unsafe { *errno_location() }, 42);
    }
}
