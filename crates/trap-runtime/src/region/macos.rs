//! macOS executable region using MAP_JIT

use std::{io, ptr::NonNull};

use libc::{
    c_void, size_t, MAP_ANONYMOUS, MAP_FAILED, MAP_JIT, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE,
};

use crate::{
    error::{RuntimeError, RuntimeResult},
    os,
};

extern "C" {
    fn sys_icache_invalidate(start: *mut c_void, len: size_t);
}

#[cfg(target_arch = "aarch64")]
extern "C" {
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
}

/// A committed, fixed-size region of executable memory
///
/// A single MAP_JIT mapping; writes toggle the calling thread's JIT write
/// protection off and back on.
pub struct CodeRegion {
    code: NonNull<u8>,
    capacity: usize,
}

// Safety: the region owns its mapping; see `write` for the writer contract
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

impl CodeRegion {
    /// Commit a region of at least `capacity` bytes, rounded up to whole pages
    pub fn allocate(capacity: usize) -> RuntimeResult<Self> {
        let capacity = os::align_up(capacity.max(1), os::page_size());
        let code = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                PROT_READ | PROT_WRITE | PROT_EXEC,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_JIT,
                -1,
                0,
            )
        };
        if code == MAP_FAILED {
            return Err(RuntimeError::MapError {
                what: "transition stub region",
                reason: format!("mmap failed: {}", io::Error::last_os_error()),
            });
        }
        let code = NonNull::new(code as *mut u8).ok_or_else(|| RuntimeError::MapError {
            what: "transition stub region",
            reason: "mmap returned null".into(),
        })?;
        Ok(Self { code, capacity })
    }

    /// Copy `bytes` into the region at `offset` and make them executable
    ///
    /// # Safety
    ///
    /// Callers must not write concurrently, and `bytes` must be valid machine
    /// code for anyone who may branch to it.
    pub unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + bytes.len() <= self.capacity,
            "write of {} bytes at {offset} overflows region of {}",
            bytes.len(),
            self.capacity
        );

        #[cfg(target_arch = "aarch64")]
        pthread_jit_write_protect_np(0);

        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code.as_ptr().add(offset), bytes.len());

        #[cfg(target_arch = "aarch64")]
        pthread_jit_write_protect_np(1);

        sys_icache_invalidate(self.code.as_ptr().add(offset) as *mut c_void, bytes.len());
    }

    /// Copy bytes out of the region
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.capacity, "read past end of region");
        // Safety: bounds checked above, the mapping is always readable
        unsafe {
            std::ptr::copy_nonoverlapping(self.code.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Executable address of `offset`
    pub fn address(&self, offset: usize) -> usize {
        self.code.as_ptr() as usize + offset
    }

    pub fn contains(&self, addr: usize) -> bool {
        let start = self.code.as_ptr() as usize;
        addr >= start && addr < start + self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.code.as_ptr() as *mut c_void, self.capacity);
        }
    }
}
