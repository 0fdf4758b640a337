// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Linux executable region using memfd + dual mmap

use std::{io, os::unix::io::RawFd, ptr::NonNull};

use libc::{c_char, c_uint, c_void, off_t, MAP_FAILED, MAP_SHARED, PROT_EXEC, PROT_READ, PROT_WRITE};

use crate::{
    error::{RuntimeError, RuntimeResult},
    os,
};

extern "C" {
    fn memfd_create(name: *const c_char, flags: c_uint) -> RawFd;
}

#[cfg(target_arch = "aarch64")]
extern "C" {
    fn __clear_cache(start: *mut c_void, end: *mut c_void);
}

/// memfd_create flags
const MFD_CLOEXEC: c_uint = 0x0001;

const REGION_NAME: &[u8] = b"transition-stubs\0";

/// A committed, fixed-size region of executable memory
///
/// Backed by one memfd mapped twice: RW for writing stubs, RX for running
/// them. Both views always show the same bytes.
pub struct CodeRegion {
    rw: NonNull<u8>,
    rx: NonNull<u8>,
    fd: RawFd,
    capacity: usize,
}

// Safety: the region owns its mappings. Concurrent `write`s are excluded by
// the caller's contract; reads of the RX view race only with writes to slots
// the reader has not been handed yet.
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

fn map_error(reason: String) -> RuntimeError {
    RuntimeError::MapError {
        what: "transition stub region",
        reason,
    }
}

impl CodeRegion {
    /// Commit a region of at least `capacity` bytes, rounded up to whole pages
    pub fn allocate(capacity: usize) -> RuntimeResult<Self> {
        let capacity = os::align_up(capacity.max(1), os::page_size());

        let fd = unsafe { memfd_create(REGION_NAME.as_ptr() as *const c_char, MFD_CLOEXEC) };
        if fd < 0 {
            return Err(map_error(format!("memfd_create failed: {}", io::Error::last_os_error())));
        }

        if unsafe { libc::ftruncate(fd, capacity as off_t) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(map_error(format!("ftruncate failed: {err}")));
        }

        let rw = unsafe {
            libc::mmap(std::ptr::null_mut(), capacity, PROT_READ | PROT_WRITE, MAP_SHARED, fd, 0)
        };
        if rw == MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(map_error(format!("mmap RW failed: {err}")));
        }

        let rx = unsafe {
            libc::mmap(std::ptr::null_mut(), capacity, PROT_READ | PROT_EXEC, MAP_SHARED, fd, 0)
        };
        if rx == MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe {
                libc::munmap(rw, capacity);
                libc::close(fd);
            }
            return Err(map_error(format!("mmap RX failed: {err}")));
        }

        // Safety: mmap signals failure with MAP_FAILED, never null
        let (rw, rx) = unsafe {
            (
                NonNull::new_unchecked(rw as *mut u8),
                NonNull::new_unchecked(rx as *mut u8),
            )
        };

        Ok(Self { rw, rx, fd, capacity })
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
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.rw.as_ptr().add(offset), bytes.len());

        #[cfg(target_arch = "aarch64")]
        __clear_cache(
            self.rx.as_ptr().add(offset) as *mut c_void,
            self.rx.as_ptr().add(offset + bytes.len()) as *mut c_void,
        );
    }

    /// Copy bytes out of the executable view
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.capacity, "read past end of region");
        // Safety: bounds checked above, the RX view is readable
        unsafe {
            std::ptr::copy_nonoverlapping(self.rx.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Executable address of `offset`
    pub fn address(&self, offset: usize) -> usize {
        self.rx.as_ptr() as usize + offset
    }

    /// Whether `addr` lies in the executable view
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.rx.as_ptr() as usize;
        addr >= start && addr < start + self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.rw.as_ptr() as *mut c_void, self.capacity);
            libc::munmap(self.rx.as_ptr() as *mut c_void, self.capacity);
            libc::close(self.fd);
        }
    }
}
