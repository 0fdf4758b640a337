//! Memory serialization page
//!
//! A cheap store-buffer barrier for platforms without one: every managed
//! thread writes its state transitions to a shared page, and a thread that
//! needs to observe those transitions briefly write-protects the page. The
//! kernel's TLB shootdown for the `mprotect` forces each writer's pending
//! stores out, and any writer that hits the protected page faults, waits in the
//! handler until the page is writable again, and retries the store.

use std::{
    io,
    ops::Range,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
};

use crossbeam_utils::Backoff;

use crate::{
    error::{RuntimeError, RuntimeResult},
    os::{self, Protection},
    safepoint::spin_wait,
};

/// One shared page used as a write barrier
pub struct SerializationPage {
    page: NonNull<u8>,
    len: usize,
    armed: AtomicBool,
    serializer: Mutex<()>,
}

// Safety: the page is only ever accessed through volatile writes and mprotect
unsafe impl Send for SerializationPage {}
unsafe impl Sync for SerializationPage {}

impl SerializationPage {
    /// Map a fresh read-write page
    pub fn new() -> RuntimeResult<Self> {
        let len = os::page_size();
        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if page == libc::MAP_FAILED {
            return Err(RuntimeError::MapError {
                what: "memory serialization page",
                reason: io::Error::last_os_error().to_string(),
            });
        }
        let page = NonNull::new(page as *mut u8).ok_or_else(|| RuntimeError::MapError {
            what: "memory serialization page",
            reason: "mmap returned null".into(),
        })?;
        Ok(Self {
            page,
            len,
            armed: AtomicBool::new(false),
            serializer: Mutex::new(()),
        })
    }

    pub fn address(&self) -> usize {
        self.page.as_ptr() as usize
    }

    pub fn range(&self) -> Range<usize> {
        self.address()..self.address() + self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.range().contains(&addr)
    }

    /// Publish a state transition of the thread identified by `slot`
    ///
    /// Faults while the page is being serialized; the fault handler retries the
    /// store once [`SerializationPage::serialize`] is done.
    #[inline]
    pub fn write_state(&self, slot: usize) {
        let offset = slot.wrapping_mul(4) % self.len;
        // Safety: offset is 4-aligned and inside the mapped page
        unsafe { std::ptr::write_volatile(self.page.as_ptr().add(offset) as *mut u32, 1) };
    }

    /// Flush every writer's store buffer
    pub fn serialize(&self) {
        let _serializer = self
            .serializer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.armed.store(true, Ordering::SeqCst);
        if !os::protect(self.range(), Protection::Read) {
            tracing::warn!(
                page = self.address(),
                error = %io::Error::last_os_error(),
                "memory serialization page protection failed"
            );
        }
        if !restore_writable(self.range()) {
            // Writers would spin in the fault handler forever
            tracing::error!(
                page = self.address(),
                error = %io::Error::last_os_error(),
                "memory serialization page stuck read-only"
            );
            std::process::abort();
        }
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Whether a serialization is in progress
    pub fn is_serializing(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Wait until the page is writable again. Async-signal-safe.
    pub fn block_while_serializing(&self) {
        spin_wait(|| !self.armed.load(Ordering::SeqCst));
    }
}

/// Attempts at making a serialization page writable again
const RESTORE_ATTEMPTS: usize = 8;

/// Make `range` read-write, retrying transient failures
fn restore_writable(range: Range<usize>) -> bool {
    let backoff = Backoff::new();
    for _ in 0..RESTORE_ATTEMPTS {
        if os::protect(range.clone(), Protection::ReadWrite) {
            return true;
        }
        backoff.snooze();
    }
    false
}

impl Drop for SerializationPage {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.page.as_ptr() as *mut libc::c_void, self.len) };
    }
}

impl std::fmt::Debug for SerializationPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializationPage")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("serializing", &self.is_serializing())
            .finish()
    }
}
