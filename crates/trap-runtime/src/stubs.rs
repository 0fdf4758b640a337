//! Transition stub arena
//!
//! A transition stub is a tiny trampoline that a call site is temporarily
//! pointed at while its real target cannot be patched in atomically. The stub
//! loads a cached value into a fixed register and jumps to the destination.
//!
//! # Lifecycle
//!
//! Stubs are bump-allocated from a fixed executable arena. Each call site has
//! at most one live stub; materializing a second one for the same site clears
//! the first. A cleared stub may still be executing on some thread, so its
//! slot and any resource it owned are only recycled by
//! [`TransitionStubs::reclaim_retired_stubs`], which requires every
//! participant to be stopped at a safepoint. Reclamation commits each live
//! stub's destination directly to its call site, poisons the arena and starts
//! a new generation. Handles from older generations resolve to nothing.
//!
//! # Thread Safety
//!
//! Writers serialize on an internal mutex. Readers (`destination_for`,
//! `cached_value_for`, the `*_of` accessors) take no lock: slot metadata is
//! published with release stores, the call site last.

mod code;

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

pub use code::{decode, emit, poison, CACHED_VALUE_REGISTER, STUB_SIZE};
use crossbeam_queue::ArrayQueue;

use crate::{
    config::TrapConfig,
    error::{RuntimeError, RuntimeResult},
    region::CodeRegion,
    safepoint::{Safepoint, SafepointParticipant},
};

/// Address of a patchable call instruction in generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSite(NonZeroUsize);

impl CallSite {
    /// `None` for the null address
    pub fn new(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    pub fn address(self) -> usize {
        self.0.get()
    }
}

/// Names one materialized stub within one arena generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StubHandle {
    index: u32,
    generation: u64,
}

impl StubHandle {
    /// Slot index in the arena
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// A heap object whose lifetime is tied to the stub that caches it
pub trait AuxResource: Send + Sync {
    /// The machine word loaded into [`CACHED_VALUE_REGISTER`]
    fn word(&self) -> usize;
}

/// Value a stub passes to its destination
pub enum AuxValue {
    /// Plain data, nothing to release
    Word(usize),
    /// Owned by the stub until it is reclaimed or committed to its call site
    Resource(Box<dyn AuxResource>),
}

impl AuxValue {
    pub fn word(&self) -> usize {
        match self {
            Self::Word(word) => *word,
            Self::Resource(resource) => resource.word(),
        }
    }
}

impl From<usize> for AuxValue {
    fn from(word: usize) -> Self {
        Self::Word(word)
    }
}

impl std::fmt::Debug for AuxValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Word(word) => write!(f, "Word({word:#x})"),
            Self::Resource(resource) => write!(f, "Resource({:#x})", resource.word()),
        }
    }
}

/// Rewrites call instructions in generated code
pub trait CallSitePatcher: Send + Sync {
    /// Point `site` at a freshly written stub
    fn redirect(&self, site: CallSite, stub_entry: usize);

    /// Point `site` straight at `destination`, bypassing its stub
    ///
    /// Called only at a safepoint. Ownership of a resource value passes to the
    /// call site.
    fn commit(&self, site: CallSite, destination: usize, cached: AuxValue);
}

/// Lock-free view of one slot
struct StubSlot {
    /// Call site address, 0 when the slot is empty or cleared
    site: AtomicUsize,
    destination: AtomicUsize,
    cached: AtomicUsize,
}

impl StubSlot {
    fn empty() -> Self {
        Self {
            site: AtomicUsize::new(0),
            destination: AtomicUsize::new(0),
            cached: AtomicUsize::new(0),
        }
    }
}

struct Writer {
    live: HashMap<CallSite, u32>,
    owned: Vec<Option<Box<dyn AuxResource>>>,
    /// Releases that did not fit in the pending queue
    overflow: Vec<Box<dyn AuxResource>>,
}

/// Fixed-capacity arena of transition stubs
pub struct TransitionStubs {
    region: CodeRegion,
    slots: Box<[StubSlot]>,
    top: AtomicUsize,
    generation: AtomicU64,
    writer: Mutex<Writer>,
    pending_release: ArrayQueue<Box<dyn AuxResource>>,
    safepoint: Safepoint,
    patcher: Arc<dyn CallSitePatcher>,
}

impl TransitionStubs {
    /// Commit the arena described by `config`
    ///
    /// Every slot starts poisoned.
    pub fn new(
        config: &TrapConfig,
        safepoint: Safepoint,
        patcher: Arc<dyn CallSitePatcher>,
    ) -> RuntimeResult<Self> {
        config.validate()?;
        let capacity = config.stub_capacity();
        if u32::try_from(capacity).is_err() {
            return Err(RuntimeError::InvalidConfig {
                reason: format!("stub arena holds {capacity} stubs, more than a handle can index"),
            });
        }

        let region = CodeRegion::allocate(capacity * STUB_SIZE)?;
        let poisoned = poison();
        for index in 0..capacity {
            // Safety: no stub has been handed out yet
            unsafe { region.write(index * STUB_SIZE, &poisoned) };
        }

        tracing::debug!(capacity, region = region.address(0), "committed transition stub arena");

        Ok(Self {
            region,
            slots: (0..capacity).map(|_| StubSlot::empty()).collect(),
            top: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            writer: Mutex::new(Writer {
                live: HashMap::new(),
                owned: (0..capacity).map(|_| None).collect(),
                overflow: Vec::new(),
            }),
            pending_release: ArrayQueue::new(capacity),
            safepoint,
            patcher,
        })
    }

    fn lock_writer(&self) -> MutexGuard<'_, Writer> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit a stub for `site` and redirect the site to it
    ///
    /// Any live stub for the same site is cleared first. When the arena is
    /// full, the arena's safepoint is synchronized and the arena reclaimed
    /// before retrying; a concurrent reclaim by another thread counts too.
    /// `requester` is the calling thread's participant, counted as blocked
    /// while it waits.
    pub fn materialize(
        &self,
        requester: &SafepointParticipant,
        site: CallSite,
        destination: usize,
        aux: AuxValue,
    ) -> StubHandle {
        loop {
            let mut writer = self.lock_writer();
            let top = self.top.load(Ordering::Acquire);
            if top < self.slots.len() {
                return self.emit_locked(&mut writer, top, site, destination, aux);
            }
            let exhausted = self.generation.load(Ordering::SeqCst);
            drop(writer);

            tracing::debug!(generation = exhausted, "transition stub arena exhausted");
            requester.blocked(|| {
                self.safepoint.synchronize(|| {
                    if self.generation.load(Ordering::SeqCst) != exhausted {
                        return;
                    }
                    if let Err(err) = self.reclaim_retired_stubs() {
                        tracing::warn!(
                            error = %err,
                            generation = exhausted,
                            "failed to reclaim exhausted stub arena"
                        );
                    }
                })
            });
        }
    }

    fn emit_locked(
        &self,
        writer: &mut Writer,
        index: usize,
        site: CallSite,
        destination: usize,
        aux: AuxValue,
    ) -> StubHandle {
        if let Some(previous) = writer.live.remove(&site) {
            self.clear_locked(writer, previous as usize);
        }

        let cached = aux.word();
        // Safety: the slot is above `top`, no thread can be executing it
        unsafe { self.region.write(index * STUB_SIZE, &emit(destination, cached)) };

        let slot = &self.slots[index];
        slot.destination.store(destination, Ordering::Release);
        slot.cached.store(cached, Ordering::Release);
        slot.site.store(site.address(), Ordering::Release);

        if let AuxValue::Resource(resource) = aux {
            writer.owned[index] = Some(resource);
        }
        writer.live.insert(site, index as u32);
        self.top.store(index + 1, Ordering::Release);

        let entry = self.region.address(index * STUB_SIZE);
        tracing::trace!(site = site.address(), destination, entry, "materialized transition stub");
        self.patcher.redirect(site, entry);

        StubHandle {
            index: index as u32,
            generation: self.generation.load(Ordering::SeqCst),
        }
    }

    fn clear_locked(&self, writer: &mut Writer, index: usize) {
        self.slots[index].site.store(0, Ordering::Release);
        if let Some(resource) = writer.owned[index].take() {
            if let Err(resource) = self.pending_release.push(resource) {
                writer.overflow.push(resource);
            }
        }
    }

    /// Retire the stub behind `handle`
    ///
    /// The slot stays allocated and its code intact until the next
    /// reclamation; an owned resource is queued for release then. Returns
    /// `false` if the stub was already cleared or belongs to an older
    /// generation.
    pub fn clear(&self, handle: StubHandle) -> bool {
        let mut writer = self.lock_writer();
        if handle.generation != self.generation.load(Ordering::SeqCst) {
            return false;
        }
        let index = handle.index();
        let Some(site) = self
            .slots
            .get(index)
            .and_then(|slot| CallSite::new(slot.site.load(Ordering::Acquire)))
        else {
            return false;
        };
        if writer.live.get(&site) == Some(&handle.index) {
            writer.live.remove(&site);
        }
        self.clear_locked(&mut writer, index);
        true
    }

    /// Recycle the whole arena
    ///
    /// Commits every live stub to its call site, poisons the used slots,
    /// releases queued resources and bumps the generation. Returns the number
    /// of slots recycled.
    ///
    /// Fails with [`RuntimeError::NotAtSafepoint`] unless called from inside
    /// [`Safepoint::synchronize`] of the arena's safepoint.
    pub fn reclaim_retired_stubs(&self) -> RuntimeResult<usize> {
        if !self.safepoint.is_synchronized() {
            return Err(RuntimeError::NotAtSafepoint);
        }
        let mut writer = self.lock_writer();
        let top = self.top.load(Ordering::Acquire);

        let mut committed = 0;
        for index in 0..top {
            let slot = &self.slots[index];
            let Some(site) = CallSite::new(slot.site.swap(0, Ordering::AcqRel)) else {
                continue;
            };
            let cached = match writer.owned[index].take() {
                Some(resource) => AuxValue::Resource(resource),
                None => AuxValue::Word(slot.cached.load(Ordering::Acquire)),
            };
            self.patcher
                .commit(site, slot.destination.load(Ordering::Acquire), cached);
            committed += 1;
        }
        writer.live.clear();

        let poisoned = poison();
        for index in 0..top {
            // Safety: every participant is stopped outside stub code
            unsafe { self.region.write(index * STUB_SIZE, &poisoned) };
        }

        let mut released = writer.overflow.len();
        writer.overflow.clear();
        while self.pending_release.pop().is_some() {
            released += 1;
        }

        self.top.store(0, Ordering::Release);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(generation, reclaimed = top, committed, released, "reclaimed transition stubs");
        Ok(top)
    }

    fn find(&self, site: CallSite) -> Option<&StubSlot> {
        let top = self.top.load(Ordering::Acquire).min(self.slots.len());
        self.slots[..top]
            .iter()
            .rev()
            .find(|slot| slot.site.load(Ordering::Acquire) == site.address())
    }

    /// Destination of the live stub for `site`
    pub fn destination_for(&self, site: CallSite) -> Option<usize> {
        self.find(site)
            .map(|slot| slot.destination.load(Ordering::Acquire))
    }

    /// Cached value of the live stub for `site`
    pub fn cached_value_for(&self, site: CallSite) -> Option<usize> {
        self.find(site).map(|slot| slot.cached.load(Ordering::Acquire))
    }

    fn read_handle(&self, handle: StubHandle, field: impl Fn(&StubSlot) -> usize) -> Option<usize> {
        if self.generation.load(Ordering::Acquire) != handle.generation {
            return None;
        }
        let slot = self.slots.get(handle.index())?;
        if slot.site.load(Ordering::Acquire) == 0 {
            return None;
        }
        let value = field(slot);
        // A reclaim may have raced in between the checks and the read
        (self.generation.load(Ordering::Acquire) == handle.generation).then_some(value)
    }

    /// Destination of the stub behind `handle`, `None` once cleared or reclaimed
    pub fn destination_of(&self, handle: StubHandle) -> Option<usize> {
        self.read_handle(handle, |slot| slot.destination.load(Ordering::Acquire))
    }

    /// Cached value of the stub behind `handle`, `None` once cleared or reclaimed
    pub fn cached_value_of(&self, handle: StubHandle) -> Option<usize> {
        self.read_handle(handle, |slot| slot.cached.load(Ordering::Acquire))
    }

    /// Entry address of the stub behind `handle`
    pub fn entry_of(&self, handle: StubHandle) -> Option<usize> {
        self.read_handle(handle, |_| self.region.address(handle.index() * STUB_SIZE))
    }

    /// Whether `pc` lies inside the stub arena
    pub fn contains(&self, pc: usize) -> bool {
        self.region.contains(pc)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Stubs per generation
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots handed out in the current generation, live or cleared
    pub fn used(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    /// Stubs that have not been cleared in the current generation
    pub fn live_stubs(&self) -> usize {
        let top = self.used().min(self.slots.len());
        self.slots[..top]
            .iter()
            .filter(|slot| slot.site.load(Ordering::Acquire) != 0)
            .count()
    }

    /// Resources waiting for the next reclamation
    pub fn pending_releases(&self) -> usize {
        self.pending_release.len() + self.lock_writer().overflow.len()
    }

    /// Copy of the machine code in the slot behind `handle`
    pub fn code_of(&self, handle: StubHandle) -> Option<[u8; STUB_SIZE]> {
        self.read_handle(handle, |_| 0)?;
        let mut code = [0u8; STUB_SIZE];
        self.region.read(handle.index() * STUB_SIZE, &mut code);
        Some(code)
    }
}

impl std::fmt::Debug for TransitionStubs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionStubs")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct RecordingPatcher {
        redirects: Mutex<Vec<(usize, usize)>>,
        commits: Mutex<Vec<(usize, usize, usize)>>,
    }

    impl CallSitePatcher for RecordingPatcher {
        fn redirect(&self, site: CallSite, stub_entry: usize) {
            self.redirects
                .lock()
                .expect("patcher lock")
                .push((site.address(), stub_entry));
        }

        fn commit(&self, site: CallSite, destination: usize, cached: AuxValue) {
            self.commits
                .lock()
                .expect("patcher lock")
                .push((site.address(), destination, cached.word()));
        }
    }

    struct Counted {
        word: usize,
        drops: Arc<AtomicUsize>,
    }

    impl AuxResource for Counted {
        fn word(&self) -> usize {
            self.word
        }
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn site(addr: usize) -> CallSite {
        CallSite::new(addr).expect("non-null call site")
    }

    fn arena(stubs: usize) -> (TransitionStubs, Safepoint, Arc<RecordingPatcher>) {
        let config = TrapConfig::default().with_stub_arena_size(stubs * STUB_SIZE);
        let safepoint = Safepoint::new();
        let patcher = Arc::new(RecordingPatcher::default());
        let stubs = TransitionStubs::new(&config, safepoint.clone(), patcher.clone())
            .expect("arena should allocate");
        (stubs, safepoint, patcher)
    }

    #[test]
    fn test_null_call_site_rejected() {
        assert!(CallSite::new(0).is_none());
        assert_eq!(site(0x40).address(), 0x40);
    }

    #[test]
    fn test_materialize_round_trips() {
        let (stubs, safepoint, patcher) = arena(4);
        let participant = safepoint.register();

        let handle = stubs.materialize(&participant, site(0x1000), 0xaaaa, AuxValue::Word(0x42));
        assert_eq!(stubs.destination_for(site(0x1000)), Some(0xaaaa));
        assert_eq!(stubs.cached_value_for(site(0x1000)), Some(0x42));
        assert_eq!(stubs.destination_of(handle), Some(0xaaaa));
        assert_eq!(stubs.cached_value_of(handle), Some(0x42));

        let entry = stubs.entry_of(handle).expect("live stub has an entry");
        assert!(stubs.contains(entry));
        assert_eq!(
            patcher.redirects.lock().expect("patcher lock").as_slice(),
            &[(0x1000, entry)]
        );

        let code = stubs.code_of(handle).expect("live stub has code");
        assert_eq!(decode(&code), Some((0xaaaa, 0x42)));
    }

    #[test]
    fn test_rematerialize_replaces_live_stub() {
        let (stubs, safepoint, _patcher) = arena(4);
        let participant = safepoint.register();

        let first = stubs.materialize(&participant, site(0x1000), 0xaaaa, AuxValue::Word(1));
        let second = stubs.materialize(&participant, site(0x1000), 0xbbbb, AuxValue::Word(2));

        assert_ne!(first, second);
        assert_eq!(stubs.live_stubs(), 1);
        assert_eq!(stubs.used(), 2);
        assert_eq!(stubs.destination_for(site(0x1000)), Some(0xbbbb));
        assert_eq!(stubs.destination_of(first), None);
        assert_eq!(stubs.destination_of(second), Some(0xbbbb));
    }

    #[test]
    fn test_clear_retires_once() {
        let (stubs, safepoint, _patcher) = arena(4);
        let participant = safepoint.register();

        let handle = stubs.materialize(&participant, site(0x1000), 0xaaaa, AuxValue::Word(0));
        assert!(stubs.clear(handle));
        assert!(!stubs.clear(handle));
        assert_eq!(stubs.live_stubs(), 0);
        assert_eq!(stubs.destination_for(site(0x1000)), None);

        // Cleared code stays in place until reclamation
        let mut code = [0u8; STUB_SIZE];
        stubs.region.read(handle.index() * STUB_SIZE, &mut code);
        assert_eq!(decode(&code), Some((0xaaaa, 0)));
    }

    #[test]
    fn test_reclaim_requires_safepoint() {
        let (stubs, _safepoint, _patcher) = arena(4);
        assert!(matches!(
            stubs.reclaim_retired_stubs(),
            Err(RuntimeError::NotAtSafepoint)
        ));
    }

    #[test]
    fn test_reclaim_commits_live_stubs() {
        let (stubs, safepoint, patcher) = arena(4);
        let participant = safepoint.register();

        let live = stubs.materialize(&participant, site(0x1000), 0xaaaa, AuxValue::Word(7));
        let retired = stubs.materialize(&participant, site(0x2000), 0xbbbb, AuxValue::Word(8));
        assert!(stubs.clear(retired));

        let reclaimed = participant
            .synchronize(|| stubs.reclaim_retired_stubs())
            .expect("reclaim at a safepoint");
        assert_eq!(reclaimed, 2);
        assert_eq!(stubs.generation(), 1);
        assert_eq!(stubs.used(), 0);
        assert_eq!(
            patcher.commits.lock().expect("patcher lock").as_slice(),
            &[(0x1000, 0xaaaa, 7)]
        );

        assert_eq!(stubs.destination_of(live), None);
        assert!(!stubs.clear(live));
        assert_eq!(stubs.destination_for(site(0x1000)), None);

        let mut code = [0u8; STUB_SIZE];
        stubs.region.read(0, &mut code);
        assert_eq!(code, poison());
    }

    #[test]
    fn test_resources_released_at_reclaim() {
        let (stubs, safepoint, patcher) = arena(4);
        let participant = safepoint.register();
        let drops = Arc::new(AtomicUsize::new(0));
        let resource = |word| {
            AuxValue::Resource(Box::new(Counted {
                word,
                drops: drops.clone(),
            }))
        };

        stubs.materialize(&participant, site(0x1000), 0xaaaa, resource(1));
        stubs.materialize(&participant, site(0x1000), 0xbbbb, resource(2));
        assert_eq!(stubs.cached_value_for(site(0x1000)), Some(2));
        // The replaced stub may still be running; its resource waits
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(stubs.pending_releases(), 1);

        participant
            .synchronize(|| stubs.reclaim_retired_stubs())
            .expect("reclaim at a safepoint");
        assert_eq!(stubs.pending_releases(), 0);
        // The retired one is dropped, the live one went to the call site
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(
            patcher.commits.lock().expect("patcher lock").as_slice(),
            &[(0x1000, 0xbbbb, 2)]
        );
    }

    #[test]
    fn test_exhaustion_forces_reclaim() {
        let (stubs, safepoint, patcher) = arena(2);
        let participant = safepoint.register();

        let first = stubs.materialize(&participant, site(0x1000), 0xa, AuxValue::Word(0));
        stubs.materialize(&participant, site(0x2000), 0xb, AuxValue::Word(0));
        let third = stubs.materialize(&participant, site(0x3000), 0xc, AuxValue::Word(0));

        assert_eq!(stubs.generation(), 1);
        assert_eq!(third.generation(), 1);
        assert_eq!(third.index(), 0);
        assert_eq!(stubs.destination_of(first), None);
        assert_eq!(stubs.destination_of(third), Some(0xc));
        assert_eq!(patcher.commits.lock().expect("patcher lock").len(), 2);
        assert_eq!(safepoint.epoch(), 1);
    }

    #[test]
    fn test_arena_too_small_rejected() {
        let config = TrapConfig::default().with_stub_arena_size(STUB_SIZE - 1);
        let result = TransitionStubs::new(
            &config,
            Safepoint::new(),
            Arc::new(RecordingPatcher::default()),
        );
        assert!(matches!(result, Err(RuntimeError::InvalidConfig { .. })));
    }
}
