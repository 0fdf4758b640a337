//! Continuation resolver
//!
//! The classifier knows *how* to decide what a fault means but not *where*
//! managed code wants to resume. That knowledge belongs to the code cache and
//! the compilers, which expose it through [`ContinuationResolver`].
//!
//! Every method is called from signal context, so implementations must not
//! allocate, lock, or block. Continuations are `Option`s: `None` means the
//! resolver does not claim the fault and the classifier moves on to its next
//! rule.

use std::ops::Range;

use crate::{os, thread::ManagedThread};

/// Facts about generated code that the classifier consults
pub trait ContinuationResolver {
    /// Whether `addr` is a safepoint polling page address
    fn is_safepoint_poll_address(&self, addr: usize) -> bool;

    /// Safepoint handler entry for a poll instruction at `pc`
    fn safepoint_poll_continuation(&self, pc: usize) -> Option<usize>;

    /// Fallback continuation if `pc` is inside a guarded access region
    fn guarded_access_continuation(&self, pc: usize) -> Option<usize>;

    fn is_guarded_access_region(&self, pc: usize) -> bool {
        self.guarded_access_continuation(pc).is_some()
    }

    /// Entry of the code that throws the managed stack-overflow error
    fn continuation_for_stack_overflow(&self, thread: &dyn ManagedThread, pc: usize) -> Option<usize>;

    /// Entry of the code that throws the managed arithmetic error
    fn continuation_for_arithmetic_fault(&self, thread: &dyn ManagedThread, pc: usize)
        -> Option<usize>;

    /// Entry of the code that throws the managed null-pointer error
    fn continuation_for_null_check(&self, thread: &dyn ManagedThread, pc: usize) -> Option<usize>;

    /// Whether `pc` is the patched entry of a compiled method that was made
    /// not-entrant
    fn is_zombie_entry(&self, pc: usize) -> bool;

    /// Stub that re-resolves the call which reached a zombie entry
    fn re_resolve_call_continuation(&self) -> usize;

    /// Whether a fault on `addr` can be an implicit null check, i.e. a field
    /// access through a null base with a small offset
    fn looks_like_intentional_null_check(&self, addr: usize) -> bool;

    /// Whether compiled code at `pc` performs flagged unsafe memory access
    fn has_unsafe_access(&self, _pc: usize) -> bool {
        false
    }

    /// Slow path of a fast field accessor whose speculative load is at `pc`
    fn fast_accessor_slow_case(&self, _pc: usize) -> Option<usize> {
        None
    }

    /// Address of the instruction following the one at `pc`, on ISAs where the
    /// fault record does not carry a fixed instruction width
    fn next_instruction(&self, _pc: usize) -> Option<usize> {
        None
    }
}

/// Table-driven [`ContinuationResolver`]
///
/// Everything is registered up front through the `with_*` builder methods;
/// after that the table is read-only and every lookup is a binary search over
/// a sorted `Vec`, which is safe in signal context.
#[derive(Debug, Clone)]
pub struct ContinuationTable {
    poll_pages: Vec<Range<usize>>,
    safepoint_entry: Option<usize>,
    guarded_regions: Vec<(Range<usize>, usize)>,
    stack_overflow_entry: Option<usize>,
    arithmetic_entry: Option<usize>,
    null_check_entry: Option<usize>,
    zombie_entries: Vec<usize>,
    re_resolve_entry: usize,
    null_check_limit: usize,
    unsafe_access_regions: Vec<Range<usize>>,
    fast_accessors: Vec<(usize, usize)>,
    instruction_lengths: Vec<(usize, usize)>,
}

impl Default for ContinuationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ContinuationTable {
    /// An empty table; implicit null checks cover the first page
    pub fn new() -> Self {
        Self {
            poll_pages: Vec::new(),
            safepoint_entry: None,
            guarded_regions: Vec::new(),
            stack_overflow_entry: None,
            arithmetic_entry: None,
            null_check_entry: None,
            zombie_entries: Vec::new(),
            re_resolve_entry: 0,
            null_check_limit: os::page_size(),
            unsafe_access_regions: Vec::new(),
            fast_accessors: Vec::new(),
            instruction_lengths: Vec::new(),
        }
    }

    /// Register a polling page and the safepoint handler entry
    pub fn with_safepoint_poll(mut self, page: Range<usize>, entry: usize) -> Self {
        insert_range(&mut self.poll_pages, page);
        self.safepoint_entry = Some(entry);
        self
    }

    /// Register a guarded access region that resumes at `fallback` on any fault
    pub fn with_guarded_region(mut self, region: Range<usize>, fallback: usize) -> Self {
        let at = self
            .guarded_regions
            .partition_point(|(r, _)| r.start < region.start);
        self.guarded_regions.insert(at, (region, fallback));
        self
    }

    pub fn with_stack_overflow_entry(mut self, entry: usize) -> Self {
        self.stack_overflow_entry = Some(entry);
        self
    }

    pub fn with_arithmetic_entry(mut self, entry: usize) -> Self {
        self.arithmetic_entry = Some(entry);
        self
    }

    pub fn with_null_check_entry(mut self, entry: usize) -> Self {
        self.null_check_entry = Some(entry);
        self
    }

    /// Addresses below `limit` are treated as implicit null checks
    pub fn with_null_check_limit(mut self, limit: usize) -> Self {
        self.null_check_limit = limit;
        self
    }

    /// Mark `entry` as the entry point of a not-entrant compiled method
    pub fn with_zombie_entry(mut self, entry: usize) -> Self {
        if let Err(at) = self.zombie_entries.binary_search(&entry) {
            self.zombie_entries.insert(at, entry);
        }
        self
    }

    pub fn with_re_resolve_entry(mut self, entry: usize) -> Self {
        self.re_resolve_entry = entry;
        self
    }

    /// Register compiled code that performs unsafe memory access
    pub fn with_unsafe_access_region(mut self, region: Range<usize>) -> Self {
        insert_range(&mut self.unsafe_access_regions, region);
        self
    }

    /// Register the slow path of a fast accessor whose load is at `pc`
    pub fn with_fast_accessor(mut self, pc: usize, slow_case: usize) -> Self {
        insert_pair(&mut self.fast_accessors, pc, slow_case);
        self
    }

    /// Record the length of the instruction at `pc`
    pub fn with_instruction_length(mut self, pc: usize, len: usize) -> Self {
        insert_pair(&mut self.instruction_lengths, pc, len);
        self
    }
}

fn insert_range(ranges: &mut Vec<Range<usize>>, range: Range<usize>) {
    let at = ranges.partition_point(|r| r.start < range.start);
    ranges.insert(at, range);
}

fn insert_pair(pairs: &mut Vec<(usize, usize)>, key: usize, value: usize) {
    match pairs.binary_search_by_key(&key, |&(k, _)| k) {
        Ok(at) => pairs[at].1 = value,
        Err(at) => pairs.insert(at, (key, value)),
    }
}

/// Find the range containing `addr` in a list sorted by start
fn find_range<T>(items: &[T], addr: usize, range: impl Fn(&T) -> &Range<usize>) -> Option<&T> {
    let after = items.partition_point(|item| range(item).start <= addr);
    items[..after]
        .iter()
        .rev()
        .find(|item| range(item).contains(&addr))
}

fn lookup_pair(pairs: &[(usize, usize)], key: usize) -> Option<usize> {
    pairs
        .binary_search_by_key(&key, |&(k, _)| k)
        .ok()
        .map(|at| pairs[at].1)
}

impl ContinuationResolver for ContinuationTable {
    fn is_safepoint_poll_address(&self, addr: usize) -> bool {
        find_range(&self.poll_pages, addr, |r| r).is_some()
    }

    fn safepoint_poll_continuation(&self, _pc: usize) -> Option<usize> {
        self.safepoint_entry
    }

    fn guarded_access_continuation(&self, pc: usize) -> Option<usize> {
        find_range(&self.guarded_regions, pc, |(r, _)| r).map(|&(_, fallback)| fallback)
    }

    fn continuation_for_stack_overflow(&self, _thread: &dyn ManagedThread, _pc: usize) -> Option<usize> {
        self.stack_overflow_entry
    }

    fn continuation_for_arithmetic_fault(
        &self,
        _thread: &dyn ManagedThread,
        _pc: usize,
    ) -> Option<usize> {
        self.arithmetic_entry
    }

    fn continuation_for_null_check(&self, _thread: &dyn ManagedThread, _pc: usize) -> Option<usize> {
        self.null_check_entry
    }

    fn is_zombie_entry(&self, pc: usize) -> bool {
        self.zombie_entries.binary_search(&pc).is_ok()
    }

    fn re_resolve_call_continuation(&self) -> usize {
        self.re_resolve_entry
    }

    fn looks_like_intentional_null_check(&self, addr: usize) -> bool {
        addr < self.null_check_limit
    }

    fn has_unsafe_access(&self, pc: usize) -> bool {
        find_range(&self.unsafe_access_regions, pc, |r| r).is_some()
    }

    fn fast_accessor_slow_case(&self, pc: usize) -> Option<usize> {
        lookup_pair(&self.fast_accessors, pc)
    }

    fn next_instruction(&self, pc: usize) -> Option<usize> {
        lookup_pair(&self.instruction_lengths, pc).map(|len| pc + len)
    }
}
