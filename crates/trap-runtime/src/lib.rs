// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Hardware-trap dispatch and transition-stub management for a JIT runtime
//!
//! Generated code relies on the hardware to detect rare conditions: a load
//! from a protected polling page requests a safepoint, a load through a null
//! pointer is a null check, a touch of a stack guard page is a stack
//! overflow, a divide by zero is an arithmetic exception. This crate turns the
//! resulting signals back into control flow the runtime understands, and
//! manages the short-lived trampolines used while call sites are re-bound.
//!
//! # Overview
//!
//! The runtime handles:
//! - Installing process-wide handlers for SEGV, BUS, ILL, FPE, PIPE and XFSZ
//! - Normalizing the OS signal context into a [`CanonicalFaultRecord`]
//! - Classifying every fault into a [`Disposition`]: retry, redirect to a
//!   continuation, defer to a previously installed handler, or abort
//! - Per-thread stack guard zones (recoverable yellow, fatal red)
//! - The memory serialization page used as a cross-thread store barrier
//! - A bump-allocated arena of [`TransitionStubs`], reclaimed at safepoints
//!
//! # Architecture
//!
//! ```text
//! signal ─→ FaultContextAdapter ─→ CanonicalFaultRecord
//!                                        ↓
//!            ThreadState (thread-local) ─→ Classifier ←─ ContinuationResolver
//!                                        ↓ Defer
//!                                  ChainedHandlers
//!                                        ↓
//!                      Retry / Redirect(pc) / Fatal(diagnostic)
//!
//! TransitionStubs ─ materialize ─→ CodeRegion ─ redirect ─→ CallSitePatcher
//!        └──────── reclaim (inside Safepoint::synchronize) ─ commit ─┘
//! ```
//!
//! # Thread Safety
//!
//! The handler path is allocation-free and lock-free: the installed
//! [`TrapRuntime`] is immutable after [`install`], per-thread state lives in
//! a thread-local pointer set by [`ThreadState::attach`], and the only wait
//! (on the serialization page) is a spin. Synchronous faults are delivered to
//! the thread that raised them, so concurrent faults on different threads
//! never observe each other's state.
//!
//! Stub writers serialize on a mutex, never taken from signal context. Stub
//! readers are lock-free. Slot reuse only happens while every registered
//! [`SafepointParticipant`] is stopped.
//!
//! # Platform Support
//!
//! - Linux on x86_64 and aarch64
//! - macOS on x86_64 and Apple Silicon

pub mod adapter;
mod chain;
mod classify;
mod config;
mod diagnostic;
mod dispatch;
mod error;
mod fault;
mod guard;
pub mod os;
mod region;
mod resolver;
mod safepoint;
mod serialize;
mod signal;
pub mod stubs;
mod thread;

pub use adapter::{FaultContextAdapter, NativeAdapter};
pub use chain::{ChainedHandlers, FallbackHandler, RawSignal};
pub use classify::{Classifier, Disposition};
pub use config::{
    TrapConfig, DEFAULT_RED_ZONE_PAGES, DEFAULT_STUB_ARENA_SIZE, DEFAULT_YELLOW_ZONE_PAGES,
};
pub use diagnostic::{report_and_abort, FatalDiagnostic};
pub use dispatch::TrapDispatcher;
pub use error::{RuntimeError, RuntimeResult};
pub use fault::{CanonicalFaultRecord, CodeWindow, FaultCode, RegisterSnapshot, SignalKind};
pub use guard::{GuardState, GuardZones};
pub use region::CodeRegion;
pub use resolver::{ContinuationResolver, ContinuationTable};
pub use safepoint::{spin_wait, Safepoint, SafepointParticipant};
pub use serialize::SerializationPage;
pub use signal::{check_signal_handlers, install, installed, TrapRuntime, HANDLED_SIGNALS};
pub use stubs::{
    AuxResource, AuxValue, CallSite, CallSitePatcher, StubHandle, TransitionStubs, STUB_SIZE,
};
pub use thread::{
    with_current, AttachedThread, ExecutionMode, FaultHandlingScope, ManagedThread, StackBounds,
    ThreadState,
};
