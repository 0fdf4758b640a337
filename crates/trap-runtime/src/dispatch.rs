//! Classify a fault, then fall back to chained handlers

use crate::{
    chain::{FallbackHandler, RawSignal},
    classify::{Classifier, Disposition},
    diagnostic::FatalDiagnostic,
    fault::CanonicalFaultRecord,
    thread::ManagedThread,
};

/// Turns every fault into a final [`Disposition`]
///
/// Never returns [`Disposition::Defer`]: deferred faults are offered to the
/// fallback and become `Retry` if it handles them, `Fatal` otherwise.
#[derive(Clone, Copy)]
pub struct TrapDispatcher<'a> {
    classifier: Classifier<'a>,
    fallback: Option<&'a dyn FallbackHandler>,
}

impl<'a> TrapDispatcher<'a> {
    pub fn new(classifier: Classifier<'a>) -> Self {
        Self {
            classifier,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: &'a dyn FallbackHandler) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn dispatch(
        &self,
        record: &CanonicalFaultRecord,
        raw: &RawSignal,
        thread: Option<&dyn ManagedThread>,
    ) -> Disposition {
        match self.classifier.classify(record, thread) {
            Disposition::Defer => match self.fallback {
                Some(fallback) if fallback.offer(record, raw) => Disposition::Retry,
                _ => Disposition::Fatal(FatalDiagnostic::capture("unrecognized fault", record)),
            },
            decided => decided,
        }
    }
}
