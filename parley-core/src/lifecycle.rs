//! Scoped acquisition and release of call resources.
//!
//! Every resource a call holds (microphone stream, analyser, recorder,
//! playback handle) lives in a `Slot`. A slot refuses a second acquisition
//! until the first is released, and releasing is idempotent: the value is
//! taken out of the slot before `Releasable::release` runs, so it can only
//! run once. Dropping a slot releases whatever it still holds, which covers
//! panics and abnormal teardown.
//!
//! All slots of one call share a `ResourceLedger` so tests and logs can
//! check that acquisitions and releases balance.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{ParleyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Microphone,
    Analyser,
    Recorder,
    Playback,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Microphone,
        ResourceKind::Analyser,
        ResourceKind::Recorder,
        ResourceKind::Playback,
    ];

    fn index(self) -> usize {
        match self {
            Self::Microphone => 0,
            Self::Analyser => 1,
            Self::Recorder => 2,
            Self::Playback => 3,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Microphone => write!(f, "microphone"),
            Self::Analyser => write!(f, "analyser"),
            Self::Recorder => write!(f, "recorder"),
            Self::Playback => write!(f, "playback"),
        }
    }
}

/// A resource that needs explicit teardown.
pub trait Releasable: Send {
    fn release(&mut self);
}

/// Acquire/release counters per resource kind.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    acquired: [AtomicUsize; 4],
    released: [AtomicUsize; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub acquired: usize,
    pub released: usize,
}

impl ResourceLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entry(&self, kind: ResourceKind) -> LedgerEntry {
        let i = kind.index();
        LedgerEntry {
            acquired: self.acquired[i].load(Ordering::Relaxed),
            released: self.released[i].load(Ordering::Relaxed),
        }
    }

    /// Number of resources currently held across all kinds.
    pub fn outstanding(&self) -> usize {
        ResourceKind::ALL
            .iter()
            .map(|&k| {
                let e = self.entry(k);
                e.acquired.saturating_sub(e.released)
            })
            .sum()
    }

    fn record_acquire(&self, kind: ResourceKind) {
        self.acquired[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn record_release(&self, kind: ResourceKind) {
        self.released[kind.index()].fetch_add(1, Ordering::Relaxed);
    }
}

/// Holder for at most one live resource of a given kind.
pub struct Slot<T: Releasable> {
    kind: ResourceKind,
    inner: Option<T>,
    ledger: Arc<ResourceLedger>,
}

impl<T: Releasable> Slot<T> {
    pub fn new(kind: ResourceKind, ledger: Arc<ResourceLedger>) -> Self {
        Self {
            kind,
            inner: None,
            ledger,
        }
    }

    /// Store `resource` in the slot.
    ///
    /// # Errors
    /// `ResourceAlreadyHeld` if the slot is occupied. The rejected resource
    /// is released immediately so it cannot leak.
    pub fn acquire(&mut self, mut resource: T) -> Result<&mut T> {
        if self.inner.is_some() {
            resource.release();
            return Err(ParleyError::ResourceAlreadyHeld(self.kind));
        }
        self.ledger.record_acquire(self.kind);
        debug!(resource = %self.kind, "acquired");
        Ok(self.inner.insert(resource))
    }

    /// Release the held resource, if any. Safe to call repeatedly.
    pub fn release(&mut self) -> bool {
        match self.inner.take() {
            Some(mut resource) => {
                resource.release();
                self.ledger.record_release(self.kind);
                debug!(resource = %self.kind, "released");
                true
            }
            None => false,
        }
    }

    /// Take the resource out without releasing it; the caller now owns teardown.
    pub fn take(&mut self) -> Option<T> {
        let taken = self.inner.take();
        if taken.is_some() {
            self.ledger.record_release(self.kind);
        }
        taken
    }

    pub fn is_held(&self) -> bool {
        self.inner.is_some()
    }

    pub fn get(&self) -> Option<&T> {
        self.inner.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.inner.as_mut()
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }
}

impl<T: Releasable> Drop for Slot<T> {
    fn drop(&mut self) {
        self.release();
    }
}
