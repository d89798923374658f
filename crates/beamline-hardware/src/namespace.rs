//! Operator-facing namespace.
//!
//! Setup plans publish convenience names here (scaler channel aliases, for
//! instance) for ad hoc use after setup. Entries are either whole devices or
//! single signals.

use beamline_core::capabilities::Device;
use beamline_core::signal::Signal;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub enum NamespaceEntry {
    Device(Arc<dyn Device>),
    Signal(Signal),
}

impl fmt::Debug for NamespaceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceEntry::Device(d) => write!(f, "Device({})", d.name()),
            NamespaceEntry::Signal(s) => write!(f, "Signal({})", s.name()),
        }
    }
}

#[derive(Debug, Default)]
pub struct Namespace {
    entries: RwLock<BTreeMap<String, NamespaceEntry>>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name`, replacing any previous binding.
    pub fn insert(&self, name: impl Into<String>, entry: NamespaceEntry) {
        let name = name.into();
        debug!(%name, ?entry, "namespace bind");
        self.entries.write().insert(name, entry);
    }

    pub fn insert_signal(&self, name: impl Into<String>, signal: Signal) {
        self.insert(name, NamespaceEntry::Signal(signal));
    }

    pub fn get(&self, name: &str) -> Option<NamespaceEntry> {
        self.entries.read().get(name).cloned()
    }

    pub fn signal(&self, name: &str) -> Option<Signal> {
        match self.get(name)? {
            NamespaceEntry::Signal(s) => Some(s),
            NamespaceEntry::Device(_) => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
