//! Instrument id -> ticker lookup, populated by feed mapping events.

use crate::event::InstrumentId;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use smol_str::SmolStr;
use std::sync::Arc;
use tracing::debug;

/// Session-scoped, append-mostly symbol directory. Cheap to clone; clones share one table.
#[derive(Debug, Clone, Default)]
pub struct SymbolDirectory {
    inner: Arc<RwLock<FnvHashMap<InstrumentId, SmolStr>>>,
}

impl SymbolDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mapping. A re-announced id replaces its previous symbol.
    pub fn insert(&self, instrument_id: InstrumentId, symbol: SmolStr) {
        let previous = self.inner.write().insert(instrument_id, symbol.clone());
        if let Some(previous) = previous.filter(|previous| *previous != symbol) {
            debug!(instrument_id, %previous, %symbol, "instrument remapped");
        }
    }

    /// `None` until the feed has announced a mapping for `instrument_id`.
    pub fn resolve(&self, instrument_id: InstrumentId) -> Option<SmolStr> {
        self.inner.read().get(&instrument_id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().len()
    }
}
