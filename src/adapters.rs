//! Kernel adapters that let ordinary in-memory kernels run over a
//! [`crate::spill::SpillStore`] transparently.
//!
//! `PickleOutAdapter` wraps a mapper so that each `(k, v)` it emits becomes
//! `(k, (digest, payload_or_none))`: the payload is dropped when this
//! invocation has already seen the same digest, leaving the coordinator to
//! do the stage-wide dedup against its [`crate::spill::DedupTable`].
//! `PickleInAdapter` wraps a reducer so it sees `(k, values)` pulled lazily
//! from a [`crate::spill::SpillReader`] by offset, instead of the raw
//! offsets themselves.

use crate::digest::{digest, ContentDigest};
use crate::error::EngineResult;
use crate::spill::{Offset, SpillReader};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;

/// One mapper output after local (per-invocation) dedup.
///
/// `payload` is `None` when this invocation already emitted a value with
/// the same digest — the coordinator still records the digest against
/// whatever offset the first occurrence lands at.
pub struct PickledValue {
    pub digest: ContentDigest,
    pub payload: Option<Vec<u8>>,
}

/// Wraps a mapper `K -> V` so it serializes `V` and applies local dedup
/// before the coordinator ever sees a byte.
pub struct PickleOutAdapter<V> {
    _marker: std::marker::PhantomData<V>,
}

impl<V: Serialize> PickleOutAdapter<V> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }

    /// Serializes `values`, deduping within this single call via `seen`.
    pub fn apply(
        &self,
        values: impl IntoIterator<Item = V>,
        seen: &mut HashSet<ContentDigest>,
    ) -> EngineResult<Vec<PickledValue>> {
        values
            .into_iter()
            .map(|v| {
                let bytes = serde_json::to_vec(&v)?;
                let h = digest(&bytes);
                let payload = if seen.insert(h) { Some(bytes) } else { None };
                Ok(PickledValue { digest: h, payload })
            })
            .collect()
    }
}

impl<V: Serialize> Default for PickleOutAdapter<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a reducer `(K, values) -> R` so it can pull values lazily from a
/// [`SpillReader`] by offset instead of receiving them inline.
pub struct PickleInAdapter<V> {
    reader: SpillReader,
    _marker: std::marker::PhantomData<V>,
}

impl<V: DeserializeOwned> PickleInAdapter<V> {
    pub fn new(reader: SpillReader) -> Self {
        Self {
            reader,
            _marker: std::marker::PhantomData,
        }
    }

    /// Resolves a key's offsets into its deserialized values, in the order
    /// the offsets were recorded. Single-pass by construction; a reducer
    /// that needs multiple passes should collect the returned `Vec` itself.
    pub fn resolve(&self, offsets: &[Offset]) -> EngineResult<Vec<V>> {
        offsets
            .iter()
            .map(|&offset| {
                let bytes = self.reader.read(offset)?;
                Ok(serde_json::from_slice(&bytes)?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spill::SpillStore;

    #[test]
    fn repeated_values_within_one_call_drop_payload_after_first() {
        let adapter: PickleOutAdapter<String> = PickleOutAdapter::new();
        let mut seen = HashSet::new();
        let out = adapter
            .apply(
                vec!["a".to_string(), "a".to_string(), "b".to_string()],
                &mut seen,
            )
            .unwrap();
        assert!(out[0].payload.is_some());
        assert!(out[1].payload.is_none());
        assert!(out[2].payload.is_some());
        assert_eq!(out[0].digest, out[1].digest);
        assert_ne!(out[0].digest, out[2].digest);
    }

    #[test]
    fn round_trips_through_a_real_spill_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SpillStore::create_in(dir.path()).unwrap();

        let out_adapter: PickleOutAdapter<i32> = PickleOutAdapter::new();
        let mut seen = HashSet::new();
        let pickled = out_adapter.apply(vec![10, 20], &mut seen).unwrap();

        let mut offsets = Vec::new();
        for p in pickled {
            let bytes = p.payload.expect("first occurrence keeps its payload");
            offsets.push(store.append(&bytes).unwrap());
        }

        let reader = store.reader().unwrap();
        let in_adapter: PickleInAdapter<i32> = PickleInAdapter::new(reader);
        let values = in_adapter.resolve(&offsets).unwrap();
        assert_eq!(values, vec![10, 20]);
    }
}
