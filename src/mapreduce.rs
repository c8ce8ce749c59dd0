//! Single-stage map-reduce: map, group by key in memory, reduce.
//!
//! `map_reduce` keeps every intermediate value in memory. `map_reduce_big`
//! has the same two-phase shape but spills mapper output to disk, deduping
//! identical values via content digest so repeated payloads cost one
//! on-disk copy, and hands the reducer a lazily-resolved value sequence
//! instead, bounding coordinator memory at the cost of one spill file for
//! the job's duration.

use crate::adapters::{PickleInAdapter, PickleOutAdapter, PickledValue};
use crate::error::EngineResult;
use crate::pool::{UnorderedIter, WorkerPool};
use crate::progress::{ProgressSink, StageTag};
use crate::spill::{DedupTable, Offset, SpillStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::path::Path;

/// Key -> values collected during the map phase, in the order the pool
/// returned them.
pub type GroupMap<K, V> = HashMap<K, Vec<V>>;

/// Runs `mapper` over `input`, groups its `(k, v)` output by key, then runs
/// `reducer` once per key. Returns the reducer's lazy output sequence;
/// nothing is spilled to disk.
pub fn map_reduce<'p, T, K, V, R>(
    pool: &mut WorkerPool,
    input: impl Iterator<Item = T> + Send + 'static,
    len_hint: Option<usize>,
    mapper: impl Fn(T) -> Vec<(K, V)> + Send + Sync + 'static,
    reducer: impl Fn(K, Vec<V>) -> Vec<R> + Send + Sync + 'static,
    progress: &'p mut dyn ProgressSink,
) -> EngineResult<UnorderedIter<'p, (K, Vec<V>), R>>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
    R: Send + 'static,
{
    let map_results = pool.imap_unordered(input, len_hint, mapper, &mut *progress, StageTag::Map)?;

    let mut groups: GroupMap<K, V> = HashMap::new();
    for r in map_results {
        let (k, v) = r?;
        groups.entry(k).or_default().push(v);
    }
    let len = groups.len();

    pool.imap_unordered(
        groups.into_iter(),
        Some(len),
        move |(k, vs)| reducer(k, vs),
        progress,
        StageTag::Reduce,
    )
}

/// Like [`map_reduce`] but spills mapper output to `spill_dir` instead of
/// holding values in memory. Suitable when a single
/// stage's intermediate values would not otherwise fit.
///
/// The returned stream owns the backing spill file and unlinks it once
/// fully consumed, abandoned, or dropped.
pub fn map_reduce_big<'p, T, K, V, R>(
    pool: &mut WorkerPool,
    input: impl Iterator<Item = T> + Send + 'static,
    len_hint: Option<usize>,
    mapper: impl Fn(T) -> Vec<(K, V)> + Send + Sync + 'static,
    reducer: impl Fn(K, Vec<V>) -> Vec<R> + Send + Sync + 'static,
    progress: &'p mut dyn ProgressSink,
    spill_dir: &Path,
) -> EngineResult<SpilledReduce<'p, K, R>>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
    R: Send + 'static,
{
    let map_results = pool.imap_unordered(input, len_hint, mapper, &mut *progress, StageTag::Map)?;

    let mut store = SpillStore::create_in(spill_dir)?;
    let out_adapter = PickleOutAdapter::<V>::new();
    let mut seen = HashSet::new();
    let mut dedup = DedupTable::new();
    let mut groups: GroupMap<K, Offset> = HashMap::new();
    for r in map_results {
        let (k, v) = r?;
        let pickled = out_adapter.apply(std::iter::once(v), &mut seen)?;
        let PickledValue { digest, payload } =
            pickled.into_iter().next().expect("apply preserves length");
        let offset = match payload {
            Some(bytes) => {
                let o = store.append(&bytes)?;
                dedup.insert(digest, o);
                o
            }
            None => dedup
                .get(&digest)
                .expect("a digest marked seen was recorded with an offset"),
        };
        groups.entry(k).or_default().push(offset);
    }
    let len = groups.len();
    let reader = store.reader()?;
    let in_adapter = PickleInAdapter::<V>::new(reader);

    let reduce_iter = pool.imap_unordered(
        groups.into_iter(),
        Some(len),
        move |(k, offsets): (K, Vec<Offset>)| {
            let values = in_adapter
                .resolve(&offsets)
                .expect("spill store read failed for a recorded offset");
            reducer(k, values)
        },
        progress,
        StageTag::Reduce,
    )?;

    Ok(SpilledReduce {
        iter: reduce_iter,
        store: Some(store),
    })
}

/// A reducer output stream backed by one spill file, holding the file open
/// until the stream is drained or dropped.
pub struct SpilledReduce<'p, K, R>
where
    K: Send + 'static,
{
    iter: UnorderedIter<'p, (K, Vec<Offset>), R>,
    store: Option<SpillStore>,
}

impl<'p, K, R> Iterator for SpilledReduce<'p, K, R>
where
    K: Send + 'static,
    R: Send + 'static,
{
    type Item = EngineResult<R>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.iter.next() {
            Some(item) => Some(item),
            None => {
                if let Some(store) = self.store.take() {
                    let _ = store.discard();
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentSink;

    fn word_pairs(line: &str) -> Vec<(String, i64)> {
        line.split_whitespace().map(|w| (w.to_string(), 1)).collect()
    }

    #[test]
    fn word_count_matches_expected_multiset() {
        let mut pool = WorkerPool::new(Some(2), None);
        let mut progress = SilentSink;
        let lines = vec!["a b".to_string(), "b c".to_string(), "a a".to_string()];
        let len = lines.len();
        let results = map_reduce(
            &mut pool,
            lines.into_iter(),
            Some(len),
            |line: String| word_pairs(&line),
            |k: String, vs: Vec<i64>| vec![(k, vs.into_iter().sum::<i64>())],
            &mut progress,
        )
        .unwrap();

        let mut out: Vec<(String, i64)> = results.map(|r| r.unwrap()).collect();
        out.sort();
        assert_eq!(
            out,
            vec![
                ("a".to_string(), 3),
                ("b".to_string(), 2),
                ("c".to_string(), 1),
            ]
        );
    }

    #[test]
    fn big_variant_matches_plain_variant_multiset() {
        let dir = tempfile::tempdir().unwrap();
        let input: Vec<i32> = (0..100).collect();

        let mut pool_a = WorkerPool::new(Some(3), None);
        let mut progress_a = SilentSink;
        let plain = map_reduce(
            &mut pool_a,
            input.clone().into_iter(),
            Some(100),
            |x: i32| vec![(x % 4, x)],
            |k: i32, vs: Vec<i32>| vec![(k, vs.into_iter().sum::<i32>())],
            &mut progress_a,
        )
        .unwrap();
        let mut plain_out: Vec<(i32, i32)> = plain.map(|r| r.unwrap()).collect();
        plain_out.sort();

        let mut pool_b = WorkerPool::new(Some(3), None);
        let mut progress_b = SilentSink;
        let big = map_reduce_big(
            &mut pool_b,
            input.into_iter(),
            Some(100),
            |x: i32| vec![(x % 4, x)],
            |k: i32, vs: Vec<i32>| vec![(k, vs.into_iter().sum::<i32>())],
            &mut progress_b,
            dir.path(),
        )
        .unwrap();
        let mut big_out: Vec<(i32, i32)> = big.map(|r| r.unwrap()).collect();
        big_out.sort();

        assert_eq!(plain_out, big_out);
    }

    #[test]
    fn big_variant_handles_values_too_large_to_keep_in_memory() {
        // Distinct payloads per key, so every value is its own on-disk
        // record — this exercises the plain spill/resolve path without
        // dedup collapsing anything.
        let dir = tempfile::tempdir().unwrap();
        let mut pool = WorkerPool::new(Some(3), None);
        let mut progress = SilentSink;

        let input: Vec<i32> = (0..100).collect();
        let results = map_reduce_big(
            &mut pool,
            input.into_iter(),
            Some(100),
            move |x: i32| vec![(x % 4, vec![x as u8; 100_000])],
            |k: i32, vs: Vec<Vec<u8>>| vec![(k, vs.len())],
            &mut progress,
            dir.path(),
        )
        .unwrap();

        let mut out: Vec<(i32, usize)> = results.map(|r| r.unwrap()).collect();
        out.sort();
        assert_eq!(out, vec![(0, 25), (1, 25), (2, 25), (3, 25)]);
    }

    #[test]
    fn big_variant_dedups_identical_payloads_on_disk() {
        // 100 inputs, each mapping to (x % 4, zeros(100_000)): every mapper
        // output is byte-identical, so the spill file should hold at most
        // 4 copies of the payload, not 100.
        let dir = tempfile::tempdir().unwrap();
        let mut pool = WorkerPool::new(Some(3), None);
        let mut progress = SilentSink;
        let payload = vec![0u8; 100_000];

        let input: Vec<i32> = (0..100).collect();
        let stream = map_reduce_big(
            &mut pool,
            input.into_iter(),
            Some(100),
            move |x: i32| vec![(x % 4, payload.clone())],
            |k: i32, vs: Vec<Vec<u8>>| vec![(k, vs.len())],
            &mut progress,
            dir.path(),
        )
        .unwrap();

        let total_bytes: u64 = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.metadata().unwrap().len())
            .sum();
        assert!(
            total_bytes <= 4 * 100_000 + 4096,
            "spill file held {total_bytes} bytes, expected at most 4 deduped copies"
        );

        let mut out: Vec<(i32, usize)> = stream.map(|r| r.unwrap()).collect();
        out.sort();
        assert_eq!(out, vec![(0, 25), (1, 25), (2, 25), (3, 25)]);
    }

    #[test]
    fn big_variant_unlinks_its_spill_file_once_drained() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = WorkerPool::new(Some(2), None);
        let mut progress = SilentSink;
        let stream = map_reduce_big(
            &mut pool,
            vec![1i32, 2, 3].into_iter(),
            Some(3),
            |x: i32| vec![(0i32, x)],
            |_k: i32, vs: Vec<i32>| vec![vs.into_iter().sum::<i32>()],
            &mut progress,
            dir.path(),
        )
        .unwrap();
        let _: Vec<i32> = stream.map(|r| r.unwrap()).collect();

        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(remaining.is_empty());
    }
}
