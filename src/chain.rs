//! Multi-stage map-reduce pipelines.
//!
//! A chain composes a runtime-determined number of kernels `K0, K1, ...,
//! K(m-1)`. `K0` runs over the caller's raw input; every other kernel runs
//! over the grouped output of its predecessor. Because the kernel count and
//! the key/value types at each hop are only known at runtime, values are
//! carried between stages as [`serde_json::Value`] — the typed
//! constructors on [`Kernel`] are the only place that type erasure is
//! visible to a caller.
//!
//! Only two spill files ever exist at once: the one the running stage reads
//! from and the one it writes to. The reader's store is discarded the
//! instant its stage finishes draining it.

use crate::adapters::{PickleInAdapter, PickleOutAdapter, PickledValue};
use crate::error::{EngineError, EngineResult};
use crate::pool::WorkerPool;
use crate::progress::{ProgressSink, StageTag};
use crate::spill::{DedupTable, Offset, SpillStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

type ErasedOnly = Arc<dyn Fn(Value) -> Vec<Value> + Send + Sync>;
type ErasedMap = Arc<dyn Fn(Value) -> Vec<(Value, Value)> + Send + Sync>;
type ErasedReduce = Arc<dyn Fn(Value, Vec<Value>) -> Vec<(Value, Value)> + Send + Sync>;
type ErasedFinish = Arc<dyn Fn(Value, Vec<Value>) -> Vec<Value> + Send + Sync>;

/// One stage of a [`map_reduce_chain`] pipeline.
///
/// Which variant belongs at which position is positional, not enforced by
/// the type system: a chain of length 1 takes a single [`Kernel::Only`]; a
/// longer chain takes one [`Kernel::Map`] followed by zero or more
/// [`Kernel::Reduce`] and a trailing [`Kernel::Finish`]. A kernel in the
/// wrong position is a [`EngineError::ProtocolViolation`] at run time.
#[derive(Clone)]
pub enum Kernel {
    /// The sole stage of a length-1 chain: item in, arbitrary results out,
    /// no grouping at all (equivalent to running `imap_unordered` directly).
    Only(ErasedOnly),
    /// First stage of a chain with more than one kernel: item in, `(k, v)`
    /// pairs out.
    Map(ErasedMap),
    /// A middle stage: grouped `(k, values)` in, `(k, v)` pairs out for the
    /// next grouping.
    Reduce(ErasedReduce),
    /// The last stage of a chain with more than one kernel: grouped
    /// `(k, values)` in, arbitrary results out, streamed to the caller
    /// without further grouping.
    Finish(ErasedFinish),
}

impl Kernel {
    pub fn only<T, R, F>(f: F) -> Self
    where
        T: DeserializeOwned,
        R: Serialize,
        F: Fn(T) -> Vec<R> + Send + Sync + 'static,
    {
        Kernel::Only(Arc::new(move |item: Value| {
            let item: T = serde_json::from_value(item)
                .expect("chain: input value did not match this kernel's declared type");
            f(item)
                .into_iter()
                .map(|r| serde_json::to_value(r).expect("chain: kernel output failed to serialize"))
                .collect()
        }))
    }

    pub fn map<T, K, V, F>(f: F) -> Self
    where
        T: DeserializeOwned,
        K: Serialize,
        V: Serialize,
        F: Fn(T) -> Vec<(K, V)> + Send + Sync + 'static,
    {
        Kernel::Map(Arc::new(move |item: Value| {
            let item: T = serde_json::from_value(item)
                .expect("chain: input value did not match this kernel's declared type");
            f(item)
                .into_iter()
                .map(|(k, v)| {
                    (
                        serde_json::to_value(k).expect("chain: key failed to serialize"),
                        serde_json::to_value(v).expect("chain: value failed to serialize"),
                    )
                })
                .collect()
        }))
    }

    pub fn reduce<K, V, K2, V2, F>(f: F) -> Self
    where
        K: DeserializeOwned,
        V: DeserializeOwned,
        K2: Serialize,
        V2: Serialize,
        F: Fn(K, Vec<V>) -> Vec<(K2, V2)> + Send + Sync + 'static,
    {
        Kernel::Reduce(Arc::new(move |k: Value, vs: Vec<Value>| {
            let k: K = serde_json::from_value(k)
                .expect("chain: grouping key did not match this kernel's declared type");
            let vs: Vec<V> = vs
                .into_iter()
                .map(|v| {
                    serde_json::from_value(v)
                        .expect("chain: grouped value did not match this kernel's declared type")
                })
                .collect();
            f(k, vs)
                .into_iter()
                .map(|(k2, v2)| {
                    (
                        serde_json::to_value(k2).expect("chain: key failed to serialize"),
                        serde_json::to_value(v2).expect("chain: value failed to serialize"),
                    )
                })
                .collect()
        }))
    }

    pub fn finish<K, V, R, F>(f: F) -> Self
    where
        K: DeserializeOwned,
        V: DeserializeOwned,
        R: Serialize,
        F: Fn(K, Vec<V>) -> Vec<R> + Send + Sync + 'static,
    {
        Kernel::Finish(Arc::new(move |k: Value, vs: Vec<Value>| {
            let k: K = serde_json::from_value(k)
                .expect("chain: grouping key did not match this kernel's declared type");
            let vs: Vec<V> = vs
                .into_iter()
                .map(|v| {
                    serde_json::from_value(v)
                        .expect("chain: grouped value did not match this kernel's declared type")
                })
                .collect();
            f(k, vs)
                .into_iter()
                .map(|r| serde_json::to_value(r).expect("chain: kernel output failed to serialize"))
                .collect()
        }))
    }
}

/// Key -> (original key value, offsets of its values in the current
/// stage's store). Keyed internally by the key's canonical JSON text since
/// `serde_json::Value` does not implement `Hash`.
type GroupedValues = HashMap<String, (Value, Vec<Offset>)>;

fn group_with_dedup(
    pairs: impl Iterator<Item = EngineResult<(Value, Value)>>,
    store: &mut SpillStore,
) -> EngineResult<GroupedValues> {
    let mut dedup = DedupTable::new();
    let mut seen = HashSet::new();
    let out_adapter = PickleOutAdapter::<Value>::new();
    let mut groups: GroupedValues = HashMap::new();
    for r in pairs {
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
        let key_repr = serde_json::to_string(&k)?;
        groups.entry(key_repr).or_insert_with(|| (k, Vec::new())).1.push(offset);
    }
    Ok(groups)
}

/// Runs a chain of kernels over `input`, returning the final kernel's
/// output as a lazy sequence of `serde_json::Value`. The caller
/// deserializes each item into its own result type.
pub fn map_reduce_chain<'p, T>(
    pool: &mut WorkerPool,
    input: impl Iterator<Item = T> + Send + 'static,
    len_hint: Option<usize>,
    kernels: Vec<Kernel>,
    progress: &'p mut dyn ProgressSink,
    spill_dir: &Path,
) -> EngineResult<ChainStream<'p>>
where
    T: Serialize + Send + 'static,
{
    let m = kernels.len();
    if m == 0 {
        return Err(EngineError::ProtocolViolation(
            "map_reduce_chain requires at least one kernel".into(),
        ));
    }

    let input_values = input.map(|item| {
        serde_json::to_value(item).expect("chain: input item failed to serialize")
    });

    let mut kernels = kernels.into_iter();
    let first = kernels.next().expect("m >= 1");

    if m == 1 {
        let Kernel::Only(f) = first else {
            return Err(EngineError::ProtocolViolation(
                "a length-1 chain's only kernel must be Kernel::only".into(),
            ));
        };
        let iter = pool.imap_unordered(
            input_values,
            len_hint,
            move |v: Value| f(v),
            progress,
            StageTag::MapReduce,
        )?;
        return Ok(ChainStream {
            iter: Box::new(iter),
            store: None,
        });
    }

    let Kernel::Map(f) = first else {
        return Err(EngineError::ProtocolViolation(
            "the first kernel of a multi-stage chain must be Kernel::map".into(),
        ));
    };

    let mut store = SpillStore::create_in(spill_dir)?;
    let map_out = pool.imap_unordered(
        input_values,
        len_hint,
        move |v: Value| f(v),
        &mut *progress,
        StageTag::Map,
    )?;
    let mut groups = group_with_dedup(map_out, &mut store)?;
    let mut len = groups.len();
    let mut prev_store = store;

    let rest: Vec<Kernel> = kernels.collect();
    for (i, kernel) in rest.into_iter().enumerate() {
        let is_last = i == m - 2;
        let reader = prev_store.reader()?;
        let in_adapter = PickleInAdapter::<Value>::new(reader);
        let stage_input = groups.into_values();

        if is_last {
            let Kernel::Finish(f) = kernel else {
                return Err(EngineError::ProtocolViolation(
                    "the last kernel of a multi-stage chain must be Kernel::finish".into(),
                ));
            };
            let iter = pool.imap_unordered(
                stage_input,
                Some(len),
                move |(k, offsets): (Value, Vec<Offset>)| {
                    let values = in_adapter
                        .resolve(&offsets)
                        .expect("spill store read failed for a recorded offset");
                    f(k, values)
                },
                progress,
                StageTag::Reduce,
            )?;
            return Ok(ChainStream {
                iter: Box::new(iter),
                store: Some(prev_store),
            });
        }

        let Kernel::Reduce(f) = kernel else {
            return Err(EngineError::ProtocolViolation(
                "a middle kernel of a multi-stage chain must be Kernel::reduce".into(),
            ));
        };
        let mut next_store = SpillStore::create_in(spill_dir)?;
        let stage_out = pool.imap_unordered(
            stage_input,
            Some(len),
            move |(k, offsets): (Value, Vec<Offset>)| {
                let values = in_adapter
                    .resolve(&offsets)
                    .expect("spill store read failed for a recorded offset");
                f(k, values)
            },
            &mut *progress,
            StageTag::Reduce,
        )?;
        let next_groups = group_with_dedup(stage_out, &mut next_store)?;

        prev_store.discard()?;
        groups = next_groups;
        len = groups.len();
        prev_store = next_store;
    }

    unreachable!("loop above always returns on its last iteration (is_last)")
}

/// The final stage's output stream, holding its input spill file open until
/// fully drained or abandoned.
///
/// The underlying [`UnorderedIter`] is boxed because a length-1 chain's
/// stream is driven straight off the caller's raw input (`T = Value`) while
/// a longer chain's last stage is driven off grouped offsets
/// (`T = (Value, Vec<Offset>)`) — two distinct `UnorderedIter` types that
/// this struct erases behind one `Iterator` trait object.
pub struct ChainStream<'p> {
    iter: Box<dyn Iterator<Item = EngineResult<Value>> + 'p>,
    store: Option<SpillStore>,
}

impl<'p> Iterator for ChainStream<'p> {
    type Item = EngineResult<Value>;

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

    #[test]
    fn length_one_chain_matches_plain_imap_unordered() {
        let mut pool = WorkerPool::new(Some(2), None);
        let mut progress = SilentSink;
        let input: Vec<i32> = (0..10).collect();
        let kernels = vec![Kernel::only(|x: i32| vec![x * 2])];
        let stream = map_reduce_chain(
            &mut pool,
            input.into_iter(),
            Some(10),
            kernels,
            &mut progress,
            std::env::temp_dir().as_path(),
        )
        .unwrap();
        let mut out: Vec<i32> = stream
            .map(|r| serde_json::from_value(r.unwrap()).unwrap())
            .collect();
        out.sort();
        assert_eq!(out, (0..10).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn two_stage_chain_dedups_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = WorkerPool::new(Some(3), None);
        let mut progress = SilentSink;

        let input: Vec<i32> = (0..1000).collect();
        let kernels = vec![
            Kernel::map(|x: i32| vec![(x % 2, "payload".to_string())]),
            Kernel::finish(|k: i32, vs: Vec<String>| vec![(k, vs.len() as i32)]),
        ];
        let stream = map_reduce_chain(
            &mut pool,
            input.into_iter(),
            Some(1000),
            kernels,
            &mut progress,
            dir.path(),
        )
        .unwrap();

        let mut out: Vec<(i32, i32)> = stream
            .map(|r| serde_json::from_value(r.unwrap()).unwrap())
            .collect();
        out.sort();
        assert_eq!(out, vec![(0, 500), (1, 500)]);

        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(remaining.is_empty());
    }

    #[test]
    fn three_stage_chain_keeps_at_most_two_spill_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = WorkerPool::new(Some(2), None);
        let mut progress = SilentSink;

        let input: Vec<i32> = (0..50).collect();
        let kernels = vec![
            Kernel::map(|x: i32| vec![(x % 5, x)]),
            Kernel::reduce(|k: i32, vs: Vec<i32>| vec![(k, vs.iter().sum::<i32>())]),
            Kernel::finish(|k: i32, vs: Vec<i32>| vec![(k, vs[0])]),
        ];
        let stream = map_reduce_chain(
            &mut pool,
            input.into_iter(),
            Some(50),
            kernels,
            &mut progress,
            dir.path(),
        )
        .unwrap();

        let mut out: Vec<(i32, i32)> = stream
            .map(|r| serde_json::from_value(r.unwrap()).unwrap())
            .collect();
        out.sort();
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn mapper_panic_aborts_the_chain_and_unlinks_spill_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = WorkerPool::new(Some(2), None);
        let mut progress = SilentSink;

        let kernels = vec![
            Kernel::map(|x: i32| {
                if x == 7 {
                    panic!("boom");
                }
                vec![(x % 3, x)]
            }),
            Kernel::finish(|k: i32, vs: Vec<i32>| vec![(k, vs.iter().sum::<i32>())]),
        ];
        // The map stage's output is fully drained (and the panic discovered)
        // before map_reduce_chain ever returns, so the failure surfaces here
        // rather than from the returned stream.
        let result = map_reduce_chain(
            &mut pool,
            (0..20).collect::<Vec<i32>>().into_iter(),
            Some(20),
            kernels,
            &mut progress,
            dir.path(),
        );
        assert!(result.is_err());

        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(remaining.is_empty());
    }

    #[test]
    fn wrong_kernel_position_is_a_protocol_violation() {
        let mut pool = WorkerPool::new(Some(2), None);
        let mut progress = SilentSink;
        let kernels = vec![
            Kernel::finish(|k: i32, vs: Vec<i32>| vec![(k, vs.len() as i32)]),
            Kernel::map(|x: i32| vec![(x, x)]),
        ];
        let result = map_reduce_chain(
            &mut pool,
            vec![1, 2, 3].into_iter(),
            Some(3),
            kernels,
            &mut progress,
            std::env::temp_dir().as_path(),
        );
        assert!(result.is_err());
    }
}
