//! A single-host, multi-worker map-reduce execution engine for
//! embarrassingly parallel workloads.
//!
//! [`WorkerPool::imap_unordered`] is the one primitive everything else is
//! built on: a bounded, unordered parallel map over a sequence, backed by N
//! long-lived worker threads. [`mapreduce::map_reduce`] and
//! [`mapreduce::map_reduce_big`] add grouping-by-key on top of a single
//! map/reduce pair; [`chain::map_reduce_chain`] composes a runtime-length
//! sequence of such stages, spilling intermediate values to disk with
//! content-addressed dedup between hops.

pub mod adapters;
pub mod chain;
pub mod config;
pub mod digest;
pub mod error;
pub mod logging;
pub mod mapreduce;
pub mod pool;
pub mod progress;
pub mod spill;
mod worker;

pub use chain::{map_reduce_chain, ChainStream, Kernel};
pub use error::{EngineError, EngineResult};
pub use mapreduce::{map_reduce, map_reduce_big, GroupMap, SpilledReduce};
pub use pool::{UnorderedIter, WorkerPool, MIN_TASKS_FOR_PARALLEL};
pub use progress::{DotsSink, PercentSink, ProgressSink, SilentSink, StageTag};
pub use spill::{DedupTable, Offset, SpillReader, SpillStore};
