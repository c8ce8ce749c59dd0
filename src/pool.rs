//! The worker pool: a bounded, unordered parallel map over a sequence.
//!
//! `imap_unordered` is the one primitive everything else in this crate is
//! built on. It lazily fans an input sequence out to N long-lived worker
//! threads and streams back whatever each invocation produced, in whatever
//! order workers finish. Callers that don't want — or don't have enough work
//! to justify — real parallelism fall back to running the kernel inline.

use crate::error::{EngineError, EngineResult};
use crate::progress::{ProgressSink, StageTag};
use crate::worker::{spawn_worker, AnyBox, Command, ErasedKernel, InputMsg, OutputMsg, WorkerHandle};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Below this many known items, the in-caller path is taken even with
/// multiple workers available — dispatch overhead would dwarf the work.
pub const MIN_TASKS_FOR_PARALLEL: usize = 3;

fn env_nworkers() -> usize {
    std::env::var("NWORKERS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
}

fn env_debug() -> bool {
    std::env::var("DEBUG")
        .ok()
        .map(|v| v != "0" && !v.is_empty())
        .unwrap_or(false)
}

struct PoolChannels {
    workers: Vec<WorkerHandle>,
    input_tx: flume::Sender<InputMsg>,
    output_rx: flume::Receiver<OutputMsg>,
}

/// Owns N worker threads and drives `imap_unordered` over them.
///
/// Workers are created lazily on the first stage that actually needs the
/// parallel path, and reused by every later stage regardless of that
/// stage's item/result types (see [`crate::worker`] for how that type
/// erasure works).
pub struct WorkerPool {
    nworkers: usize,
    debug: bool,
    channels: Option<PoolChannels>,
}

impl WorkerPool {
    /// Creates a pool. `nworkers` overrides the `NWORKERS` environment
    /// variable, which in turn overrides the host's CPU count. `debug`
    /// overrides the `DEBUG` environment variable; callers that resolve
    /// their own `EngineConfig` (CLI > env > file > default) should pass
    /// its `debug` field here rather than leaving this to fall back to the
    /// raw environment variable.
    pub fn new(nworkers: Option<usize>, debug: Option<bool>) -> Self {
        Self {
            nworkers: nworkers.unwrap_or_else(env_nworkers).max(1),
            debug: debug.unwrap_or_else(env_debug),
            channels: None,
        }
    }

    pub fn nworkers(&self) -> usize {
        self.nworkers
    }

    fn ensure_workers(&mut self) {
        if self.channels.is_some() {
            return;
        }
        let input_capacity = 2 * self.nworkers;
        let (input_tx, input_rx) = flume::bounded(input_capacity);
        let (output_tx, output_rx) = flume::bounded(2 * self.nworkers);

        let workers = (0..self.nworkers)
            .map(|id| {
                let (cmd_tx, cmd_rx) = flume::bounded(1);
                let join = spawn_worker(id, cmd_rx, input_rx.clone(), output_tx.clone());
                WorkerHandle {
                    cmd_tx,
                    join: Some(join),
                }
            })
            .collect();

        self.channels = Some(PoolChannels {
            workers,
            input_tx,
            output_rx,
        });
    }

    /// Runs `kernel` over every element of `input`, yielding results as soon
    /// as any invocation produces them. `len_hint` should be `Some` whenever
    /// the caller can cheaply compute the input length — it drives both the
    /// parallel/in-caller decision and the percent-bar progress sink.
    pub fn imap_unordered<'p, T, R>(
        &mut self,
        input: impl Iterator<Item = T> + Send + 'static,
        len_hint: Option<usize>,
        kernel: impl Fn(T) -> Vec<R> + Send + Sync + 'static,
        progress: &'p mut dyn ProgressSink,
        stage: StageTag,
    ) -> EngineResult<UnorderedIter<'p, T, R>>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        progress.begin(stage, len_hint);

        let parallel = self.nworkers > 1
            && !self.debug
            && len_hint.map_or(true, |n| n >= MIN_TASKS_FOR_PARALLEL);

        if !parallel {
            return Ok(UnorderedIter::inline(input, kernel, progress, stage));
        }

        self.ensure_workers();
        let channels = self
            .channels
            .as_ref()
            .expect("ensure_workers just populated this");

        let kernel = Arc::new(kernel);
        let erased: ErasedKernel = Arc::new(move |item: AnyBox| {
            let item = *item
                .downcast::<T>()
                .expect("worker pool protocol: input type mismatch");
            kernel(item)
                .into_iter()
                .map(|r| Box::new(r) as AnyBox)
                .collect()
        });

        for worker in &channels.workers {
            worker
                .cmd_tx
                .send(Command::Map(erased.clone()))
                .map_err(|_| {
                    EngineError::ProtocolViolation("worker command channel closed early".into())
                })?;
        }

        let input_tx = channels.input_tx.clone();
        let nworkers = self.nworkers;
        std::thread::spawn(move || {
            for (i, item) in input.enumerate() {
                if input_tx.send(InputMsg::Item(i, Box::new(item))).is_err() {
                    return;
                }
            }
            for _ in 0..nworkers {
                if input_tx.send(InputMsg::Done).is_err() {
                    return;
                }
            }
        });

        Ok(UnorderedIter::parallel(
            channels.output_rx.clone(),
            nworkers,
            progress,
            stage,
        ))
    }

    /// Sends `Exit` to every worker and joins its thread. Reclaims workers
    /// so a caller that abandons a job mid-stream doesn't
    /// leak threads.
    pub fn teardown(&mut self) {
        if let Some(channels) = self.channels.take() {
            let PoolChannels {
                mut workers,
                input_tx,
                output_rx,
            } = channels;

            // Drop the output receiver first: any worker still blocked
            // writing to a full output channel (e.g. because its sibling
            // crashed and the caller stopped draining) gets a disconnect
            // error and returns instead of deadlocking against a join that
            // is itself waiting on it.
            drop(output_rx);
            drop(input_tx);

            for worker in &workers {
                let _ = worker.cmd_tx.send(Command::Exit);
            }
            for worker in &mut workers {
                if let Some(join) = worker.join.take() {
                    let _ = join.join();
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.teardown();
    }
}

enum IterKind<T, R> {
    Inline {
        input: Box<dyn Iterator<Item = T> + Send>,
        kernel: Arc<dyn Fn(T) -> Vec<R> + Send + Sync>,
        pending: std::collections::VecDeque<R>,
        failed: bool,
    },
    Parallel {
        rx: flume::Receiver<OutputMsg>,
        nworkers: usize,
        completed: usize,
        pending: std::collections::VecDeque<R>,
        error: Option<EngineError>,
        _marker: PhantomData<T>,
    },
}

/// The lazy sequence of results `imap_unordered` yields. Item type is
/// `EngineResult<R>` so a kernel failure surfaces exactly once, at the point
/// it would have produced the next result, instead of
/// silently truncating the stream.
pub struct UnorderedIter<'p, T, R> {
    kind: IterKind<T, R>,
    progress: &'p mut dyn ProgressSink,
    stage: StageTag,
    ended: bool,
}

impl<'p, T, R> UnorderedIter<'p, T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn inline(
        input: impl Iterator<Item = T> + Send + 'static,
        kernel: impl Fn(T) -> Vec<R> + Send + Sync + 'static,
        progress: &'p mut dyn ProgressSink,
        stage: StageTag,
    ) -> Self {
        Self {
            kind: IterKind::Inline {
                input: Box::new(input),
                kernel: Arc::new(kernel),
                pending: std::collections::VecDeque::new(),
                failed: false,
            },
            progress,
            stage,
            ended: false,
        }
    }

    fn parallel(
        rx: flume::Receiver<OutputMsg>,
        nworkers: usize,
        progress: &'p mut dyn ProgressSink,
        stage: StageTag,
    ) -> Self {
        Self {
            kind: IterKind::Parallel {
                rx,
                nworkers,
                completed: 0,
                pending: std::collections::VecDeque::new(),
                error: None,
                _marker: PhantomData,
            },
            progress,
            stage,
            ended: false,
        }
    }

    fn finish(&mut self) {
        if !self.ended {
            self.progress.end(self.stage);
            self.ended = true;
        }
    }
}

impl<'p, T, R> Iterator for UnorderedIter<'p, T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    type Item = EngineResult<R>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.kind {
                IterKind::Inline {
                    input,
                    kernel,
                    pending,
                    failed,
                } => {
                    if *failed {
                        self.finish();
                        return None;
                    }
                    if let Some(r) = pending.pop_front() {
                        return Some(Ok(r));
                    }
                    match input.next() {
                        Some(item) => {
                            let kernel = kernel.clone();
                            match panic::catch_unwind(AssertUnwindSafe(|| kernel(item))) {
                                Ok(results) => {
                                    pending.extend(results);
                                    self.progress.step(self.stage);
                                }
                                Err(_) => {
                                    *failed = true;
                                    self.finish();
                                    return Some(Err(EngineError::KernelFailure {
                                        worker: 0,
                                        message: "kernel panicked in in-caller path".into(),
                                    }));
                                }
                            }
                        }
                        None => {
                            self.finish();
                            return None;
                        }
                    }
                }
                IterKind::Parallel {
                    rx,
                    nworkers,
                    completed,
                    pending,
                    error,
                    ..
                } => {
                    if let Some(r) = pending.pop_front() {
                        return Some(Ok(r));
                    }
                    if completed == nworkers {
                        let outcome = error.take().map(Err);
                        self.finish();
                        return outcome;
                    }
                    match rx.recv() {
                        Ok(OutputMsg::Result(_i, boxed)) => {
                            let value = *boxed
                                .downcast::<R>()
                                .expect("worker pool protocol: output type mismatch");
                            return Some(Ok(value));
                        }
                        Ok(OutputMsg::Done) => {
                            *completed += 1;
                            self.progress.step(self.stage);
                            continue;
                        }
                        Ok(OutputMsg::Crashed(id, message)) => {
                            // Count the crashed worker as completed (it will
                            // never send Done) but keep draining so any
                            // sibling worker still writing to a bounded
                            // output channel doesn't block forever against
                            // an abandoned receiver.
                            *completed += 1;
                            if error.is_none() {
                                *error = Some(EngineError::KernelFailure { worker: id, message });
                            }
                            continue;
                        }
                        Err(_) => {
                            // Channel disconnected before every worker
                            // reported in: fewer than N acknowledgements.
                            // The shared channel gives no way to tell which
                            // worker vanished, so this can't name one.
                            if error.is_none() {
                                *error = Some(EngineError::WorkerCrash { worker: 0 });
                            }
                            *completed = *nworkers;
                            continue;
                        }
                    }
                }
            }
        }
    }
}

impl<'p, T, R> Drop for UnorderedIter<'p, T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn drop(&mut self) {
        self.finish();
    }
}
