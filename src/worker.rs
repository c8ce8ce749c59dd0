//! The worker command protocol.
//!
//! Each worker runs on its own OS thread and understands two commands: enter
//! mapping mode with a given kernel, or exit. While mapping, it drains a
//! shared input channel of `(index, item)` pairs, invokes the kernel per
//! item, and forwards every result the kernel produced, tagged with that
//! item's index for bookkeeping only. A `Done` sentinel on the input channel
//! ends the current mapping pass; the worker emits its own `Done` and goes
//! back to waiting on its command channel.
//!
//! Kernels are type-erased to `Box<dyn Any + Send>` at this layer so that the
//! same worker thread can be reused, unmodified, across stages whose item
//! and result types differ — [`crate::pool::WorkerPool`] restores the real
//! types at the call boundary.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub(crate) type AnyBox = Box<dyn Any + Send>;
pub(crate) type ErasedKernel = Arc<dyn Fn(AnyBox) -> Vec<AnyBox> + Send + Sync>;

pub(crate) enum Command {
    Map(ErasedKernel),
    Exit,
}

pub(crate) enum InputMsg {
    Item(usize, AnyBox),
    Done,
}

pub(crate) enum OutputMsg {
    Result(usize, AnyBox),
    Done,
    Crashed(usize, String),
}

pub(crate) struct WorkerHandle {
    pub(crate) cmd_tx: flume::Sender<Command>,
    pub(crate) join: Option<std::thread::JoinHandle<()>>,
}

pub(crate) fn spawn_worker(
    id: usize,
    cmd_rx: flume::Receiver<Command>,
    input_rx: flume::Receiver<InputMsg>,
    output_tx: flume::Sender<OutputMsg>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("maprunner-worker-{id}"))
        .spawn(move || worker_loop(id, cmd_rx, input_rx, output_tx))
        .expect("failed to spawn worker thread")
}

fn worker_loop(
    id: usize,
    cmd_rx: flume::Receiver<Command>,
    input_rx: flume::Receiver<InputMsg>,
    output_tx: flume::Sender<OutputMsg>,
) {
    tracing::debug!(worker = id, "worker started");

    while let Ok(command) = cmd_rx.recv() {
        let kernel = match command {
            Command::Map(kernel) => kernel,
            Command::Exit => {
                tracing::debug!(worker = id, "worker exiting");
                return;
            }
        };

        loop {
            match input_rx.recv() {
                Ok(InputMsg::Item(i, item)) => {
                    match panic::catch_unwind(AssertUnwindSafe(|| kernel(item))) {
                        Ok(results) => {
                            for result in results {
                                if output_tx.send(OutputMsg::Result(i, result)).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(payload) => {
                            let message = panic_message(payload);
                            tracing::warn!(worker = id, %message, "kernel panicked");
                            let _ = output_tx.send(OutputMsg::Crashed(id, message));
                            return;
                        }
                    }
                }
                Ok(InputMsg::Done) => {
                    if output_tx.send(OutputMsg::Done).is_err() {
                        return;
                    }
                    break;
                }
                Err(_) => {
                    // Shared input channel disconnected: every producer is
                    // gone, there's nothing left to do.
                    return;
                }
            }
        }
    }

    tracing::debug!(worker = id, "worker exiting (command channel closed)");
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "kernel panicked with a non-string payload".to_string()
    }
}
