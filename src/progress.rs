//! Progress reporting surface.
//!
//! The engine only promises one `begin` per stage, one `step` per
//! worker-completion in the parallel path (or per item in the in-caller
//! path), and one `end` per stage. What a sink does with those calls is its
//! own business — the two built-ins here mirror the reference tool's percent
//! bar and dot-per-worker display, re-architected as owned state on the sink
//! rather than attributes bolted onto a callback function.

use std::io::Write;
use std::time::Instant;

/// Which phase of a job a progress call refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StageTag {
    Map,
    Reduce,
    MapReduce,
}

/// Receives begin/step/end notifications for a running stage.
///
/// `begin` is called once per stage with the input length if known. `step`
/// is called once per worker completion in the parallel path (not once per
/// item — once per worker-completion keeps progress overhead independent
/// of input size) or once per item in the in-caller path. `end` is
/// called once per stage, after the last `step`.
pub trait ProgressSink: Send {
    fn begin(&mut self, stage: StageTag, len_hint: Option<usize>);
    fn step(&mut self, stage: StageTag);
    fn end(&mut self, stage: StageTag);
}

/// Does nothing. The default when a caller supplies no sink.
#[derive(Default)]
pub struct SilentSink;

impl ProgressSink for SilentSink {
    fn begin(&mut self, _stage: StageTag, _len_hint: Option<usize>) {}
    fn step(&mut self, _stage: StageTag) {}
    fn end(&mut self, _stage: StageTag) {}
}

/// One dot per completed worker, used when the input length is unknown.
pub struct DotsSink<W: Write = std::io::Stderr> {
    out: W,
    open: bool,
}

impl DotsSink<std::io::Stderr> {
    pub fn new() -> Self {
        Self {
            out: std::io::stderr(),
            open: false,
        }
    }
}

impl Default for DotsSink<std::io::Stderr> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> ProgressSink for DotsSink<W> {
    fn begin(&mut self, stage: StageTag, _len_hint: Option<usize>) {
        let label = match stage {
            StageTag::Map => "map",
            StageTag::Reduce => "reduce",
            StageTag::MapReduce => "mapreduce",
        };
        let _ = write!(self.out, "[{label}: ");
        self.open = true;
    }

    fn step(&mut self, _stage: StageTag) {
        if self.open {
            let _ = write!(self.out, ".");
        }
    }

    fn end(&mut self, _stage: StageTag) {
        if self.open {
            let _ = writeln!(self.out, "]");
            self.open = false;
        }
    }
}

/// A widening percent bar, used when the input length is known. Advances in
/// 5-point increments, matching the reference tool's display.
pub struct PercentSink<W: Write = std::io::Stderr> {
    out: W,
    t0: Option<Instant>,
    endstage: Option<StageTag>,
    len: usize,
    at: usize,
    pct: u32,
}

impl PercentSink<std::io::Stderr> {
    pub fn new() -> Self {
        Self {
            out: std::io::stderr(),
            t0: None,
            endstage: None,
            len: 0,
            at: 0,
            pct: 5,
        }
    }
}

impl Default for PercentSink<std::io::Stderr> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> ProgressSink for PercentSink<W> {
    fn begin(&mut self, stage: StageTag, len_hint: Option<usize>) {
        if self.t0.is_none() {
            self.t0 = Some(Instant::now());
            self.endstage = Some(stage);
        }

        if matches!(stage, StageTag::Map | StageTag::Reduce) {
            self.len = len_hint.unwrap_or(0);
            self.at = 0;
            self.pct = 5;
            match stage {
                StageTag::Map => {
                    let _ = write!(self.out, "[m ({} elem): ", self.len);
                }
                StageTag::Reduce => {
                    let _ = write!(self.out, "|");
                }
                StageTag::MapReduce => unreachable!(),
            }
        }
    }

    fn step(&mut self, _stage: StageTag) {
        self.at += 1;
        if self.len == 0 {
            return;
        }
        let pct = 100.0 * self.at as f64 / self.len as f64;
        while self.pct as f64 <= pct {
            let sign = if self.at <= self.len { ':' } else { '+' };
            let _ = write!(self.out, "{sign}");
            self.pct += 5;
        }
    }

    fn end(&mut self, stage: StageTag) {
        if self.endstage == Some(stage) {
            if let Some(t0) = self.t0.take() {
                let elapsed = t0.elapsed();
                let _ = writeln!(self.out, "]  {:.2} sec", elapsed.as_secs_f64());
            }
            self.endstage = None;
        }
    }
}
