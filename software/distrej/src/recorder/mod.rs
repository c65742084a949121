//! Recorders persist the time series of a finished run

use core::fmt::Debug;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::experiment::context::ExperimentCtx;

mod csv;
pub use csv::CsvRecorder;

mod msgpack;
pub use msgpack::{MsgpackRecorder, read_msgpack};

/// Per-sample history of a run, one entry per sample period in every vector.
///
/// Field order is the on-disk order of the MessagePack map.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TimeSeriesRecord {
    /// Sample time, `i / sample_rate_hz`
    pub t: Vec<f64>,

    /// Calibrated measurement the command was computed from
    pub y: Vec<f64>,

    /// Injected disturbance
    pub d: Vec<f64>,

    /// Command, zero during warm-up
    pub u: Vec<f64>,
}

impl TimeSeriesRecord {
    /// Empty record with room for `n` samples, so a full run never reallocates
    pub fn with_capacity(n: usize) -> Self {
        Self {
            t: Vec::with_capacity(n),
            y: Vec::with_capacity(n),
            d: Vec::with_capacity(n),
            u: Vec::with_capacity(n),
        }
    }

    #[inline]
    pub fn push(&mut self, t: f64, d: f64, u: f64, y: f64) {
        self.t.push(t);
        self.d.push(d);
        self.u.push(u);
        self.y.push(y);
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    /// Whether all four series have the same length
    pub fn is_consistent(&self) -> bool {
        let n = self.t.len();
        self.y.len() == n && self.d.len() == n && self.u.len() == n
    }
}

/// A sink for the record of a finished run.
///
/// Recorders run once, after the tasks are released, so they may block on file I/O.
#[typetag::serde(tag = "type")]
pub trait Recorder: Send + Sync + Debug {
    /// Persist `record` and return the path written
    fn record(&mut self, ctx: &ExperimentCtx, record: &TimeSeriesRecord)
    -> Result<PathBuf, String>;
}

/// `<op_dir>/<op_name>.<ext>`
pub fn output_path(ctx: &ExperimentCtx, ext: &str) -> PathBuf {
    ctx.op_dir.join(format!("{}.{ext}", ctx.op_name))
}

/// Create the parent directories of `path` and open it for buffered writing
fn create_file(path: &Path) -> Result<BufWriter<File>, String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Unable to create output folder {parent:?}: {e}"))?;
    }
    let file = File::create(path).map_err(|e| format!("Unable to create {path:?}: {e}"))?;
    Ok(BufWriter::new(file))
}

/// Fixed-width formatting of float values
pub fn fmt_f64(num: f64) -> String {
    const PRECISION: usize = 17;
    const EXP_PAD: usize = 3;
    const WIDTH: usize = PRECISION + EXP_PAD + 5;

    let prefix = if num.is_sign_positive() { "+" } else { "" };
    let mut mantissa = format!("{prefix}{num:.precision$e}", precision = PRECISION);

    // Infinities and NaN have no exponent to pad
    let Some(e_at) = mantissa.find('e') else {
        return format!("{mantissa:>width$}", width = WIDTH);
    };
    let exp = mantissa.split_off(e_at);
    let (sign, digits) = match exp.strip_prefix("e-") {
        Some(digits) => ('-', digits),
        None => ('+', &exp[1..]),
    };
    mantissa.push_str(&format!("e{sign}{digits:0>pad$}", pad = EXP_PAD));

    format!("{mantissa:>width$}", width = WIDTH)
}
