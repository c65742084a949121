//! Plain-text CSV record, one row per sample.

use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{Recorder, TimeSeriesRecord, create_file, fmt_f64, output_path};
use crate::experiment::context::ExperimentCtx;

/// Writes `<op_dir>/<op_name>.csv` with columns `t,d,u,y`.
///
/// With `fixed_width` set, every value is formatted to the same width, so the
/// row for sample `i` starts at a known byte offset and a reader can seek to
/// any time without scanning the file. Non-finite values also keep that width.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct CsvRecorder {
    fixed_width: bool,
}

impl CsvRecorder {
    pub fn new(fixed_width: bool) -> Self {
        Self { fixed_width }
    }
}

#[typetag::serde]
impl Recorder for CsvRecorder {
    fn record(
        &mut self,
        ctx: &ExperimentCtx,
        record: &TimeSeriesRecord,
    ) -> Result<PathBuf, String> {
        if !record.is_consistent() {
            return Err("Record series have mismatched lengths".to_owned());
        }

        let path = output_path(ctx, "csv");
        let mut writer = create_file(&path)?;
        let err = |e: std::io::Error| format!("Failed to write {path:?}: {e}");

        writer.write_all(b"t,d,u,y\n").map_err(err)?;

        let mut line = String::new();
        for i in 0..record.len() {
            line.clear();
            let row = [record.t[i], record.d[i], record.u[i], record.y[i]];
            for (j, v) in row.iter().enumerate() {
                if j > 0 {
                    line.push(',');
                }
                if self.fixed_width {
                    line.push_str(&fmt_f64(*v));
                } else {
                    line.push_str(&v.to_string());
                }
            }
            line.push('\n');
            writer.write_all(line.as_bytes()).map_err(err)?;
        }
        writer.flush().map_err(err)?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_in(dir: &std::path::Path) -> ExperimentCtx {
        let mut ctx = ExperimentCtx::default();
        ctx.op_dir = dir.to_path_buf();
        ctx.op_name = "run".to_owned();
        ctx
    }

    fn sample_record() -> TimeSeriesRecord {
        let mut r = TimeSeriesRecord::default();
        r.push(0.0, 0.5, 0.0, -1.25);
        r.push(0.0002, 0.75, 1.0, f64::NAN);
        r
    }

    #[test]
    fn test_plain_rows() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());

        let path = CsvRecorder::new(false)
            .record(&ctx, &sample_record())
            .unwrap();
        assert_eq!(path, dir.path().join("run.csv"));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["t,d,u,y", "0,0.5,0,-1.25", "0.0002,0.75,1,NaN"]);
    }

    #[test]
    fn test_fixed_width_rows() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());

        let path = CsvRecorder::new(true)
            .record(&ctx, &sample_record())
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = text.lines().skip(1).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), rows[1].len());

        let y: f64 = rows[0].split(',').nth(3).unwrap().trim().parse().unwrap();
        assert_eq!(y, -1.25);
    }

    #[test]
    fn test_mismatched_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = sample_record();
        r.u.pop();
        assert!(CsvRecorder::new(false).record(&ctx_in(dir.path()), &r).is_err());
    }
}
