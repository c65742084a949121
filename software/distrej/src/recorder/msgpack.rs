//! MessagePack record: a single map with keys `t`, `y`, `d`, `u`, each an array of doubles

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Recorder, TimeSeriesRecord, create_file, output_path};
use crate::experiment::context::ExperimentCtx;

/// Writes the whole record as one MessagePack map, to `<op_dir>/<op_name>.bin`
/// unless a file name is given.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct MsgpackRecorder {
    /// File name within the op dir, overriding `<op_name>.bin`
    file_name: Option<String>,
}

impl MsgpackRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file_name(file_name: &str) -> Self {
        Self {
            file_name: Some(file_name.to_owned()),
        }
    }

    fn path(&self, ctx: &ExperimentCtx) -> PathBuf {
        match &self.file_name {
            Some(name) => ctx.op_dir.join(name),
            None => output_path(ctx, "bin"),
        }
    }
}

#[typetag::serde]
impl Recorder for MsgpackRecorder {
    fn record(
        &mut self,
        ctx: &ExperimentCtx,
        record: &TimeSeriesRecord,
    ) -> Result<PathBuf, String> {
        if !record.is_consistent() {
            return Err("Record series have mismatched lengths".to_owned());
        }

        let path = self.path(ctx);
        let mut writer = create_file(&path)?;
        rmp_serde::encode::write_named(&mut writer, record)
            .map_err(|e| format!("Failed to encode record to {path:?}: {e}"))?;
        writer
            .flush()
            .map_err(|e| format!("Failed to write {path:?}: {e}"))?;

        info!("Wrote {} samples to {path:?}", record.len());
        Ok(path)
    }
}

/// Load a record written by `MsgpackRecorder`
pub fn read_msgpack(path: &Path) -> Result<TimeSeriesRecord, String> {
    let file = File::open(path).map_err(|e| format!("Unable to open {path:?}: {e}"))?;
    rmp_serde::from_read(BufReader::new(file))
        .map_err(|e| format!("Failed to decode record from {path:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_in(dir: &Path) -> ExperimentCtx {
        let mut ctx = ExperimentCtx::default();
        ctx.op_dir = dir.to_path_buf();
        ctx.op_name = "run".to_owned();
        ctx
    }

    #[test]
    fn test_written_as_named_map() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = TimeSeriesRecord::default();
        r.push(0.0, 1.5, 0.0, -1.7);

        let path = MsgpackRecorder::new().record(&ctx_in(dir.path()), &r).unwrap();
        assert_eq!(path, dir.path().join("run.bin"));

        let bytes = std::fs::read(&path).unwrap();
        // fixmap with 4 entries, first key "t"
        assert_eq!(bytes[0], 0x84);
        assert_eq!(&bytes[1..3], &[0xa1, b't']);

        let back = read_msgpack(&path).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = TimeSeriesRecord::default();
        r.push(0.25, 2.0, 3.0, 1.0);

        let path = MsgpackRecorder::with_file_name("distRejTemp.bin")
            .record(&ctx_in(dir.path()), &r)
            .unwrap();
        assert_eq!(path, dir.path().join("distRejTemp.bin"));

        // Keys appear as single-character fixstrs in the order t, y, d, u
        let bytes = std::fs::read(&path).unwrap();
        let keys: Vec<u8> = bytes
            .windows(2)
            .filter(|w| w[0] == 0xa1 && b"tydu".contains(&w[1]))
            .map(|w| w[1])
            .collect();
        assert_eq!(keys, b"tydu".to_vec());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_msgpack(&dir.path().join("absent.bin")).is_err());
    }
}
