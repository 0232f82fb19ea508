//! Crash-safe file primitives for the journal directory.
//!
//! Every full-file write goes through a sibling temp file, fsync, then an
//! atomic rename: a crash at any instant leaves either the old file or the
//! new one, never a partial. Appends are fsync'd before returning.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use calm_schema::Result;

/// Write `contents` to `path` via temp + fsync + rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp = path.with_file_name(format!("{file_name}.tmp"));

    let write_result: Result<()> = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = write_result {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

/// Append one JSON line and fsync so it survives a crash immediately after.
pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(value)
        .map_err(|err| calm_schema::CalmError::CorruptState(format!("encoding journal line: {err}")))?;
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}

/// Read a JSONL file, tolerating a corrupt final line.
///
/// A torn trailing line (crash mid-append) is repaired by truncating the file
/// back to the last good record. Corrupt lines elsewhere are skipped with a
/// warning so one bad record never takes the whole journal down.
pub fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut entries = Vec::new();
    let mut offset: u64 = 0;
    let mut truncate_at: Option<u64> = None;
    let mut skipped = 0usize;

    for (line_idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line_start = offset;
        offset += line.len() as u64 + 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(entry) => {
                entries.push(entry);
                truncate_at = None;
            }
            Err(err) => {
                skipped += 1;
                truncate_at = Some(line_start);
                warn!(
                    line = line_idx + 1,
                    error = %err,
                    path = %path.display(),
                    "corrupt journal line"
                );
            }
        }
    }

    // Only a trailing corrupt region is repaired; mid-file damage is left for
    // inspection.
    if let Some(at) = truncate_at {
        let file = fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(at)?;
        file.sync_all()?;
        warn!(path = %path.display(), offset = at, "journal tail truncated after torn write");
    } else if skipped > 0 {
        warn!(path = %path.display(), skipped, "journal read skipped corrupt lines");
    }

    Ok(entries)
}
