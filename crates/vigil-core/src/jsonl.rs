//! Append-only JSONL persistence.
//!
//! Every durable artifact of the runtime (audit log, transcripts, job table,
//! affect snapshots) is a file of one JSON document per line. Readers skip
//! malformed lines instead of failing so a torn write never bricks a store.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::Result;

/// Append one record as a single line, creating the file and its parent if needed.
pub fn append<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(record)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Append several records with a single write. Every record is serialized
/// before anything touches the file, so a failure leaves it unchanged.
pub fn append_all<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let mut buf = String::new();
    for record in records {
        buf.push_str(&serde_json::to_string(record)?);
        buf.push('\n');
    }
    if buf.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(buf.as_bytes())?;
    Ok(())
}

/// Read every parseable record. A missing file reads as empty.
pub fn read_all<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(fs::File::open(path)?);
    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping malformed jsonl line");
            }
        }
    }
    Ok(records)
}

/// The last parseable record, if any.
pub fn read_last<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    Ok(read_all::<T>(path)?.pop())
}

/// Replace the file's content with `records`. Written to a sibling temp file
/// and renamed into place so readers never observe a partial table.
pub fn rewrite<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        for record in records {
            writeln!(file, "{}", serde_json::to_string(record)?)?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Atomically replace a single-document JSON file (not JSONL).
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a single-document JSON file. A missing file reads as `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&raw)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        n: u32,
    }

    #[test]
    fn test_append_then_read_all() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("rows.jsonl");
        append(&path, &Row { n: 1 }).unwrap();
        append(&path, &Row { n: 2 }).unwrap();
        let rows: Vec<Row> = read_all(&path).unwrap();
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }]);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.jsonl");
        fs::write(&path, "{\"n\":1}\nnot json\n{\"n\":3}\n{\"n\":").unwrap();
        let rows: Vec<Row> = read_all(&path).unwrap();
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 3 }]);
    }

    #[test]
    fn test_rewrite_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.jsonl");
        append(&path, &Row { n: 9 }).unwrap();
        rewrite(&path, &[Row { n: 1 }]).unwrap();
        assert_eq!(read_last::<Row>(&path).unwrap(), Some(Row { n: 1 }));
        assert_eq!(read_all::<Row>(&path).unwrap().len(), 1);
    }

    /// Serializes only while `ok` is set.
    struct Fragile {
        ok: bool,
    }

    impl Serialize for Fragile {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
            if self.ok {
                serializer.serialize_u32(1)
            } else {
                Err(serde::ser::Error::custom("refused"))
            }
        }
    }

    #[test]
    fn test_append_all_is_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.jsonl");
        append_all(&path, &[Row { n: 1 }, Row { n: 2 }]).unwrap();
        assert_eq!(read_all::<Row>(&path).unwrap().len(), 2);

        let before = fs::read_to_string(&path).unwrap();
        assert!(append_all(&path, &[Fragile { ok: true }, Fragile { ok: false }]).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let rows: Vec<Row> = read_all(&dir.path().join("absent.jsonl")).unwrap();
        assert!(rows.is_empty());
        assert!(read_json::<Row>(&dir.path().join("absent.json")).unwrap().is_none());
    }
}
