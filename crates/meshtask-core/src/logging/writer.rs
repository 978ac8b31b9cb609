//! Append-only JSONL writer, one file per peer per day

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::{JsonLogEntry, SessionMetadata};

/// Appends entries to `logs/raw/<date>_<peer>.jsonl`
pub struct PeerLogWriter {
    peer: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl PeerLogWriter {
    /// Open (or create) today's log file for `peer` under `logs_dir`
    pub fn new(logs_dir: impl AsRef<Path>, peer: impl Into<String>) -> io::Result<Self> {
        let peer = peer.into();
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{}_{}.jsonl", date, peer));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            peer,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush, so a crashed peer still leaves its log
    pub fn write(&self, entry: &JsonLogEntry) -> io::Result<()> {
        let json = entry
            .to_json_line()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }

    pub fn write_raw(
        &self,
        level: &str,
        target: &str,
        message: &str,
        fields: Option<serde_json::Value>,
    ) -> io::Result<()> {
        let mut entry = JsonLogEntry::new(level, &self.peer, target, message);
        if let Some(f) = fields {
            entry = entry.with_fields(f);
        }
        self.write(&entry)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }
}

impl Drop for PeerLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Write `metadata` to `logs/sessions/<session_id>.json`
pub fn write_session_metadata(
    logs_dir: impl AsRef<Path>,
    metadata: &SessionMetadata,
) -> io::Result<PathBuf> {
    let sessions_dir = logs_dir.as_ref().join("sessions");
    fs::create_dir_all(&sessions_dir)?;

    let path = sessions_dir.join(format!("{}.json", metadata.session_id));
    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(&path, json)?;

    Ok(path)
}

/// Read every peer's entries, merged and sorted by timestamp
///
/// Lines that fail to parse are skipped.
pub fn read_all_entries(logs_dir: impl AsRef<Path>) -> io::Result<Vec<JsonLogEntry>> {
    let raw_dir = logs_dir.as_ref().join("raw");
    if !raw_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for dir_entry in fs::read_dir(&raw_dir)? {
        let path = dir_entry?.path();
        if path.extension().map(|e| e != "jsonl").unwrap_or(true) {
            continue;
        }
        let content = fs::read_to_string(&path)?;
        entries.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .filter_map(|line| JsonLogEntry::from_json_line(line).ok()),
        );
    }

    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}

/// Entries written by one peer, in timestamp order
pub fn entries_for_peer(logs_dir: impl AsRef<Path>, peer: &str) -> io::Result<Vec<JsonLogEntry>> {
    Ok(read_all_entries(logs_dir)?
        .into_iter()
        .filter(|e| e.peer == peer)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_creates_raw_dir() {
        let temp = TempDir::new().unwrap();
        let logs_dir = temp.path().join("logs");

        let writer = PeerLogWriter::new(&logs_dir, "peer-k3x").unwrap();

        assert!(logs_dir.join("raw").exists());
        assert!(writer.path().exists());
        assert!(writer.path().to_string_lossy().ends_with("_peer-k3x.jsonl"));
    }

    #[test]
    fn test_merge_two_peers() {
        let temp = TempDir::new().unwrap();
        let logs_dir = temp.path().join("logs");

        let a = PeerLogWriter::new(&logs_dir, "peer-a").unwrap();
        let b = PeerLogWriter::new(&logs_dir, "peer-b").unwrap();
        a.write_raw("info", "mesh", "Link open", None).unwrap();
        b.write_raw("info", "mesh", "Link open", None).unwrap();
        b.write_raw("warn", "mesh", "Link closed", None).unwrap();
        drop(a);
        drop(b);

        let all = read_all_entries(&logs_dir).unwrap();
        assert_eq!(all.len(), 3);

        let only_b = entries_for_peer(&logs_dir, "peer-b").unwrap();
        assert_eq!(only_b.len(), 2);
        assert_eq!(only_b[1].level, "warn");
    }

    #[test]
    fn test_garbage_lines_skipped() {
        let temp = TempDir::new().unwrap();
        let raw = temp.path().join("raw");
        fs::create_dir_all(&raw).unwrap();
        fs::write(raw.join("x_peer.jsonl"), "not json\n\n").unwrap();
        assert!(read_all_entries(temp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(read_all_entries(temp.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_session_metadata_file() {
        let temp = TempDir::new().unwrap();
        let meta = SessionMetadata::new(vec!["peer-a".into(), "peer-b".into()]);
        let path = write_session_metadata(temp.path(), &meta).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"peer-b\""));
    }
}
