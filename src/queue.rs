//! Broadcast queue file reader (C8).
//!
//! External producers append JSON-per-line records to a shared file; this
//! reader polls it once per reactor tick with a non-blocking shared lock,
//! tracking a byte offset so repeated polls only look at new data.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use fs2::FileExt;
use serde::Deserialize;
use tracing::warn;

use crate::server::ServerHandle;

#[derive(Debug, Deserialize)]
struct BroadcastRecord {
    #[serde(rename = "type")]
    kind: String,
    event: String,
    data: serde_json::Value,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    room: Option<String>,
}

/// Tracks read progress through the queue file across ticks.
pub struct QueueReader {
    offset: u64,
    /// Bytes read past the last complete line, held until the rest arrives.
    carry: Vec<u8>,
}

impl Default for QueueReader {
    fn default() -> Self {
        Self {
            offset: 0,
            carry: Vec::new(),
        }
    }
}

impl QueueReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt one non-blocking poll of `path`, applying any complete
    /// records found to `server.broadcast`. Absent files and lock
    /// contention are not errors — the file may not exist yet, or a writer
    /// may be mid-append; both resolve on a later tick.
    pub fn poll(&mut self, path: &Path, server: &ServerHandle) {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(?err, path = %path.display(), "failed to open broadcast queue file");
                return;
            }
        };

        if file.try_lock_shared().is_err() {
            return;
        }

        let result = self.drain(&mut file, server);
        let _ = file.unlock();

        if let Err(err) = result {
            warn!(?err, path = %path.display(), "failed to read broadcast queue file");
        }
    }

    fn drain(&mut self, file: &mut File, server: &ServerHandle) -> std::io::Result<()> {
        let len = file.metadata()?.len();
        if len < self.offset {
            // File was truncated or replaced; start over.
            self.offset = 0;
            self.carry.clear();
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk)?;
        if chunk.is_empty() {
            return Ok(());
        }

        self.carry.extend_from_slice(&chunk);
        self.offset += chunk.len() as u64;

        // Only consume whole lines; keep a trailing partial line for next time.
        let mut consumed_through = 0;
        for line in self.carry.split_inclusive(|&b| b == b'\n') {
            if line.last() != Some(&b'\n') {
                break;
            }
            consumed_through += line.len();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            if text.trim().is_empty() {
                continue;
            }
            apply_line(&text, server);
        }
        self.carry.drain(..consumed_through);
        Ok(())
    }
}

fn apply_line(line: &str, server: &ServerHandle) {
    let record: BroadcastRecord = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(err) => {
            warn!(%err, line, "skipping malformed broadcast queue record");
            return;
        }
    };
    if record.kind != "broadcast" {
        warn!(kind = record.kind, "skipping unknown broadcast queue record type");
        return;
    }
    server.broadcast(
        &record.event,
        record.data,
        record.namespace.as_deref(),
        record.room.as_deref(),
    );
}
