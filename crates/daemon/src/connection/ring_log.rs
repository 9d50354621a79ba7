// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! Reader for the WireGuard service ring-buffer log (`log.bin`)
//!
//! Layout: `u32` magic, `u32` next index, then 2048 slots of 512 bytes, each
//! an `i64` timestamp in nanoseconds followed by NUL-terminated UTF-8 text.
//! The next index only grows; slot = index % 2048.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

pub const RING_MAGIC: u32 = 0x0bad_babe;
pub const RING_SLOTS: u32 = 2048;
pub const SLOT_SIZE: usize = 512;
const HEADER_SIZE: u64 = 8;
const TIMESTAMP_SIZE: usize = 8;

const TUNNEL_RUNNING_MARKER: &str = "Startup complete";
const HANDSHAKE_FAILED_MARKER: &str = "did not complete after";
const HANDSHAKE_OK_MARKER: &str = "Receiving handshake response";
const ADAPTER_FAILED_MARKERS: &[&str] = &["Failed to setup adapter", "Unable to create network adapter"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: Option<DateTime<Utc>>,
    pub text: String,
}

#[derive(Debug)]
pub struct RingLogReader {
    path: PathBuf,
    cursor: Option<u32>,
    tunnel_running: bool,
    handshake_failed: bool,
    adapter_setup_failed: bool,
}

impl RingLogReader {
    /// Lines already present when the reader is created are skipped
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cursor = read_header(&path).ok().flatten();
        Self {
            path,
            cursor,
            tunnel_running: false,
            handshake_failed: false,
            adapter_setup_failed: false,
        }
    }

    pub fn tunnel_running(&self) -> bool {
        self.tunnel_running
    }

    /// A handshake failure was logged in the latest batch and not yet
    /// followed by a handshake response
    pub fn handshake_failed(&self) -> bool {
        self.handshake_failed
    }

    pub fn adapter_setup_failed(&self) -> bool {
        self.adapter_setup_failed
    }

    /// Read and log lines written since the last call
    pub fn read_new_lines(&mut self) -> Vec<LogLine> {
        let lines = match self.read_lines() {
            Ok(lines) => lines,
            Err(e) => {
                debug!("Ring log {} unreadable: {}", self.path.display(), e);
                Vec::new()
            }
        };

        self.handshake_failed = false;
        for line in &lines {
            debug!(target: "wireguard", "{}", line.text);

            if line.text.contains(TUNNEL_RUNNING_MARKER) {
                self.tunnel_running = true;
            }
            if line.text.contains(HANDSHAKE_FAILED_MARKER) {
                self.handshake_failed = true;
            } else if line.text.contains(HANDSHAKE_OK_MARKER) {
                self.handshake_failed = false;
            }
            if ADAPTER_FAILED_MARKERS.iter().any(|m| line.text.contains(m)) {
                self.adapter_setup_failed = true;
            }
        }

        lines
    }

    /// Drain whatever the service wrote while shutting down
    pub fn read_final_lines(&mut self) -> Vec<LogLine> {
        self.read_new_lines()
    }

    fn read_lines(&mut self) -> std::io::Result<Vec<LogLine>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let Some(next_index) = header_from(&mut file)? else {
            return Ok(Vec::new());
        };

        let mut cursor = self.cursor.unwrap_or(0);
        if next_index < cursor {
            // File was recreated by a new service instance
            cursor = 0;
        }
        if next_index - cursor > RING_SLOTS {
            cursor = next_index - RING_SLOTS;
        }

        let mut lines = Vec::with_capacity((next_index - cursor) as usize);
        let mut slot = [0u8; SLOT_SIZE];
        for index in cursor..next_index {
            let offset = HEADER_SIZE + u64::from(index % RING_SLOTS) * SLOT_SIZE as u64;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut slot)?;
            if let Some(line) = decode_slot(&slot) {
                lines.push(line);
            }
        }

        self.cursor = Some(next_index);
        Ok(lines)
    }
}

fn read_header(path: &Path) -> std::io::Result<Option<u32>> {
    let mut file = File::open(path)?;
    header_from(&mut file)
}

/// Next index, or None when the magic does not match
fn header_from(file: &mut File) -> std::io::Result<Option<u32>> {
    let mut header = [0u8; HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    if let Err(e) = file.read_exact(&mut header) {
        return if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Ok(None)
        } else {
            Err(e)
        };
    }

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != RING_MAGIC {
        return Ok(None);
    }
    Ok(Some(u32::from_le_bytes([header[4], header[5], header[6], header[7]])))
}

fn decode_slot(slot: &[u8; SLOT_SIZE]) -> Option<LogLine> {
    let mut ts = [0u8; TIMESTAMP_SIZE];
    ts.copy_from_slice(&slot[..TIMESTAMP_SIZE]);
    let nanos = i64::from_le_bytes(ts);

    let text = &slot[TIMESTAMP_SIZE..];
    let end = text.iter().position(|b| *b == 0).unwrap_or(text.len());
    let text = String::from_utf8_lossy(&text[..end]).trim_end().to_string();
    if text.is_empty() {
        return None;
    }

    let timestamp = (nanos > 0).then(|| DateTime::<Utc>::from_timestamp_nanos(nanos));
    Some(LogLine { timestamp, text })
}
