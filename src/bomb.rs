//! Bomb file
//!
//! Crash-recovery snapshot of ops that could not be flushed at exit.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                            │
//! │   Magic: "PBMB" (4) | Version: u16 (2) | CRC32: u32 (4)      │
//! │   PayloadLen: u32 (4)                                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Payload: encoded op list                                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The file is written to `{table}.bomb.tmp`, synced, then renamed to
//! `{table}.bomb`. A leftover tmp file means a write was interrupted and
//! is refused at startup.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Buf;

use crate::error::{PersistError, Result};

/// Magic bytes identifying a bomb file
pub const MAGIC: &[u8; 4] = b"PBMB";

/// Current bomb format version
pub const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 14;

/// Location of one table's bomb file
#[derive(Debug, Clone)]
pub struct BombFile {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl BombFile {
    pub fn new(data_dir: &Path, table: &str) -> Self {
        Self {
            path: data_dir.join(format!("{}.bomb", table)),
            tmp_path: data_dir.join(format!("{}.bomb.tmp", table)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Fail if an interrupted write left a tmp file behind
    pub fn check_temp(&self) -> Result<()> {
        if self.tmp_path.exists() {
            return Err(PersistError::TempFileExist(self.tmp_path.clone()));
        }
        Ok(())
    }

    /// Atomically write a payload
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&wrap(payload)?)?;
        writer.flush()?;

        let file = writer
            .into_inner()
            .map_err(|e| PersistError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;
        sync_dir(self.path.parent());
        Ok(())
    }

    /// Read and validate the payload, `None` when there is no bomb file
    pub fn read(&self) -> Result<Option<Vec<u8>>> {
        self.check_temp()?;
        if !self.exists() {
            return Ok(None);
        }
        read_file(&self.path).map(Some)
    }

    /// Delete the bomb file after a successful replay
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read a bomb file at an arbitrary path and return its validated payload
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path)?;
    unwrap(&bytes).map(<[u8]>::to_vec)
}

/// Frame a payload with the bomb header
pub fn wrap(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| PersistError::Codec(format!("bomb payload too large: {}", payload.len())))?;

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Validate the header and checksum, returning the payload
pub fn unwrap(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < HEADER_SIZE {
        return Err(invalid(format!("{} bytes is shorter than the header", bytes.len())));
    }
    if &bytes[..4] != MAGIC {
        return Err(invalid("bad magic".to_string()));
    }

    let mut header = &bytes[4..HEADER_SIZE];
    let version = header.get_u16_le();
    if version != VERSION {
        return Err(invalid(format!("unsupported version {}", version)));
    }
    let crc = header.get_u32_le();
    let len = header.get_u32_le() as usize;

    let payload = &bytes[HEADER_SIZE..];
    if payload.len() != len {
        return Err(invalid(format!(
            "payload length {} does not match header {}",
            payload.len(),
            len
        )));
    }
    let actual = crc32fast::hash(payload);
    if actual != crc {
        return Err(invalid(format!(
            "checksum mismatch: expected {:#010x}, got {:#010x}",
            crc, actual
        )));
    }
    Ok(payload)
}

fn invalid(reason: String) -> PersistError {
    PersistError::InvalidBombFile(reason)
}

/// Best effort: persist the rename on filesystems that need it
fn sync_dir(dir: Option<&Path>) {
    if let Some(dir) = dir {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}
