// src/cache/durable.rs
//! File-backed cache tier: one file per key, named by SHA-256 of the key.
//!
//! Layout: a single JSON header line `{key, created_at, expires_at}`, `\n`,
//! then the raw value bytes.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const FILE_EXT: &str = "cache";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Header {
    key: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DurableEntry {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub value: Vec<u8>,
}

#[derive(Debug)]
pub enum ReadOutcome {
    Hit(DurableEntry),
    Miss,
    /// File existed but had expired; it has been removed.
    Expired,
    /// File could not be decoded; it has been removed.
    Corrupt(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DurableSweep {
    pub expired: usize,
    pub corrupt: usize,
}

#[derive(Debug, Clone)]
pub struct DurableStore {
    dir: PathBuf,
}

impl DurableStore {
    pub async fn open(dir: &Path) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.{FILE_EXT}", hex::encode(digest)))
    }

    pub async fn read(&self, key: &str, now: DateTime<Utc>) -> io::Result<ReadOutcome> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReadOutcome::Miss),
            Err(e) => return Err(e),
        };

        let (header, value) = match decode(&bytes) {
            Ok(parts) => parts,
            Err(reason) => {
                remove_quietly(&path).await;
                return Ok(ReadOutcome::Corrupt(reason));
            }
        };
        if header.key != key {
            remove_quietly(&path).await;
            return Ok(ReadOutcome::Corrupt(format!(
                "key mismatch: file holds `{}`",
                header.key
            )));
        }
        if header.expires_at <= now {
            remove_quietly(&path).await;
            return Ok(ReadOutcome::Expired);
        }
        Ok(ReadOutcome::Hit(DurableEntry {
            key: header.key,
            created_at: header.created_at,
            expires_at: header.expires_at,
            value,
        }))
    }

    /// Write via temp file + rename so readers never see a half-written entry.
    pub async fn write(&self, entry: &DurableEntry) -> io::Result<()> {
        let path = self.path_for(&entry.key);
        let tmp = path.with_extension("tmp");
        let header = Header {
            key: entry.key.clone(),
            created_at: entry.created_at,
            expires_at: entry.expires_at,
        };
        let bytes = encode(&header, &entry.value)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    pub async fn remove(&self, key: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Remove expired and corrupt files. Unrelated files are left alone.
    pub async fn sweep(&self, now: DateTime<Utc>) -> io::Result<DurableSweep> {
        let mut out = DurableSweep::default();
        let mut rd = tokio::fs::read_dir(&self.dir).await?;
        while let Some(ent) = rd.next_entry().await? {
            let path = ent.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXT) {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(target: "cache", path = %path.display(), error = %e, "sweep read failed");
                    continue;
                }
            };
            match decode(&bytes) {
                Ok((h, _)) if h.expires_at > now => {}
                Ok(_) => {
                    remove_quietly(&path).await;
                    out.expired += 1;
                }
                Err(reason) => {
                    tracing::warn!(target: "cache", path = %path.display(), %reason, "evicting corrupt cache file");
                    remove_quietly(&path).await;
                    out.corrupt += 1;
                }
            }
        }
        Ok(out)
    }
}

fn encode(header: &Header, value: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = serde_json::to_vec(header).map_err(io::Error::other)?;
    out.push(b'\n');
    out.extend_from_slice(value);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<(Header, Vec<u8>), String> {
    let nl = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| "missing header line".to_string())?;
    let header: Header =
        serde_json::from_slice(&bytes[..nl]).map_err(|e| format!("bad header: {e}"))?;
    if header.expires_at < header.created_at {
        return Err("expires_at precedes created_at".to_string());
    }
    Ok((header, bytes[nl + 1..].to_vec()))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(target: "cache", path = %path.display(), error = %e, "remove failed");
        }
    }
}
