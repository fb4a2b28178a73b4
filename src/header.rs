//! Persistent header record.
//!
//! A single fixed record naming the live disk components, the
//! merge-manager state worth carrying across restarts, and the WAL
//! truncation point. The record is rewritten whole, through a temp file and
//! an fsynced rename; the rename is the commit point, so a failed write
//! leaves the previous header (and therefore the previous component set)
//! intact.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const HEADER_MAGIC: &[u8; 8] = b"BLSMHDR1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TableHeader {
    pub c1_file_id: u64,
    pub c2_file_id: u64,
    /// Present between a cascade commit and the disk-merge commit that
    /// consumes the component.
    pub c1_mergeable_file_id: Option<u64>,
    pub next_file_id: u64,
    pub r_val: f64,
    pub mean_c0_run_length: u64,
    pub merge_stats: [(u64, u64); 3],
    pub log_trunc: u64,
}

pub(crate) struct HeaderStore {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl HeaderStore {
    pub fn open(dir: &Path) -> Result<(Self, Option<TableHeader>)> {
        let store = Self {
            path: dir.join("header"),
            tmp_path: dir.join("header.tmp"),
        };
        let existing = match std::fs::read(&store.path) {
            Ok(raw) => Some(store.decode(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok((store, existing))
    }

    /// Atomically replaces the header. Returns only after the new record is
    /// durable.
    pub fn commit(&self, header: &TableHeader) -> Result<()> {
        let body = bincode::serialize(header)?;
        let mut raw = Vec::with_capacity(8 + 4 + body.len());
        raw.extend_from_slice(HEADER_MAGIC);
        raw.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
        raw.extend_from_slice(&body);

        let mut file = File::create(&self.tmp_path)?;
        file.write_all(&raw)?;
        file.sync_data()?;
        std::fs::rename(&self.tmp_path, &self.path)?;
        let parent = self
            .path
            .parent()
            .ok_or(Error::Corrupt("header path has no parent"))?;
        File::open(parent)?.sync_all()?;
        Ok(())
    }

    fn decode(&self, raw: &[u8]) -> Result<TableHeader> {
        if raw.len() < 12 || &raw[0..8] != HEADER_MAGIC {
            return Err(Error::Corrupt("bad header magic"));
        }
        let crc = u32::from_le_bytes(raw[8..12].try_into().unwrap());
        let body = &raw[12..];
        if crc32c::crc32c(body) != crc {
            return Err(Error::Corrupt("header checksum mismatch"));
        }
        Ok(bincode::deserialize(body)?)
    }
}
