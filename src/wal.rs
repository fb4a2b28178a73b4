//! Write-ahead log.
//!
//! One record per tuple write, framed as `[len u32][crc32c u32][lsn u64]
//! [tuple]`. The file begins with a fixed header carrying the base LSN of
//! the first record. Truncation after a mem-merge commit rewrites the file
//! keeping only records at or past the truncation point; a torn tail is
//! detected by length/checksum mismatch and dropped at replay.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::options::{BlsmOptions, LogMode};
use crate::tuple::Tuple;

const WAL_MAGIC: &[u8; 8] = b"BLSMWAL1";
const WAL_HEADER_SIZE: u64 = 8 + 8;
const FRAME_HEADER_SIZE: usize = 4 + 4 + 8;

pub(crate) struct Wal {
    path: PathBuf,
    mode: LogMode,
    batch_size: usize,
    inner: Mutex<WalInner>,
}

struct WalInner {
    file: File,
    next_lsn: u64,
    base_lsn: u64,
    appends_since_sync: usize,
}

impl Wal {
    pub fn open(dir: &Path, opts: &BlsmOptions) -> Result<Self> {
        let path = dir.join("wal.log");
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let (base_lsn, next_lsn) = if len < WAL_HEADER_SIZE {
            file.set_len(0)?;
            write_header(&mut file, 0)?;
            (0, 0)
        } else {
            let base = read_header(&mut file)?;
            let next = scan_tail(&mut file, base)?;
            (base, next)
        };
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path,
            mode: opts.log_mode,
            batch_size: opts.batch_size,
            inner: Mutex::new(WalInner {
                file,
                next_lsn,
                base_lsn,
                appends_since_sync: 0,
            }),
        })
    }

    /// LSN the next record will be stamped with.
    pub fn log_offset(&self) -> u64 {
        self.inner.lock().next_lsn
    }

    /// Appends one tuple record and returns its LSN. Under
    /// [`LogMode::None`] no bytes are written but the LSN still advances,
    /// so merge bookkeeping stays uniform across modes.
    pub fn append(&self, t: &Tuple) -> Result<u64> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        if matches!(self.mode, LogMode::None) {
            return Ok(lsn);
        }

        let mut payload = Vec::with_capacity(t.encoded_len());
        t.encode_into(&mut payload);
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
        frame.extend_from_slice(&lsn.to_le_bytes());
        frame.extend_from_slice(&payload);
        inner.file.write_all(&frame)?;

        match self.mode {
            LogMode::None => {}
            LogMode::Sync => inner.file.sync_data()?,
            LogMode::Batch => {
                inner.appends_since_sync += 1;
                if inner.appends_since_sync >= self.batch_size {
                    inner.file.sync_data()?;
                    inner.appends_since_sync = 0;
                }
            }
        }
        Ok(lsn)
    }

    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_data()?;
        inner.appends_since_sync = 0;
        Ok(())
    }

    /// Drops every record with `lsn < up_to`. Called after a mem-merge
    /// commit, whose input is durable in the new component.
    pub fn truncate(&self, up_to: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if up_to <= inner.base_lsn {
            return Ok(());
        }

        let mut survivors = Vec::new();
        replay_records(&mut inner.file, |lsn, raw| {
            if lsn >= up_to {
                survivors.push((lsn, raw.to_vec()));
            }
        })?;

        let tmp = self.path.with_extension("tmp");
        let mut new_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp)?;
        write_header(&mut new_file, up_to)?;
        for (lsn, payload) in survivors {
            let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
            frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            frame.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
            frame.extend_from_slice(&lsn.to_le_bytes());
            frame.extend_from_slice(&payload);
            new_file.write_all(&frame)?;
        }
        new_file.sync_data()?;
        std::fs::rename(&tmp, &self.path)?;

        new_file.seek(SeekFrom::End(0))?;
        inner.file = new_file;
        inner.base_lsn = up_to;
        inner.appends_since_sync = 0;
        Ok(())
    }

    /// Feeds every surviving record with `lsn >= from` to `f`, in log
    /// order. Used once at open to rebuild C0.
    pub fn replay(&self, from: u64, mut f: impl FnMut(u64, Tuple)) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut decode_err = None;
        replay_records(&mut inner.file, |lsn, raw| {
            if lsn < from || decode_err.is_some() {
                return;
            }
            match Tuple::decode(raw) {
                Ok((t, _)) => f(lsn, t),
                Err(e) => decode_err = Some(e),
            }
        })?;
        inner.file.seek(SeekFrom::End(0))?;
        match decode_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn write_header(file: &mut File, base_lsn: u64) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(WAL_MAGIC)?;
    file.write_all(&base_lsn.to_le_bytes())?;
    Ok(())
}

fn read_header(file: &mut File) -> Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != WAL_MAGIC {
        return Err(Error::Corrupt("bad wal magic"));
    }
    let mut base = [0u8; 8];
    file.read_exact(&mut base)?;
    Ok(u64::from_le_bytes(base))
}

/// Walks the log from the first record, calling `f(lsn, payload)` for every
/// intact frame. Stops silently at a torn tail.
fn replay_records(file: &mut File, mut f: impl FnMut(u64, &[u8])) -> Result<()> {
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(WAL_HEADER_SIZE))?;
    let mut pos = WAL_HEADER_SIZE;

    loop {
        if pos + FRAME_HEADER_SIZE as u64 > len {
            break;
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        file.read_exact(&mut header)?;
        let payload_len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
        let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let lsn = u64::from_le_bytes(header[8..16].try_into().unwrap());
        if pos + FRAME_HEADER_SIZE as u64 + payload_len > len {
            break;
        }
        let mut payload = vec![0u8; payload_len as usize];
        file.read_exact(&mut payload)?;
        if crc32c::crc32c(&payload) != crc {
            break;
        }
        f(lsn, &payload);
        pos += FRAME_HEADER_SIZE as u64 + payload_len;
    }
    Ok(())
}

/// Returns the next LSN after the last intact record.
fn scan_tail(file: &mut File, base_lsn: u64) -> Result<u64> {
    let mut next = base_lsn;
    replay_records(file, |lsn, _| next = lsn + 1)?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn sync_opts() -> BlsmOptions {
        BlsmOptions {
            log_mode: LogMode::Sync,
            ..BlsmOptions::default()
        }
    }

    fn put(key: &str, value: &str, ts: u64) -> Tuple {
        Tuple::put(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
            ts,
        )
    }

    #[test]
    fn append_replay_roundtrip() -> Result<()> {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(dir.path(), &sync_opts())?;
            assert_eq!(wal.append(&put("a", "1", 1))?, 0);
            assert_eq!(wal.append(&put("b", "2", 2))?, 1);
            assert_eq!(wal.log_offset(), 2);
        }
        let wal = Wal::open(dir.path(), &sync_opts())?;
        assert_eq!(wal.log_offset(), 2);
        let mut seen = Vec::new();
        wal.replay(0, |lsn, t| {
            seen.push((lsn, t.stripped_key_bytes()));
        })?;
        assert_eq!(
            seen,
            vec![(0, Bytes::from_static(b"a")), (1, Bytes::from_static(b"b"))]
        );
        Ok(())
    }

    #[test]
    fn truncate_keeps_only_newer_records() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), &sync_opts())?;
        for i in 0..10u64 {
            wal.append(&put(&format!("k{i}"), "v", i))?;
        }
        wal.truncate(7)?;
        let mut lsns = Vec::new();
        wal.replay(0, |lsn, _| lsns.push(lsn))?;
        assert_eq!(lsns, vec![7, 8, 9]);

        // Appends after truncation continue the sequence.
        assert_eq!(wal.append(&put("z", "v", 10))?, 10);
        Ok(())
    }

    #[test]
    fn torn_tail_is_ignored() -> Result<()> {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(dir.path(), &sync_opts())?;
            wal.append(&put("a", "1", 1))?;
            wal.append(&put("b", "2", 2))?;
        }
        // Chop bytes off the last frame.
        let path = dir.path().join("wal.log");
        let len = std::fs::metadata(&path)?.len();
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(len - 3)?;

        let wal = Wal::open(dir.path(), &sync_opts())?;
        let mut seen = Vec::new();
        wal.replay(0, |_, t| seen.push(t.stripped_key_bytes()))?;
        assert_eq!(seen, vec![Bytes::from_static(b"a")]);
        // The torn record's LSN is reused.
        assert_eq!(wal.log_offset(), 1);
        Ok(())
    }

    #[test]
    fn log_mode_none_advances_lsn_without_writing() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), &BlsmOptions::default())?;
        assert_eq!(wal.append(&put("a", "1", 1))?, 0);
        assert_eq!(wal.log_offset(), 1);
        let mut count = 0;
        wal.replay(0, |_, _| count += 1)?;
        assert_eq!(count, 0);
        Ok(())
    }
}
