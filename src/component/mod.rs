//! On-disk component: an immutable sorted run with a bloom filter.
//!
//! File layout:
//! ```text
//! [data blocks...]
//! [bloom block]
//! [index block]
//! [properties block]
//! [footer]
//! ```
//!
//! Data block format:
//! ```text
//! [count u32]
//! repeated count times: [tuple record]
//! [crc32c u32 over everything before the trailer]
//! ```
//!
//! Index entries map `last_stripped_key_in_block -> {offset, len}`.
//!
//! A component is written once, in ascending stripped-key order, by exactly
//! one merge. It is readable the whole time: flushed blocks are served from
//! the file, the unflushed tail from memory. `writes_done` seals the block
//! structure, `force` makes the file durable (fsync + rename), and from
//! then on the component is the immutable run the read paths see.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bloomfilter::Bloom;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::options::BlsmOptions;
use crate::tuple::Tuple;

mod iter;

pub(crate) use iter::DiskIter;

const MAGIC: &[u8; 8] = b"BLSMCMP1";
const FOOTER_SIZE: usize = 8 + 4 + 8 + 4 + 8 + 4 + 8;
const BLOCK_TRAILER_SIZE: usize = 4;
const PAGE_SIZE: u64 = 4096;
const BLOOM_FP_RATE: f64 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IndexEntry {
    last_stripped: Bytes,
    offset: u64,
    len: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ComponentProperties {
    pub file_id: u64,
    pub tuple_count: u64,
    pub byte_count: u64,
    pub smallest: Option<Bytes>,
    pub largest: Option<Bytes>,
}

#[derive(Serialize, Deserialize)]
struct BloomMeta {
    bitmap: Vec<u8>,
    bits: u64,
    hashes: u32,
    sip_keys: [(u64, u64); 2],
}

struct Footer {
    bloom_offset: u64,
    bloom_len: u32,
    index_offset: u64,
    index_len: u32,
    props_offset: u64,
    props_len: u32,
}

pub(crate) struct DiskComponent {
    file_id: u64,
    inner: RwLock<Inner>,
}

struct Inner {
    file: Arc<File>,
    path: PathBuf,
    final_path: PathBuf,
    sealed: bool,
    writes_done: bool,
    blocks: Vec<IndexEntry>,
    tail: Vec<Tuple>,
    tail_bytes: usize,
    write_offset: u64,
    block_size: usize,
    last_key: Option<Bytes>,
    bloom: Bloom<[u8]>,
    props: ComponentProperties,
}

impl DiskComponent {
    /// Fresh scratch component for a merge output. `bloom_target` is the
    /// expected tuple count the filter is sized for.
    pub fn create(
        dir: &Path,
        file_id: u64,
        opts: &BlsmOptions,
        bloom_target: u64,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)?;
        let path = tmp_path(dir, file_id);
        let final_path = final_path(dir, file_id);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let block_size = opts.block_size as usize;
        // Rough block-count estimate from the region hints: one index entry
        // per block's worth of data pages, capped by the internal region.
        let pages_per_block = (opts.block_size / (opts.datapage_size.max(1) * PAGE_SIZE)).max(1);
        let index_capacity = (opts.datapage_region_size / pages_per_block)
            .min(opts.internal_region_size)
            .min(4096) as usize;

        Ok(Arc::new(Self {
            file_id,
            inner: RwLock::new(Inner {
                file: Arc::new(file),
                path,
                final_path,
                sealed: false,
                writes_done: false,
                blocks: Vec::with_capacity(index_capacity),
                tail: Vec::new(),
                tail_bytes: 0,
                write_offset: 0,
                block_size,
                last_key: None,
                bloom: Bloom::new_for_fp_rate(bloom_target.max(1) as usize, BLOOM_FP_RATE),
                props: ComponentProperties {
                    file_id,
                    ..ComponentProperties::default()
                },
            }),
        }))
    }

    /// Opens a sealed component from its final path.
    pub fn open(dir: &Path, file_id: u64) -> Result<Arc<Self>> {
        let path = final_path(dir, file_id);
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_SIZE as u64 {
            return Err(Error::Corrupt("component file too short"));
        }

        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer_buf, file_len - FOOTER_SIZE as u64)?;
        let footer = decode_footer(&footer_buf)?;

        let bloom_meta: BloomMeta =
            bincode::deserialize(&read_span(&file, footer.bloom_offset, footer.bloom_len)?)?;
        let blocks: Vec<IndexEntry> =
            bincode::deserialize(&read_span(&file, footer.index_offset, footer.index_len)?)?;
        let props: ComponentProperties =
            bincode::deserialize(&read_span(&file, footer.props_offset, footer.props_len)?)?;
        if props.file_id != file_id {
            return Err(Error::Corrupt("component file id mismatch"));
        }

        let bloom = Bloom::from_existing(
            &bloom_meta.bitmap,
            bloom_meta.bits,
            bloom_meta.hashes,
            bloom_meta.sip_keys,
        );

        Ok(Arc::new(Self {
            file_id,
            inner: RwLock::new(Inner {
                file: Arc::new(file),
                path: path.clone(),
                final_path: path,
                sealed: true,
                writes_done: true,
                blocks,
                tail: Vec::new(),
                tail_bytes: 0,
                write_offset: footer.bloom_offset,
                block_size: 0,
                last_key: None,
                bloom,
                props,
            }),
        }))
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn tuple_count(&self) -> u64 {
        self.inner.read().props.tuple_count
    }

    pub fn byte_count(&self) -> u64 {
        self.inner.read().props.byte_count
    }

    pub fn bloom_lookup(&self, stripped_key: &[u8]) -> bool {
        self.inner.read().bloom.check(stripped_key)
    }

    /// Appends one tuple to the scratch output. Keys must arrive strictly
    /// ascending on the stripped key.
    pub fn insert_tuple(&self, t: &Tuple) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.writes_done {
            return Err(Error::Corrupt("tuple inserted after writes_done"));
        }
        if let Some(last) = &inner.last_key {
            if t.stripped_key() <= last.as_ref() {
                return Err(Error::Corrupt(
                    "tuples must be inserted in ascending stripped-key order",
                ));
            }
        }

        inner.bloom.set(t.stripped_key());
        inner.last_key = Some(t.stripped_key_bytes());
        if inner.props.smallest.is_none() {
            inner.props.smallest = Some(t.stripped_key_bytes());
        }
        inner.props.largest = Some(t.stripped_key_bytes());
        inner.props.tuple_count += 1;
        inner.props.byte_count += t.byte_length();

        inner.tail_bytes += t.encoded_len();
        inner.tail.push(t.clone());
        if inner.tail_bytes >= inner.block_size {
            flush_block(&mut inner)?;
        }
        Ok(())
    }

    /// Seals the block structure: flushes the tail block and writes the
    /// bloom, index, properties, and footer.
    pub fn writes_done(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.writes_done {
            return Ok(());
        }
        if !inner.tail.is_empty() {
            flush_block(&mut inner)?;
        }

        let bloom_meta = BloomMeta {
            bitmap: inner.bloom.bitmap(),
            bits: inner.bloom.number_of_bits(),
            hashes: inner.bloom.number_of_hash_functions(),
            sip_keys: inner.bloom.sip_keys(),
        };
        let bloom_bytes = bincode::serialize(&bloom_meta)?;
        let index_bytes = bincode::serialize(&inner.blocks)?;
        let props_bytes = bincode::serialize(&inner.props)?;

        let footer = Footer {
            bloom_offset: inner.write_offset,
            bloom_len: bloom_bytes.len() as u32,
            index_offset: inner.write_offset + bloom_bytes.len() as u64,
            index_len: index_bytes.len() as u32,
            props_offset: inner.write_offset + (bloom_bytes.len() + index_bytes.len()) as u64,
            props_len: props_bytes.len() as u32,
        };

        let mut buf =
            Vec::with_capacity(bloom_bytes.len() + index_bytes.len() + props_bytes.len() + FOOTER_SIZE);
        buf.extend_from_slice(&bloom_bytes);
        buf.extend_from_slice(&index_bytes);
        buf.extend_from_slice(&props_bytes);
        buf.extend_from_slice(&encode_footer(&footer));
        inner.file.write_all_at(&buf, inner.write_offset)?;
        inner.write_offset += buf.len() as u64;
        inner.writes_done = true;
        Ok(())
    }

    /// Durability point: fsync, then rename into the final path. The open
    /// file handle survives the rename, so concurrent readers are
    /// undisturbed.
    pub fn force(&self) -> Result<()> {
        self.writes_done()?;
        let mut inner = self.inner.write();
        if inner.sealed {
            return Ok(());
        }
        inner.file.sync_data()?;
        std::fs::rename(&inner.path, &inner.final_path)?;
        fsync_parent_dir(&inner.final_path)?;
        inner.path = inner.final_path.clone();
        inner.sealed = true;
        Ok(())
    }

    /// Releases the component's storage. Readers holding the open handle
    /// keep working until they drop it.
    pub fn dealloc(&self) -> Result<()> {
        let inner = self.inner.read();
        match std::fs::remove_file(&inner.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Point lookup by stripped key.
    pub fn get(&self, stripped_key: &[u8]) -> Result<Option<Tuple>> {
        let inner = self.inner.read();
        if !inner.bloom.check(stripped_key) {
            return Ok(None);
        }

        let idx = inner
            .blocks
            .partition_point(|b| b.last_stripped.as_ref() < stripped_key);
        if idx < inner.blocks.len() {
            let tuples = read_block(&inner, idx)?;
            if let Ok(pos) = tuples.binary_search_by(|t| t.stripped_key().cmp(stripped_key)) {
                return Ok(Some(tuples[pos].clone()));
            }
            return Ok(None);
        }

        if let Ok(pos) = inner
            .tail
            .binary_search_by(|t| t.stripped_key().cmp(stripped_key))
        {
            return Ok(Some(inner.tail[pos].clone()));
        }
        Ok(None)
    }

    /// Streaming iterator over tuples with stripped key >= `start_key`.
    pub fn open_iterator(self: &Arc<Self>, start_key: Option<&[u8]>) -> DiskIter {
        DiskIter::new(self.clone(), start_key.map(Bytes::copy_from_slice))
    }
}

fn flush_block(inner: &mut Inner) -> Result<()> {
    let mut payload = Vec::with_capacity(inner.tail_bytes + 4 + BLOCK_TRAILER_SIZE);
    payload.extend_from_slice(&(inner.tail.len() as u32).to_le_bytes());
    for t in &inner.tail {
        t.encode_into(&mut payload);
    }
    let crc = crc32c::crc32c(&payload);
    payload.extend_from_slice(&crc.to_le_bytes());

    inner.file.write_all_at(&payload, inner.write_offset)?;
    let last_stripped = inner
        .tail
        .last()
        .map(|t| t.stripped_key_bytes())
        .ok_or(Error::Corrupt("flush of empty block"))?;
    inner.blocks.push(IndexEntry {
        last_stripped,
        offset: inner.write_offset,
        len: payload.len() as u32,
    });
    inner.write_offset += payload.len() as u64;
    inner.tail.clear();
    inner.tail_bytes = 0;
    Ok(())
}

fn read_block(inner: &Inner, idx: usize) -> Result<Vec<Tuple>> {
    let entry = &inner.blocks[idx];
    let raw = read_span(&inner.file, entry.offset, entry.len)?;
    if raw.len() < 4 + BLOCK_TRAILER_SIZE {
        return Err(Error::Corrupt("component block too short"));
    }
    let (payload, trailer) = raw.split_at(raw.len() - BLOCK_TRAILER_SIZE);
    let stored_crc = u32::from_le_bytes(trailer.try_into().unwrap());
    if crc32c::crc32c(payload) != stored_crc {
        return Err(Error::Corrupt("component block checksum mismatch"));
    }

    let count = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    let mut tuples = Vec::with_capacity(count);
    let mut pos = 4usize;
    for _ in 0..count {
        let (t, used) = Tuple::decode(&payload[pos..])?;
        pos += used;
        tuples.push(t);
    }
    Ok(tuples)
}

fn read_span(file: &File, offset: u64, len: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len as usize];
    file.read_exact_at(&mut buf, offset)?;
    Ok(buf)
}

fn encode_footer(footer: &Footer) -> [u8; FOOTER_SIZE] {
    let mut buf = [0u8; FOOTER_SIZE];
    buf[0..8].copy_from_slice(&footer.bloom_offset.to_le_bytes());
    buf[8..12].copy_from_slice(&footer.bloom_len.to_le_bytes());
    buf[12..20].copy_from_slice(&footer.index_offset.to_le_bytes());
    buf[20..24].copy_from_slice(&footer.index_len.to_le_bytes());
    buf[24..32].copy_from_slice(&footer.props_offset.to_le_bytes());
    buf[32..36].copy_from_slice(&footer.props_len.to_le_bytes());
    buf[36..44].copy_from_slice(MAGIC);
    buf
}

fn decode_footer(buf: &[u8; FOOTER_SIZE]) -> Result<Footer> {
    if &buf[36..44] != MAGIC {
        return Err(Error::Corrupt("bad component magic"));
    }
    Ok(Footer {
        bloom_offset: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
        bloom_len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        index_offset: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
        index_len: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        props_offset: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        props_len: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
    })
}

fn final_path(dir: &Path, file_id: u64) -> PathBuf {
    dir.join(format!("cmp_{file_id:016x}.cmp"))
}

fn tmp_path(dir: &Path, file_id: u64) -> PathBuf {
    dir.join(format!("cmp_{file_id:016x}.tmp"))
}

fn fsync_parent_dir(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or(Error::Corrupt("component path has no parent"))?;
    File::open(parent)?.sync_all()?;
    Ok(())
}
