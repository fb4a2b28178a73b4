//! Tuple record and ordering.
//!
//! A tuple is the unit stored at every level: `(key, value, timestamp,
//! tombstone)`. Ordering across the whole store is lexicographic on the
//! *stripped key* — the key minus a codec-designated suffix. Timestamps
//! never participate in ordering; the merge paths resolve equal stripped
//! keys by temporal position of the component they came from.

use std::cmp::Ordering;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Immutable data record. Cloning is cheap: key and value bytes are
/// refcounted, so concurrent readers share the underlying buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    key: Bytes,
    stripped_len: usize,
    value: Option<Bytes>,
    timestamp: u64,
}

impl Tuple {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>, timestamp: u64) -> Self {
        let key = key.into();
        let stripped_len = key.len();
        Self {
            key,
            stripped_len,
            value: Some(value.into()),
            timestamp,
        }
    }

    pub fn tombstone(key: impl Into<Bytes>, timestamp: u64) -> Self {
        let key = key.into();
        let stripped_len = key.len();
        Self {
            key,
            stripped_len,
            value: None,
            timestamp,
        }
    }

    /// A tuple whose trailing `suffix_len` key bytes are excluded from
    /// ordering and bloom lookups. The suffix travels with the key but two
    /// keys differing only in the suffix compare equal.
    pub fn with_suffix(
        key: impl Into<Bytes>,
        suffix_len: usize,
        value: Option<Bytes>,
        timestamp: u64,
    ) -> Result<Self> {
        let key = key.into();
        if suffix_len > key.len() {
            return Err(Error::InvalidArgument(format!(
                "key suffix {} longer than key {}",
                suffix_len,
                key.len()
            )));
        }
        let stripped_len = key.len() - suffix_len;
        Ok(Self {
            key,
            stripped_len,
            value,
            timestamp,
        })
    }

    pub fn raw_key(&self) -> &[u8] {
        self.key.as_ref()
    }

    pub fn stripped_key(&self) -> &[u8] {
        &self.key[..self.stripped_len]
    }

    pub fn stripped_key_bytes(&self) -> Bytes {
        self.key.slice(..self.stripped_len)
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Re-stamps the timestamp. Used by the write path when the caller left
    /// it zero; tuples are otherwise immutable.
    pub(crate) fn stamped(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Approximate in-store footprint, used by size accounting everywhere a
    /// level is measured against a byte budget.
    pub fn byte_length(&self) -> u64 {
        let value_len = self.value.as_ref().map(|v| v.len()).unwrap_or(0);
        (self.key.len() + value_len + 16) as u64
    }

    pub fn cmp_stripped(&self, other: &Tuple) -> Ordering {
        self.stripped_key().cmp(other.stripped_key())
    }

    /// Byte-identical check used by the merge garbage collector: same
    /// tombstone state, same value bytes. Timestamps are deliberately not
    /// compared; a re-insert of the same value is still collectible.
    pub fn same_payload(&self, other: &Tuple) -> bool {
        self.value == other.value
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.key.len() + 4 + 8 + 1 + 4 + self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let key_len = self.key.len() as u32;
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(self.key.as_ref());
        buf.extend_from_slice(&(self.stripped_len as u32).to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        match &self.value {
            Some(v) => {
                buf.push(1);
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                buf.extend_from_slice(v.as_ref());
            }
            None => {
                buf.push(0);
                buf.extend_from_slice(&0u32.to_le_bytes());
            }
        }
    }

    pub fn decode(input: &[u8]) -> Result<(Self, usize)> {
        let mut pos = 0usize;
        let key_len = read_u32(input, &mut pos)? as usize;
        if input.len() < pos + key_len {
            return Err(Error::Corrupt("truncated tuple key"));
        }
        let key = Bytes::copy_from_slice(&input[pos..pos + key_len]);
        pos += key_len;
        let stripped_len = read_u32(input, &mut pos)? as usize;
        if stripped_len > key_len {
            return Err(Error::Corrupt("tuple stripped length exceeds key"));
        }
        let timestamp = read_u64(input, &mut pos)?;
        if input.len() < pos + 1 {
            return Err(Error::Corrupt("truncated tuple flag"));
        }
        let has_value = input[pos] == 1;
        pos += 1;
        let value_len = read_u32(input, &mut pos)? as usize;
        if input.len() < pos + value_len {
            return Err(Error::Corrupt("truncated tuple value"));
        }
        let value = if has_value {
            Some(Bytes::copy_from_slice(&input[pos..pos + value_len]))
        } else {
            None
        };
        pos += value_len;
        Ok((
            Self {
                key,
                stripped_len,
                value,
                timestamp,
            },
            pos,
        ))
    }
}

fn read_u32(input: &[u8], pos: &mut usize) -> Result<u32> {
    if input.len() < *pos + 4 {
        return Err(Error::Corrupt("truncated tuple field"));
    }
    let v = u32::from_le_bytes(input[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

fn read_u64(input: &[u8], pos: &mut usize) -> Result<u64> {
    if input.len() < *pos + 8 {
        return Err(Error::Corrupt("truncated tuple field"));
    }
    let v = u64::from_le_bytes(input[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    Ok(v)
}

/// An ordered stream of tuples, ascending and duplicate-free on the
/// stripped key. Every component iterator and the k-way merge speak this.
pub trait TupleSource {
    fn next_tuple(&mut self) -> Result<Option<Tuple>>;
}

/// Resolves two versions of the same stripped key during a merge. `large`
/// comes from the older component, `small` from the newer one.
pub trait TupleMerger: Send + Sync {
    fn merge(&self, large: &Tuple, small: &Tuple) -> Tuple;
}

/// Default policy: the newer side wins outright.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl TupleMerger for LastWriterWins {
    fn merge(&self, _large: &Tuple, small: &Tuple) -> Tuple {
        small.clone()
    }
}

/// Test stand-in for a component iterator: yields a fixed ascending run.
#[cfg(test)]
pub(crate) struct VecSource {
    tuples: std::collections::VecDeque<Tuple>,
}

#[cfg(test)]
impl VecSource {
    pub fn new(tuples: Vec<Tuple>) -> Self {
        Self {
            tuples: tuples.into(),
        }
    }
}

#[cfg(test)]
impl TupleSource for VecSource {
    fn next_tuple(&mut self) -> Result<Option<Tuple>> {
        Ok(self.tuples.pop_front())
    }
}
