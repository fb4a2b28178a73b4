use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::tuple::{Tuple, TupleSource};

use super::{read_block, DiskComponent};

/// Streaming iterator over a disk component.
///
/// Positioning is purely key-based: each refill asks the component for the
/// first block (or tail span) past the last emitted key. That keeps the
/// iterator correct against a component that is still being written — it
/// simply stops at the current write frontier.
pub(crate) struct DiskIter {
    component: Arc<DiskComponent>,
    batch: VecDeque<Tuple>,
    start_key: Option<Bytes>,
    last_emitted: Option<Bytes>,
    finished: bool,
}

impl DiskIter {
    pub(super) fn new(component: Arc<DiskComponent>, start_key: Option<Bytes>) -> Self {
        Self {
            component,
            batch: VecDeque::new(),
            start_key,
            last_emitted: None,
            finished: false,
        }
    }

    fn refill(&mut self) -> Result<()> {
        let last = self.last_emitted.clone();
        let start = self.start_key.clone();
        // True when `key` lies past the iterator's current position. The
        // start key is inclusive; everything already emitted is exclusive.
        let past = |key: &[u8]| match (&last, &start) {
            (Some(prev), _) => key > prev.as_ref(),
            (None, Some(s)) => key >= s.as_ref(),
            (None, None) => true,
        };

        let batch: VecDeque<Tuple> = {
            let inner = self.component.inner.read();
            let idx = inner
                .blocks
                .partition_point(|b| !past(b.last_stripped.as_ref()));
            if idx < inner.blocks.len() {
                read_block(&inner, idx)?
                    .into_iter()
                    .filter(|t| past(t.stripped_key()))
                    .collect()
            } else {
                // Past the flushed blocks: whatever sits in the unflushed
                // tail.
                inner
                    .tail
                    .iter()
                    .filter(|t| past(t.stripped_key()))
                    .cloned()
                    .collect()
            }
        };

        if batch.is_empty() {
            self.finished = true;
        }
        self.batch = batch;
        Ok(())
    }
}

impl TupleSource for DiskIter {
    fn next_tuple(&mut self) -> Result<Option<Tuple>> {
        if self.batch.is_empty() {
            if self.finished {
                return Ok(None);
            }
            self.refill()?;
        }
        match self.batch.pop_front() {
            Some(t) => {
                self.last_emitted = Some(t.stripped_key_bytes());
                Ok(Some(t))
            }
            None => Ok(None),
        }
    }
}
