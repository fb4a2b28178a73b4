use crate::error::{Error, Result};

/// Durability of the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// No per-write logging. Unmerged writes survive only a clean shutdown.
    None,
    /// fsync on every append.
    Sync,
    /// fsync every `batch_size` appends.
    Batch,
}

#[derive(Debug, Clone)]
pub struct BlsmOptions {
    /// Byte budget of the in-memory component; one mem-merge run moves
    /// roughly this much.
    pub max_c0_size: u64,
    /// Sizing hint for a component's internal index region, in pages.
    pub internal_region_size: u64,
    /// Sizing hint for a component's data page region, in pages.
    pub datapage_region_size: u64,
    /// Data page size in pages; a region-layout hint.
    pub datapage_size: u64,
    /// On-disk data block size in bytes; a component flushes a block once
    /// it holds this much.
    pub block_size: u64,
    pub log_mode: LogMode,
    /// Appends between fsyncs under [`LogMode::Batch`].
    pub batch_size: usize,
    /// Tuples whose timestamp falls behind the current tick by more than
    /// this are dropped during merges. `None` disables expiry.
    pub expiry: Option<u64>,
    /// Merge write throughput in bytes per second. `None` disables pacing.
    pub rate_limit: Option<f64>,
}

impl Default for BlsmOptions {
    fn default() -> Self {
        Self {
            max_c0_size: 100 * 1024 * 1024,
            internal_region_size: 16384,
            datapage_region_size: 256_000,
            datapage_size: 1,
            block_size: 32 * 1024,
            log_mode: LogMode::None,
            batch_size: 100,
            expiry: None,
            rate_limit: Some((100 * 1024 * 1024) as f64),
        }
    }
}

impl BlsmOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_c0_size == 0 {
            return Err(Error::InvalidArgument("max_c0_size must be > 0".into()));
        }
        if self.datapage_size == 0 {
            return Err(Error::InvalidArgument("datapage_size must be > 0".into()));
        }
        if self.block_size == 0 {
            return Err(Error::InvalidArgument("block_size must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be > 0".into()));
        }
        if let Some(rate) = self.rate_limit {
            if rate <= 0.0 {
                return Err(Error::InvalidArgument(format!(
                    "rate_limit must be > 0, got {rate}"
                )));
            }
        }
        Ok(())
    }
}
