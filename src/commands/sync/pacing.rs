use std::time::Duration;

use crate::config::SyncConfig;

/// Fixed-delay rate limiting between external calls.
///
/// Only the last record of a batch and the last batch of a run go without a
/// pause; the delays never affect what gets written.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    inter_record: Duration,
    inter_batch: Duration,
}

impl Pacing {
    pub fn new(inter_record: Duration, inter_batch: Duration) -> Self {
        Self {
            inter_record,
            inter_batch,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.inter_record_delay, config.inter_batch_delay)
    }

    pub fn after_record(&self, position: usize, batch_len: usize) -> Option<Duration> {
        non_zero(self.inter_record).filter(|_| position + 1 < batch_len)
    }

    pub fn after_batch(&self, batch_index: usize, total_batches: usize) -> Option<Duration> {
        non_zero(self.inter_batch).filter(|_| batch_index + 1 < total_batches)
    }
}

fn non_zero(delay: Duration) -> Option<Duration> {
    (!delay.is_zero()).then_some(delay)
}
