//! Engine configuration and partition registry.

use std::time::Duration;

use serde::Deserialize;

use crate::types::{Partition, RetryCount};

/// Retention policy of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PartitionSpec {
    /// Partition name.
    pub partition: Partition,
    /// Maximum record age before a sweep removes it. `None` marks a
    /// partition holding user-authored content, which is never swept.
    #[serde(default)]
    pub max_age_ms: Option<u64>,
}

impl PartitionSpec {
    /// Read-through partition, swept once records exceed `max_age`.
    pub fn read_through(partition: Partition, max_age: Duration) -> Self {
        Self {
            partition,
            max_age_ms: Some(max_age.as_millis() as u64),
        }
    }

    /// Partition that is never swept.
    pub fn durable(partition: Partition) -> Self {
        Self {
            partition,
            max_age_ms: None,
        }
    }

    /// Maximum age as a [`Duration`].
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_ms.map(Duration::from_millis)
    }
}

/// Tunables for the repository, queue, coordinator and scheduler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Registered partitions. Operations on others are rejected.
    pub partitions: Vec<PartitionSpec>,
    /// Failed attempts after which an operation stalls.
    pub max_retries: RetryCount,
    /// Maximum number of queued operations.
    pub queue_capacity: usize,
    /// Period of the background sync ticker.
    pub sync_interval_ms: u64,
    /// Period of the background sweep ticker.
    pub sweep_interval_ms: u64,
    /// Per-call transport timeout.
    pub transport_timeout_ms: u64,
    /// First backoff step after a failure; 0 retries on every pass.
    pub backoff_base_ms: u64,
    /// Upper bound for the backoff delay.
    pub backoff_max_ms: u64,
    /// Payload field carrying the server-issued key.
    pub id_field: String,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Capacity of the scheduler command channel.
    pub command_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partitions: Vec::new(),
            max_retries: 5,
            queue_capacity: 10_000,
            sync_interval_ms: 15 * 60 * 1000,
            sweep_interval_ms: 60 * 60 * 1000,
            transport_timeout_ms: 30_000,
            backoff_base_ms: 0,
            backoff_max_ms: 5 * 60 * 1000,
            id_field: "id".to_string(),
            event_capacity: 256,
            command_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Adds a partition to the registry.
    pub fn with_partition(mut self, spec: PartitionSpec) -> Self {
        self.partitions.retain(|p| p.partition != spec.partition);
        self.partitions.push(spec);
        self
    }

    /// Looks up a registered partition.
    pub fn partition(&self, partition: &Partition) -> Option<&PartitionSpec> {
        self.partitions.iter().find(|p| p.partition == *partition)
    }

    /// Backoff delay before attempt number `retry_count + 1`.
    pub fn backoff_for(&self, retry_count: RetryCount) -> Duration {
        if self.backoff_base_ms == 0 || retry_count == 0 {
            return Duration::ZERO;
        }
        let shift = retry_count.saturating_sub(1).min(20);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    /// Sync ticker period.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Sweep ticker period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Transport timeout.
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }
}
