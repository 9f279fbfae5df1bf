//! Timing and capacity knobs for each protocol.
//!
//! Defaults follow the classic Raft paper ranges (150-300ms election timeout)
//! and a two second data collection window.

use std::ops::Range;
use std::time::Duration;

/// Per-node mailbox settings.
#[derive(Debug, Clone, Copy)]
pub struct MailboxConfig {
    /// Messages buffered per node before senders block.
    pub capacity: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

#[derive(Debug, Clone)]
pub struct RingConfig {
    pub mailbox: MailboxConfig,
    /// How long a leader waits for `CollectReply` messages.
    pub collect_timeout: Duration,
    /// Local data reported on `Collect`. `None` draws a random user count in 50..100.
    pub initial_data: Option<u64>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            mailbox: MailboxConfig::default(),
            collect_timeout: Duration::from_secs(2),
            initial_data: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BullyConfig {
    pub mailbox: MailboxConfig,
    /// Wait for an `Answer` from a higher node before declaring victory.
    pub answer_timeout: Duration,
    /// Wait for a `Coordinator` after being answered before restarting the election.
    pub coordinator_timeout: Duration,
    /// How often a leader re-announces itself.
    pub heartbeat_interval: Duration,
    /// Re-elect when the leader has been silent this long. Also starts the
    /// first election on a fresh cluster. `None` gives one-shot elections
    /// that only run when the driver asks.
    pub leader_timeout: Option<Duration>,
}

impl Default for BullyConfig {
    fn default() -> Self {
        Self {
            mailbox: MailboxConfig::default(),
            answer_timeout: Duration::from_millis(200),
            coordinator_timeout: Duration::from_millis(400),
            heartbeat_interval: Duration::from_millis(100),
            leader_timeout: Some(Duration::from_millis(500)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub mailbox: MailboxConfig,
    /// Election timeouts are drawn uniformly from this range on every reset.
    pub election_timeout: Range<Duration>,
    pub heartbeat_interval: Duration,
    /// Upper bound on entries shipped in one `AppendEntries`.
    pub max_entries_per_append: usize,
    /// Seed for timer jitter. Each node mixes in its own id.
    pub seed: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            mailbox: MailboxConfig::default(),
            election_timeout: Duration::from_millis(150)..Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_append: 64,
            seed: None,
        }
    }
}
