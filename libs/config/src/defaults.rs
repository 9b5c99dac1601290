//! Default configuration values
//!
//! Every key of [`crate::BusConfig`] falls back to one of these constants.

/// Sender-side correlation defaults
pub mod correlation {
    /// Ceiling for `answer` (milliseconds)
    pub const ANSWER_TIMEOUT_MS: u64 = 15_000;

    /// Ceiling for `poll` (milliseconds)
    pub const POLL_TIMEOUT_MS: u64 = 1_000;

    /// Wait-loop tick (milliseconds)
    pub const POLL_INTERVAL_MS: u64 = 1;

    /// Bound on a poll-queue put (milliseconds)
    pub const POLL_PUT_TIMEOUT_MS: u64 = 100;

    /// Result-table lock wait (milliseconds)
    pub const LOCK_TIMEOUT_MS: u64 = 2_000;

    /// Shared state lock wait (milliseconds)
    pub const SHARED_STATE_LOCK_TIMEOUT_MS: u64 = 10_000;

    /// Outgoing answers between batch sweeps
    pub const SWEEP_EVERY: u64 = 1_000;

    /// Maximum entries reclaimed per sweep
    pub const SWEEP_BATCH: usize = 100;
}

/// Queue and payload defaults
pub mod queues {
    /// Stream queue capacity (envelopes)
    pub const STREAM_CAPACITY: usize = 1_000;

    /// Result size above which chunking is used (bytes)
    pub const CHUNK_THRESHOLD: usize = 1024 * 1024;

    /// Largest frame accepted on a worker socket (bytes)
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
}

/// Worker loop defaults
pub mod workers {
    /// Blocking receive timeout in worker loops (milliseconds)
    pub const RECV_TIMEOUT_MS: u64 = 100;

    /// Consecutive loop failures before backing off
    pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

    /// Backoff after repeated failures (milliseconds)
    pub const ERROR_BACKOFF_MS: u64 = 1_000;
}

/// Supervisor escalation timings
pub mod supervision {
    pub const THREAD_JOIN_TIMEOUT_MS: u64 = 3_000;
    pub const PROCESS_JOIN_TIMEOUT_MS: u64 = 3_000;
    pub const TERMINATE_JOIN_TIMEOUT_MS: u64 = 2_000;
    pub const KILL_JOIN_TIMEOUT_MS: u64 = 1_000;

    /// Grace period between broadcasting stop and forcing cleanup
    pub const COOPERATIVE_EXIT_WAIT_MS: u64 = 1_000;

    /// How long a spawned worker process has to connect back
    pub const CHILD_CONNECT_TIMEOUT_MS: u64 = 10_000;
}

/// Environment variable prefix for overrides (`BUS_ANSWER_TIMEOUT_MS`, ...)
pub const ENV_PREFIX: &str = "BUS";

pub const LOG_LEVEL: &str = "info";
