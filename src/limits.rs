//! Hard limits on client-supplied values.

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_CONTACT_LEN: usize = 32;
pub const MAX_DOCTOR_ID_LEN: usize = 64;
pub const MAX_AGE: i32 = 150;
pub const MAX_SCHEDULE_CAPACITY: u32 = 10_000;

/// Bound on how long an operation waits for a schedule or patient-key lock.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Queue depth of the WAL group-commit channel.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;

/// How often the compactor checks the WAL append count.
pub const COMPACT_CHECK_INTERVAL_SECS: u64 = 30;
