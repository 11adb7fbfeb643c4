// Input bounds for operator-supplied data.

pub const MAX_ACCOUNTS_PER_JOB: usize = 16;
pub const MAX_CONSECUTIVE_HOURS: u32 = 12;
pub const MAX_NAME_LEN: usize = 128;
pub const MAX_CREDENTIALS_REF_LEN: usize = 512;
/// Armed jobs held in one scheduler's in-memory due queue.
pub const MAX_DUE_QUEUE: usize = 4096;
pub const MAX_SLOTS_PER_DAY: usize = 288;
