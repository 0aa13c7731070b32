//! Library defaults for `RuntimeConfig`

/// OS stack size backing one cooperative thread
pub const THREAD_STACK_SIZE: usize = 256 * 1024;

/// Name of the group every runtime creates at startup
pub const DEFAULT_GROUP_NAME: &str = "coop";

/// Upper bound on a single idle poll of a group driver
pub const MAX_POLL_WAIT_MS: u64 = 1000;

/// Poll slice used by migrated-out threads waiting on descriptors
pub const NATIVE_POLL_SLICE_MS: u64 = 10;
