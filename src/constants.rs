/// Exit code a compare script (or interactive validator) uses to accept a run.
pub const CORRECT_EXITCODE: i32 = 42;
/// Exit code a compare script (or interactive validator) uses to reject a run.
pub const WRONG_ANSWER_EXITCODE: i32 = 43;

/// Exit code reported by the process runner when nothing could be spawned.
pub const NOT_SPAWNED_EXITCODE: i32 = -1;

pub const EXECDIR: &str = "execdir";
pub const PROGRAM: &str = "program";
pub const FEEDBACK_DIR: &str = "feedback";

pub const PROGRAM_OUT: &str = "program.out";
pub const PROGRAM_ERR: &str = "program.err";
pub const PROGRAM_META: &str = "program.meta";
pub const COMPARE_OUT: &str = "compare.out";
pub const COMPARE_ERR: &str = "compare.err";
pub const COMPARE_META: &str = "compare.meta";

pub const PIPE_BUFFER_SIZE: usize = 8192;

pub const EVENT_TX_ERR: &str = "Failed to send judging event to event_tx";

/// Problem defaults in kB (seconds for the script time limit).
pub const DEFAULT_MEMORY_LIMIT: u64 = 2097152;
pub const DEFAULT_OUTPUT_LIMIT: u64 = 8192;
pub const DEFAULT_PROCESS_LIMIT: u64 = 64;
pub const DEFAULT_SCRIPT_TIMELIMIT: u64 = 30;
pub const DEFAULT_SCRIPT_MEMORY_LIMIT: u64 = 2097152;
pub const DEFAULT_SCRIPT_FILESIZE_LIMIT: u64 = 2621440;

pub const EVENT_CHANNEL_SIZE: usize = 64;
