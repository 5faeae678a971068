//! Machine-readable `error_code` values shared by the guard, the executor
//! and the built-in tools.

// Guard
pub const INVALID_ARGUMENTS: &str = "INVALID_ARGUMENTS";
pub const PATH_OUTSIDE_WORKSPACE: &str = "PATH_OUTSIDE_WORKSPACE";
pub const DENIED_BY_POLICY: &str = "DENIED_BY_POLICY";
pub const USER_REJECTED: &str = "USER_REJECTED";
pub const UNKNOWN_TOOL: &str = "UNKNOWN_TOOL";

// Executor
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
pub const TIMEOUT: &str = "TIMEOUT";
pub const CANCELLED: &str = "CANCELLED";
pub const EXEC_ERROR: &str = "EXEC_ERROR";

// Filesystem
pub const NOT_FOUND: &str = "NOT_FOUND";
pub const NOT_A_FILE: &str = "NOT_A_FILE";
pub const NOT_A_DIR: &str = "NOT_A_DIR";
pub const BINARY_FILE: &str = "BINARY_FILE";
pub const READ_ERROR: &str = "READ_ERROR";
pub const WRITE_ERROR: &str = "WRITE_ERROR";
pub const RECURSIVE_REQUIRED: &str = "RECURSIVE_REQUIRED";
pub const DELETE_ERROR: &str = "DELETE_ERROR";
pub const DST_EXISTS: &str = "DST_EXISTS";
pub const MOVE_ERROR: &str = "MOVE_ERROR";
pub const NO_MATCH: &str = "NO_MATCH";
pub const AMBIGUOUS_MATCH: &str = "AMBIGUOUS_MATCH";
pub const HASH_MISMATCH: &str = "HASH_MISMATCH";
pub const INVALID_HUNK: &str = "INVALID_HUNK";
pub const MISSING_INPUT: &str = "MISSING_INPUT";

// Search
pub const INVALID_PATTERN: &str = "INVALID_PATTERN";

// Git
pub const NOT_A_REPO: &str = "NOT_A_REPO";
pub const GIT_ERROR: &str = "GIT_ERROR";
pub const CONFIRMATION_REQUIRED: &str = "CONFIRMATION_REQUIRED";
pub const NOTHING_TO_COMMIT: &str = "NOTHING_TO_COMMIT";
pub const COMMIT_FAILED: &str = "COMMIT_FAILED";

// Process
pub const COMMAND_REQUIRED: &str = "COMMAND_REQUIRED";
