pub mod fs_atomic;
pub mod ids;
pub mod run_log;
pub mod time;
