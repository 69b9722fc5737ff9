pub mod format;
pub mod progress;
pub mod ssh;
