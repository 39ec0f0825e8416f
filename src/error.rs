//! Startup errors that stop a batch before any work is dispatched.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    /// File list path does not exist.
    #[error("file list not found: {}", .0.display())]
    FileListMissing(PathBuf),

    /// File list exists but could not be read.
    #[error("failed to read file list {}: {source}", path.display())]
    FileListUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File list contains no paths.
    #[error("file list {} contains no input paths", .0.display())]
    EmptyFileList(PathBuf),

    /// None of the listed paths exist.
    #[error("no valid input files found in {}", .0.display())]
    NoValidFiles(PathBuf),

    /// Worker count must be at least 1.
    #[error("worker count must be greater than 0 (got {0})")]
    InvalidWorkerCount(usize),
}
