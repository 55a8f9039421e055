//! Internal error type.
//!
//! Every fallible kernel API returns a `Result<T, Error>` (spec.md §9:
//! "sum-type `Result`-equivalents internally"). The syscall dispatch layer
//! (`crate::syscall`) is the only place that collapses these into the
//! C-style `-1` contract user code observes.

use thiserror::Error;

pub type KResult<T> = Result<T, Error>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("no free process slots")]
    NoFreeProcs,
    #[error("no such process")]
    NoSuchProc,
    #[error("process has no children")]
    NoChildren,
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("address out of range")]
    BadAddress,
    #[error("no buffers free in the buffer cache")]
    NoFreeBuffers,
    #[error("no free inodes on device")]
    NoFreeInodes,
    #[error("no free data blocks on device")]
    NoFreeBlocks,
    #[error("no such file or directory")]
    NotFound,
    #[error("file already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("bad file descriptor")]
    BadFd,
    #[error("no free file-table slots")]
    NoFreeFiles,
    #[error("no free file descriptor slots in the process")]
    NoFreeFds,
    #[error("file past maximum size")]
    FileTooLarge,
    #[error("read end of pipe is closed")]
    PipeClosed,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("process was killed")]
    Killed,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("exec image is malformed")]
    BadElf,
}
