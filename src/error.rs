//! Problems the engine recovers from. None of these are ever returned to the host: each is
//! logged and the read in question falls back to the closest safe behaviour.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Fault {
    #[error("unexpected read request at {offset:#010x} with length {length:#x}")]
    ClassificationFailure { offset: u64, length: usize },

    #[error("entry index {index} is out of range for an archive of {count} entries")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("offset {local:#x} is past the end of the {size:#x}-byte replacement {path:?}")]
    OffsetOutOfBounds {
        local: u64,
        size: u64,
        path: PathBuf,
    },

    #[error("read {actual:#x} bytes from {path:?} but {expected:#x} were requested")]
    ShortRead {
        expected: usize,
        actual: usize,
        path: PathBuf,
    },

    #[error("synthetic offset space is exhausted ({size:#x} > {ceiling:#x})")]
    CapacityExceeded { size: u64, ceiling: u64 },

    #[error("no entry owns the read at {offset:#010x} with length {length:#x}")]
    UnattributedRead { offset: u64, length: usize },

    #[error("replacement {path:?} could not be read: {reason}")]
    ReplacementUnavailable { path: PathBuf, reason: String },

    #[error("header declares a data region starting at {data_start:#x}, past the end of the {size:#x}-byte archive")]
    HeaderRejected { data_start: u64, size: u64 },
}
