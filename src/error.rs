// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Error kinds produced by the index core.
///
/// The index never enters a half-open state: either an operation fully
/// applies or the data structure backing it is left unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// A delta zone could not satisfy an insert even after rebalancing.
    /// Only surfaced from the raw `extend_delta_zone` entry point; callers
    /// one layer up (the volume index) recover from this locally via early
    /// flush.
    #[error("delta zone overflow")]
    Overflow,
    /// Boundary discovery or an on-disk header failed to validate.
    #[error("corrupt data: {0}")]
    CorruptData(String),
    /// A probe or read went past the bounds of the addressed region.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// An argument violated a documented precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An admin operation was attempted in an incompatible session state.
    #[error("busy")]
    Busy,
    /// `open(LOAD)` of an index that was never created.
    #[error("not found")]
    NotFound,
    /// `open(NO_REBUILD)` of a dirty index.
    #[error("already exists")]
    Exists,
    /// Allocation failure.
    #[error("out of memory")]
    Nomem,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] bincode::Error),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use Error::*;
        match (self, other) {
            (Overflow, Overflow) => true,
            (CorruptData(a), CorruptData(b)) => a == b,
            (OutOfRange(a), OutOfRange(b)) => a == b,
            (InvalidArgument(a), InvalidArgument(b)) => a == b,
            (Busy, Busy) => true,
            (NotFound, NotFound) => true,
            (Exists, Exists) => true,
            (Nomem, Nomem) => true,
            (Io(_), Io(_)) => true,
            (Serialization(_), Serialization(_)) => true,
            _ => false,
        }
    }
}

impl From<Error> for String {
    fn from(e: Error) -> Self {
        e.to_string()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
