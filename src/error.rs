use thiserror::Error;

use crate::config::{DeviceGeometry, Lpa};

pub type Result<T> = std::result::Result<T, FtlError>;

#[derive(Debug, Error)]
pub enum FtlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid device geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Capacity exhaustion on one parallel unit.
    #[error("no free block left on channel {channel} chip {chip}")]
    NoFreeBlock { channel: usize, chip: usize },

    /// Capacity exhaustion after a full retry around all parallel units.
    #[error("no free page left on any parallel unit")]
    OutOfSpace,

    #[error("logical address {lpa} is beyond the logical space ({limit})")]
    LpaOutOfRange { lpa: Lpa, limit: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("driver is shutting down")]
    Closed,

    #[error("snapshot: {0}")]
    Snapshot(String),

    #[error("snapshot was taken on {stored:?}, device is {current:?}")]
    GeometryMismatch {
        stored: Box<DeviceGeometry>,
        current: Box<DeviceGeometry>,
    },
}
