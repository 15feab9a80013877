//! Flash translation layer for log-structured NAND: block management,
//! page-level mapping with garbage collection, host request decomposition
//! and a per-unit dispatcher.

#[macro_use]
extern crate log;

pub mod abm;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod ftl;
mod gc;
pub mod hlm;
pub mod host;
pub mod llm;
pub mod mq;
pub mod pool;
pub mod reqs_pool;
pub mod request;

pub use config::{DeviceGeometry, FtlParams, HlmPolicy, MappingUnit};
pub use driver::{Driver, DriverStats};
pub use error::{FtlError, Result};
pub use reqs_pool::{HostCompletion, HostKind, HostRequest};
