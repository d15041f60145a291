//! Error conditions callers may want to branch on.
//!
//! Most fallible operations return [`anyhow::Result`]; the variants here are
//! wrapped inside the `anyhow::Error` and can be recovered with
//! `err.downcast_ref::<EmaError>()`. The C ABI maps them to status codes.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmaError {
    #[error("EMA is not initialized")]
    NotInitialized,

    #[error("EMA is already initialized")]
    AlreadyInitialized,

    #[error("thread limit of {limit} region stores reached")]
    ThreadLimit { limit: usize },

    #[error("region '{idf}' was ended without being started")]
    RegionNotStarted { idf: String },

    #[error("region '{idf}' belongs to a finalized session")]
    StaleRegion { idf: String },

    #[error("no access to {plugin} devices")]
    NoDeviceAccess { plugin: String },

    #[error("failed to read energy of device '{device}': {reason}")]
    SensorRead { device: String, reason: String },
}
