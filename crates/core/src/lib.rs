//! Shared foundations for the sovereign identity broker.
//!
//! This crate provides the configuration model, error type, logging setup and
//! clock helper used by the protocol crate.

pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub use config::{
    BrokerConfig, DatastoreBackend, DatastoreConfig, IssuanceConfig, LogFormat, LoggingConfig,
    NonceConfig, PolicyConfig, ServerConfig, VerifierConfig,
};
pub use error::{CoreError, CoreResult};
pub use time::now_ms;
