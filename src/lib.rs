//! Client for the ClamAV daemon (clamd).
//!
//! Checks daemon liveness with PING and streams data for scanning with
//! INSTREAM.

pub mod clamd;
pub mod config;
pub mod helper;
pub mod protocol;

pub use clamd::{ClamdClient, ClamdError, Endpoint};
pub use config::{ClamdConfig, Config, Messages, Settings};
pub use helper::{HelperError, ScanHelper};
pub use protocol::ScanVerdict;
