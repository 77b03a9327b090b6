//! # kvm2 Common
//!
//! Shared utilities for the kvm2 driver tools.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use kvm2_common::init_logging;
//!
//! init_logging("info").unwrap();
//! ```

pub mod logging;

pub use logging::{init, init_logging, init_logging_json, LogFormat};
