//! # ldap-proxy-core
//!
//! Core types and utilities shared by the LDAP proxy crates.
//!
//! This crate provides the error taxonomy, the protocol-neutral request/response model and the
//! configuration file format used to build the proxy.
//!
//! ## Modules
//!
//! - [`error`] - Error types and their classification
//! - [`types`] - Search parameters, result codes, directory entries and bind credentials
//! - [`config`] - YAML configuration model with validation

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
