//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the offload core:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities the other modules depend on. It
//! establishes the logging conventions, the configuration builder that wires
//! host bridges into the core, and the event broadcasting used to report
//! device, queue and transfer activity to hosts.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
