//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the catalog sync engine:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! This crate establishes the logging conventions, validated configuration
//! and event broadcasting used by the sync engine and its workers.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
