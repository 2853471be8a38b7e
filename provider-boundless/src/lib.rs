//! # Boundless Provider
//!
//! Implements `CatalogFeed` for the Boundless (formerly Axis 360) title
//! license API.
//!
//! ## Overview
//!
//! This module provides:
//! - Page-numbered listing of the licensed catalog, filtered by modification time
//! - An explicit `active` flag per title, so delisted titles are reported
//! - Availability lookups for up to 125 titles per call

pub mod connector;
pub mod error;
pub mod types;

pub use connector::{BoundlessFeed, BOUNDLESS_ID_TYPE};
pub use error::{BoundlessError, Result};
