//! # OverDrive Provider
//!
//! Implements `CatalogFeed` for the OverDrive collection APIs.
//!
//! ## Overview
//!
//! This module provides:
//! - Link-paginated product listing, newest additions first
//! - `dateAdded` per product, which lets incremental imports stop early
//! - Bulk availability lookups for up to 25 products per call
//! - Per-product metadata lookups

pub mod connector;
pub mod error;
pub mod types;

pub use connector::{make_link_safe, OverdriveFeed, OVERDRIVE_ID_TYPE};
pub use error::{OverdriveError, Result};
