//! Market and instrument catalog
//!
//! The registry is constructed once and shared explicitly; the client fills it
//! from the venue's paginated REST listing.

mod client;
mod registry;

pub use client::{CatalogClient, CatalogPage, END_CURSOR};
pub use registry::CatalogRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A question comprising one or more instruments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub title: String,
    pub expiry: Option<DateTime<Utc>>,
}

/// Static description of a tradable outcome contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: String,
    pub market_id: String,
    pub name: String,
}
