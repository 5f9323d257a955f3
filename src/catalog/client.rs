//! Paginated catalog discovery over REST

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{CatalogRegistry, Instrument, Market};
use crate::error::{FeedError, Result};
use crate::rate_limiter::AdaptiveRateLimiter;

/// Cursor value the venue returns after the last page
pub const END_CURSOR: &str = "LTE=";

/// Attempts per page before giving up on a rate-limited request
const MAX_PAGE_ATTEMPTS: u32 = 5;

/// One page of the sampling-markets listing
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogPage {
    #[serde(default)]
    data: Vec<RawMarket>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawMarket {
    #[serde(default)]
    condition_id: Option<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    market_slug: Option<String>,
    #[serde(default)]
    end_date_iso: Option<String>,
    #[serde(default)]
    tokens: Vec<RawToken>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawToken {
    #[serde(default)]
    token_id: Option<String>,
    #[serde(default)]
    outcome: Option<String>,
}

impl CatalogPage {
    /// Cursor for the following page, `None` once the listing is exhausted
    pub fn next_cursor(&self) -> Option<&str> {
        match self.next_cursor.as_deref() {
            None | Some("") | Some(END_CURSOR) => None,
            Some(cursor) => Some(cursor),
        }
    }

    /// Markets with at least one usable token; entries without ids are dropped
    pub fn markets(&self) -> Vec<(Market, Vec<Instrument>)> {
        self.data
            .iter()
            .filter_map(|raw| {
                let id = raw.condition_id.clone().filter(|id| !id.is_empty())?;
                let title = raw
                    .question
                    .clone()
                    .or_else(|| raw.market_slug.clone())
                    .unwrap_or_else(|| id.clone());
                let expiry = raw.end_date_iso.as_deref().and_then(parse_expiry);

                let instruments: Vec<Instrument> = raw
                    .tokens
                    .iter()
                    .filter_map(|token| {
                        let token_id = token.token_id.clone().filter(|t| !t.is_empty())?;
                        Some(Instrument {
                            name: token.outcome.clone().unwrap_or_else(|| token_id.clone()),
                            id: token_id,
                            market_id: id.clone(),
                        })
                    })
                    .collect();

                if instruments.is_empty() {
                    return None;
                }
                Some((Market { id, title, expiry }, instruments))
            })
            .collect()
    }
}

fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            debug!(value = %raw, error = %e, "Unparseable market expiry");
            None
        }
    }
}

/// REST client for catalog discovery
pub struct CatalogClient {
    http: reqwest::Client,
    rest_endpoint: String,
    limiter: Arc<AdaptiveRateLimiter>,
}

impl CatalogClient {
    pub fn new(rest_endpoint: &str, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        Self {
            http: reqwest::Client::new(),
            rest_endpoint: rest_endpoint.trim_end_matches('/').to_string(),
            limiter,
        }
    }

    /// Walk every page and load the results into `registry`.
    ///
    /// Returns the discovered markets so callers can persist them.
    pub async fn discover(
        &self,
        registry: &CatalogRegistry,
    ) -> Result<Vec<(Market, Vec<Instrument>)>> {
        let mut discovered = Vec::new();
        let mut cursor = String::new();
        let mut seen_cursors = HashSet::new();

        loop {
            let page = self.fetch_page(&cursor).await?;
            let markets = page.markets();
            debug!(cursor = %cursor, markets = markets.len(), "Catalog page received");

            for (market, instruments) in markets {
                registry.upsert_market(market.clone(), instruments.clone());
                discovered.push((market, instruments));
            }

            match page.next_cursor() {
                Some(next) if seen_cursors.insert(next.to_string()) => cursor = next.to_string(),
                Some(next) => {
                    warn!(cursor = %next, "Catalog cursor repeated, stopping pagination");
                    break;
                }
                None => break,
            }
        }

        info!(
            markets = discovered.len(),
            instruments = registry.instrument_count(),
            "Catalog discovery complete"
        );
        Ok(discovered)
    }

    /// Fetch one page, backing off through the rate limiter on HTTP 429
    pub async fn fetch_page(&self, cursor: &str) -> Result<CatalogPage> {
        let url = format!("{}/sampling-markets", self.rest_endpoint);

        for attempt in 1..=MAX_PAGE_ATTEMPTS {
            self.limiter.acquire().await;

            let response = self
                .http
                .get(&url)
                .query(&[("next_cursor", cursor)])
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                self.limiter.record_rate_limited().await;
                warn!(attempt, url = %url, "Catalog request rate limited");
                continue;
            }
            if !status.is_success() {
                return Err(FeedError::RestApiError(format!(
                    "GET {} returned {}",
                    url, status
                )));
            }

            let page = response.json::<CatalogPage>().await?;
            self.limiter.record_success().await;
            return Ok(page);
        }

        Err(FeedError::RateLimited(format!(
            "GET {} still rate limited after {} attempts",
            url, MAX_PAGE_ATTEMPTS
        )))
    }
}
