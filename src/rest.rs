//! CLOB REST wrapper for health checks and polling fallback.
//!
//! The stream is the primary data path; these endpoints fill in when a
//! monitor boots without books or the stream is in a reconnect storm.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::config::REST_REQUEST_TIMEOUT_SECS;
use crate::error::Result;
use crate::points::price_to_points;
use crate::ws::messages::WireLevel;

#[derive(Debug, Deserialize)]
pub struct RestBook {
    pub asset_id: String,
    #[serde(default)]
    pub bids: Vec<WireLevel>,
    #[serde(default)]
    pub asks: Vec<WireLevel>,
}

#[derive(Clone)]
pub struct ClobRestClient {
    http: reqwest::Client,
    base_url: String,
}

impl ClobRestClient {
    pub fn new(base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REST_REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { http, base_url })
    }

    /// GET /time: server timestamp, used for the startup health check and
    /// optional clock-skew inspection.
    pub async fn server_time(&self) -> Result<String> {
        let resp = self
            .http
            .get(format!("{}/time", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.text().await?)
    }

    /// GET /book: full book for one token.
    pub async fn book(&self, token_id: &str) -> Result<RestBook> {
        let resp = self
            .http
            .get(format!("{}/book", self.base_url))
            .query(&[("token_id", token_id)])
            .send()
            .await?
            .error_for_status()?;
        let mut book: RestBook = resp.json().await?;
        if book.asset_id.is_empty() {
            book.asset_id = token_id.to_string();
        }
        Ok(book)
    }

    /// POST /books: batch top-of-book for a token list.
    pub async fn books(&self, token_ids: &[String]) -> Result<Vec<RestBook>> {
        let body: Vec<serde_json::Value> = token_ids
            .iter()
            .map(|id| serde_json::json!({ "token_id": id }))
            .collect();
        let resp = self
            .http
            .post(format!("{}/books", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// GET /midpoint: midpoint in points, if the book has one.
    pub async fn midpoint(&self, token_id: &str) -> Result<Option<i64>> {
        #[derive(Deserialize)]
        struct Mid {
            mid: Option<String>,
        }
        let resp = self
            .http
            .get(format!("{}/midpoint", self.base_url))
            .query(&[("token_id", token_id)])
            .send()
            .await?
            .error_for_status()?;
        let mid: Mid = resp.json().await?;
        Ok(match mid.mid {
            Some(raw) => Some(price_to_points(&raw)?),
            None => None,
        })
    }

    /// GET /price: best price in points for one side ("BUY" or "SELL").
    pub async fn price(&self, token_id: &str, side: &str) -> Result<Option<i64>> {
        #[derive(Deserialize)]
        struct Price {
            price: Option<String>,
        }
        let resp = self
            .http
            .get(format!("{}/price", self.base_url))
            .query(&[("token_id", token_id), ("side", side)])
            .send()
            .await?
            .error_for_status()?;
        let price: Price = resp.json().await?;
        Ok(match price.price {
            Some(raw) => Some(price_to_points(&raw)?),
            None => None,
        })
    }

    /// True if GET /time succeeds.
    pub async fn check_health(&self) -> bool {
        match self.server_time().await {
            Ok(_) => true,
            Err(e) => {
                warn!("CLOB health check failed: {e}");
                false
            }
        }
    }
}
