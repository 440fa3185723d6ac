//! Scrape-job handler: resolves a scraper by jurisdiction, runs the
//! requested operation, and writes results through the case store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use kite_core::error::{JobError, JobResult};
use kite_core::jobs::{Job, JobHandler};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::scraper::{CaseQuery, ScraperRegistry};
use crate::store::CaseStore;

/// Cap on a date-range pull when the payload does not set `max_cases`.
const DEFAULT_MAX_CASES: usize = 100;

/// Payload schema for `kind = scrape` jobs.
#[derive(Debug, Clone, Deserialize)]
pub struct ScrapePayload {
    pub jurisdiction: String,
    #[serde(default)]
    pub court: Option<String>,
    /// When set, a single-case lookup instead of a search.
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub max_cases: Option<usize>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// Handler for scrape jobs.
///
/// The scraper registry and the store are shared process-wide; the handler
/// itself is stateless and safe to run from any worker.
pub struct ScrapeHandler {
    scrapers: Arc<ScraperRegistry>,
    store: Arc<dyn CaseStore>,
}

impl ScrapeHandler {
    pub fn new(scrapers: Arc<ScraperRegistry>, store: Arc<dyn CaseStore>) -> Self {
        Self { scrapers, store }
    }
}

#[async_trait]
impl JobHandler for ScrapeHandler {
    async fn handle(&self, job: &Job) -> JobResult<Map<String, Value>> {
        let payload: ScrapePayload =
            serde_json::from_value(Value::Object(job.payload.clone()))
                .map_err(|e| JobError::Validation(format!("scrape payload: {e}")))?;

        let scraper = self
            .scrapers
            .get(&payload.jurisdiction)
            .ok_or_else(|| {
                JobError::Validation(format!("unknown jurisdiction: {}", payload.jurisdiction))
            })?;

        let cases = if let Some(case_id) = &payload.case_id {
            vec![scraper.get_case_by_id(case_id).await?]
        } else if let (Some(start), Some(end)) = (payload.start_date, payload.end_date) {
            scraper
                .get_cases_by_date_range(
                    start,
                    end,
                    payload.max_cases.unwrap_or(DEFAULT_MAX_CASES),
                )
                .await?
        } else {
            let query = CaseQuery {
                text: payload
                    .options
                    .get("query")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                court: payload.court.clone(),
                start_date: payload.start_date,
                end_date: payload.end_date,
                limit: payload.max_cases,
            };
            scraper.search_cases(&query).await?
        };

        let stored = self.store.save_cases(&cases).await?;
        info!(
            job_id = %job.id,
            jurisdiction = %payload.jurisdiction,
            found = cases.len(),
            stored,
            "scrape job finished"
        );

        let mut result = Map::new();
        result.insert("jurisdiction".into(), payload.jurisdiction.into());
        result.insert("cases_found".into(), cases.len().into());
        result.insert("cases_stored".into(), stored.into());
        Ok(result)
    }
}
