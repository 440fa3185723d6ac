//! Scraper interface and jurisdiction registry.
//!
//! Each legal source implements [`Scraper`] as a black box; extraction
//! details stay inside the implementation. Every network call an
//! implementation makes goes through the shared [`crate::FetchClient`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use kite_core::error::JobResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Search parameters a handler passes to a scraper.
#[derive(Debug, Clone, Default)]
pub struct CaseQuery {
    pub text: Option<String>,
    pub court: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub limit: Option<usize>,
}

/// The minimal case record the store interface accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegalCase {
    pub id: String,
    pub jurisdiction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub court: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_on: Option<NaiveDate>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A per-jurisdiction case-database scraper.
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Jurisdiction code this scraper serves (e.g. "sg", "uk").
    fn jurisdiction(&self) -> &str;

    async fn search_cases(&self, query: &CaseQuery) -> JobResult<Vec<LegalCase>>;

    async fn get_case_by_id(&self, id: &str) -> JobResult<LegalCase>;

    async fn get_cases_by_date_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    ) -> JobResult<Vec<LegalCase>>;

    /// Cheap reachability probe for health reporting.
    async fn is_available(&self) -> bool;
}

/// Jurisdiction code -> scraper lookup, populated at startup.
#[derive(Default)]
pub struct ScraperRegistry {
    scrapers: HashMap<String, Arc<dyn Scraper>>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scraper: Arc<dyn Scraper>) {
        self.scrapers
            .insert(scraper.jurisdiction().to_lowercase(), scraper);
    }

    pub fn get(&self, jurisdiction: &str) -> Option<Arc<dyn Scraper>> {
        self.scrapers.get(&jurisdiction.to_lowercase()).cloned()
    }

    pub fn jurisdictions(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.scrapers.keys().cloned().collect();
        codes.sort();
        codes
    }

    pub fn len(&self) -> usize {
        self.scrapers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scrapers.is_empty()
    }
}
