//! Test doubles for scraper and store consumers.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use kite_core::error::{JobError, JobResult};
use serde_json::Map;

use crate::scraper::{CaseQuery, LegalCase, Scraper};

/// A canned case record.
pub fn sample_case(jurisdiction: &str, id: &str) -> LegalCase {
    LegalCase {
        id: id.to_string(),
        jurisdiction: jurisdiction.to_string(),
        court: Some("High Court".to_string()),
        title: format!("In re {id}"),
        decided_on: NaiveDate::from_ymd_opt(2024, 6, 1),
        url: format!("https://cases.example.com/{jurisdiction}/{id}"),
        summary: None,
        metadata: Map::new(),
    }
}

/// Scraper double that serves canned cases and records calls.
pub struct MockScraper {
    jurisdiction: String,
    cases: Vec<LegalCase>,
    fail_with: Option<String>,
    available: bool,
    calls: Mutex<Vec<String>>,
}

impl MockScraper {
    pub fn new(jurisdiction: &str) -> Self {
        Self {
            jurisdiction: jurisdiction.to_string(),
            cases: Vec::new(),
            fail_with: None,
            available: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_cases(mut self, cases: Vec<LegalCase>) -> Self {
        self.cases = cases;
        self
    }

    /// Make every operation fail with a network error.
    pub fn with_failure(mut self, message: &str) -> Self {
        self.fail_with = Some(message.to_string());
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: &str) -> JobResult<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call.to_string());
        match &self.fail_with {
            Some(message) => Err(JobError::Network(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Scraper for MockScraper {
    fn jurisdiction(&self) -> &str {
        &self.jurisdiction
    }

    async fn search_cases(&self, query: &CaseQuery) -> JobResult<Vec<LegalCase>> {
        self.record("search_cases")?;
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(self.cases.iter().take(limit).cloned().collect())
    }

    async fn get_case_by_id(&self, id: &str) -> JobResult<LegalCase> {
        self.record(&format!("get_case_by_id:{id}"))?;
        self.cases
            .iter()
            .find(|case| case.id == id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    async fn get_cases_by_date_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    ) -> JobResult<Vec<LegalCase>> {
        self.record("get_cases_by_date_range")?;
        Ok(self
            .cases
            .iter()
            .filter(|case| {
                case.decided_on
                    .map(|date| date >= start && date <= end)
                    .unwrap_or(false)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn is_available(&self) -> bool {
        self.available
    }
}
