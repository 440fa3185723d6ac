//! Case store interface.
//!
//! The persistent store is an external collaborator; the core only talks
//! to this trait. Writes must be idempotent keyed on (jurisdiction, id)
//! because delivery is at-least-once.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use kite_core::error::JobResult;

use crate::scraper::LegalCase;

#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn save_case(&self, case: &LegalCase) -> JobResult<()>;

    /// Save a batch; returns how many records were newly stored.
    async fn save_cases(&self, cases: &[LegalCase]) -> JobResult<usize>;

    async fn get_case(&self, jurisdiction: &str, id: &str) -> JobResult<Option<LegalCase>>;
}

/// In-memory store for tests and local runs.
#[derive(Default)]
pub struct MemoryCaseStore {
    cases: RwLock<HashMap<(String, String), LegalCase>>,
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cases.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CaseStore for MemoryCaseStore {
    async fn save_case(&self, case: &LegalCase) -> JobResult<()> {
        let mut cases = self.cases.write().unwrap_or_else(|e| e.into_inner());
        cases.insert(
            (case.jurisdiction.to_lowercase(), case.id.clone()),
            case.clone(),
        );
        Ok(())
    }

    async fn save_cases(&self, batch: &[LegalCase]) -> JobResult<usize> {
        let mut cases = self.cases.write().unwrap_or_else(|e| e.into_inner());
        let mut stored = 0;
        for case in batch {
            let key = (case.jurisdiction.to_lowercase(), case.id.clone());
            if cases.insert(key, case.clone()).is_none() {
                stored += 1;
            }
        }
        Ok(stored)
    }

    async fn get_case(&self, jurisdiction: &str, id: &str) -> JobResult<Option<LegalCase>> {
        let cases = self.cases.read().unwrap_or_else(|e| e.into_inner());
        Ok(cases
            .get(&(jurisdiction.to_lowercase(), id.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_case;

    #[tokio::test]
    async fn saves_are_idempotent() {
        let store = MemoryCaseStore::new();
        let case = sample_case("sg", "case-1");

        assert_eq!(store.save_cases(&[case.clone()]).await.unwrap(), 1);
        assert_eq!(store.save_cases(&[case.clone()]).await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn lookup_by_jurisdiction_and_id() {
        let store = MemoryCaseStore::new();
        store.save_case(&sample_case("uk", "ewca-1")).await.unwrap();

        assert!(store.get_case("uk", "ewca-1").await.unwrap().is_some());
        assert!(store.get_case("sg", "ewca-1").await.unwrap().is_none());
    }
}
