//! Identity service: the process-wide singleton summarising everything the
//! agent has accumulated. Refreshed by recomputation over the collections
//! at run boundaries.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::{Identity, StoreContext};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityView {
    #[serde(flatten)]
    pub identity: Identity,
    pub age_seconds: i64,
    pub statement: String,
}

pub struct IdentityService {
    store: Arc<StoreContext>,
}

impl IdentityService {
    pub fn new(store: Arc<StoreContext>) -> Self {
        Self { store }
    }

    /// Recompute the singleton from the collections and persist it.
    pub async fn refresh(&self) -> anyhow::Result<Identity> {
        let existing = self.store.identity.list_all().await?.into_iter().next();

        let total_runs = self.store.runs.count().await? as u64;
        let total_observations = self.store.observations.count().await? as u64;
        let total_models = self.store.models.count().await? as u64;
        let total_experiences = self.store.experiences.count().await? as u64;

        let mut domains_seen: Vec<String> = Vec::new();
        for metrics in self.store.metrics.list_all().await? {
            if !metrics.task_type.is_empty() && !domains_seen.contains(&metrics.task_type) {
                domains_seen.push(metrics.task_type.clone());
            }
        }
        domains_seen.sort();

        let mut identity = existing.unwrap_or_default();
        identity.total_runs = total_runs;
        identity.total_observations = total_observations;
        identity.total_models = total_models;
        identity.total_experiences = total_experiences;
        identity.domains_seen = domains_seen;
        identity.last_active_at = Utc::now();

        let identity = self.store.identity.upsert(identity).await?;
        debug!(runs = identity.total_runs, "identity refreshed");
        Ok(identity)
    }

    /// Current identity without forcing a refresh, plus derived fields.
    pub async fn view(&self) -> anyhow::Result<IdentityView> {
        let identity = match self.store.identity.list_all().await?.into_iter().next() {
            Some(identity) => identity,
            None => self.refresh().await?,
        };
        let age_seconds = (Utc::now() - identity.created_at).num_seconds();
        let statement = format!(
            "I have completed {} runs, hold {} mental models and {} experiences, \
and have seen {} task domains.",
            identity.total_runs,
            identity.total_models,
            identity.total_experiences,
            identity.domains_seen.len(),
        );
        Ok(IdentityView {
            identity,
            age_seconds,
            statement,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RunMetrics, RunRecord};

    fn temp_store() -> Arc<StoreContext> {
        let dir = std::env::temp_dir().join(format!("noema_test_{}", uuid::Uuid::new_v4()));
        Arc::new(StoreContext::open(dir).unwrap())
    }

    #[tokio::test]
    async fn refresh_recomputes_counts_and_domains() {
        let store = temp_store();
        let service = IdentityService::new(store.clone());

        store
            .runs
            .create(RunRecord::new("run-1", "Test login flow"))
            .await
            .unwrap();
        store
            .metrics
            .create(RunMetrics::new("run-1", "login"))
            .await
            .unwrap();
        store
            .metrics
            .create(RunMetrics::new("run-2", "checkout"))
            .await
            .unwrap();

        let identity = service.refresh().await.unwrap();
        assert_eq!(identity.total_runs, 1);
        assert_eq!(identity.domains_seen, vec!["checkout", "login"]);

        // the singleton id is stable across refreshes
        let again = service.refresh().await.unwrap();
        assert_eq!(again.id, identity.id);
        assert_eq!(store.identity.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn view_carries_age_and_statement() {
        let store = temp_store();
        let service = IdentityService::new(store);
        let view = service.view().await.unwrap();
        assert!(view.age_seconds >= 0);
        assert!(view.statement.contains("0 runs"));
    }
}
