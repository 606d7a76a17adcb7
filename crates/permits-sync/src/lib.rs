//! Run orchestration: load store, scrape listing, enrich, reconcile, save.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use permits_core::{DateWindow, Permit};
use permits_scrape::{
    CalendarConfig, CalendarScraper, DetailEnricher, DetailFieldMap, EnricherConfig,
};
use permits_storage::{HttpClientConfig, PageClient, PermitStore};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "permits-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_path: PathBuf,
    pub origin: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub detail_concurrency: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store_path: std::env::var("PERMITS_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./permits.json")),
            origin: std::env::var("PERMITS_ORIGIN")
                .unwrap_or_else(|_| "https://capitolpermits.chp.ca.gov".to_string()),
            user_agent: std::env::var("PERMITS_USER_AGENT")
                .unwrap_or_else(|_| "permits-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("PERMITS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            detail_concurrency: std::env::var("PERMITS_DETAIL_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub updated: usize,
    pub inserted: usize,
}

/// Merge freshly scraped permits into the stored set by permit number.
///
/// A matched record is replaced whole; scraped records are fully enriched
/// (or deliberately skeletal) by this point, and a partial patch could
/// leave stale fields behind. Unmatched stored records pass through
/// untouched; nothing is ever deleted, so permits outside the scrape
/// window keep their history.
pub fn reconcile(existing: &mut Vec<Permit>, scraped: Vec<Permit>) -> ReconcileStats {
    let mut stats = ReconcileStats::default();
    for permit in scraped {
        match existing.iter_mut().find(|p| p.number == permit.number) {
            Some(slot) => {
                *slot = permit;
                stats.updated += 1;
            }
            None => {
                existing.push(permit);
                stats.inserted += 1;
            }
        }
    }
    stats
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: String,
    pub listed: usize,
    pub enriched: usize,
    pub enrich_failures: usize,
    pub updated: usize,
    pub inserted: usize,
    pub total: usize,
    pub store_path: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    client: PageClient,
    store: PermitStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let client = PageClient::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            max_concurrent_fetches: config.detail_concurrency,
        })?;
        let store = PermitStore::new(config.store_path.clone());
        Ok(Self {
            config,
            client,
            store,
        })
    }

    /// One full run: load the store, scrape the window, enrich, reconcile,
    /// save. The store is read once up front and written once at the very
    /// end, so a failure anywhere in between leaves prior state intact.
    pub async fn run_once(&self, window: DateWindow) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let mut records = self.store.load().await.context("loading permit store")?;

        info!(%run_id, %window, "scraping permits");
        let calendar = CalendarScraper::new(
            &self.client,
            CalendarConfig {
                origin: self.config.origin.clone(),
            },
        );
        let skeletal = calendar
            .fetch_listing(run_id, &window)
            .await
            .context("fetching calendar listing")?;
        let listed = skeletal.len();
        info!(count = listed, "found permits");

        let enricher = DetailEnricher::new(
            &self.client,
            EnricherConfig {
                concurrency: self.config.detail_concurrency,
                fields: DetailFieldMap::default(),
            },
        );
        let outcome = enricher.enrich(run_id, skeletal).await;
        let enrich_failures = outcome.failures.len();
        let enriched = listed - enrich_failures;

        let stats = reconcile(&mut records, outcome.permits);

        info!(path = %self.store.path().display(), "saving store");
        self.store
            .save(&mut records)
            .await
            .context("saving permit store")?;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            window: window.to_string(),
            listed,
            enriched,
            enrich_failures,
            updated: stats.updated,
            inserted: stats.inserted,
            total: records.len(),
            store_path: self.store.path().display().to_string(),
        })
    }
}
