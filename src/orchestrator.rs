use crate::assembler::{self, Recommendation, Rejected, SkipReason};
use anyhow::Context;
use catalog_client::{CatalogError, CatalogPublisher};
use fbt_types::mapping::{MappingCache, MappingRepository, SkuMapping};
use fbt_types::overrides::ManualOverrideSet;
use fbt_types::transaction::TransactionRepository;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const LOG_CAPACITY: usize = 1000;
/// Candidates requested per recommendation slot, to leave room for filtering.
pub const CANDIDATE_FACTOR: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub limit: usize,
    pub chunk_size: usize,
    pub compute_concurrency: usize,
    pub push_concurrency: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            limit: fbt_types::DEFAULT_LIMIT,
            chunk_size: 50,
            compute_concurrency: 10,
            push_concurrency: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSuccess {
    pub sku: String,
    pub product_id: String,
    pub recommendations: Vec<String>,
    pub rejected: Vec<Rejected>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushFailure {
    pub sku: String,
    pub product_id: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skip {
    pub sku: String,
    pub reason: SkipReason,
    pub rejected: Vec<Rejected>,
}

/// Final state of one SKU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SkuOutcome {
    Pushed(PushSuccess),
    Failed(PushFailure),
    Skipped(Skip),
}

impl SkuOutcome {
    pub fn log_line(&self) -> String {
        match self {
            Self::Pushed(s) => {
                let mut line = format!(
                    "✓ {} → {}: {}",
                    s.sku,
                    s.product_id,
                    s.recommendations.join(", ")
                );
                push_rejected(&mut line, &s.rejected);
                if let Some(warning) = &s.warning {
                    line.push_str(&format!(" (warning: {warning})"));
                }
                line
            }
            Self::Failed(f) => match &f.product_id {
                Some(id) => format!("✗ {} ({id}): {}", f.sku, f.error),
                None => format!("✗ {}: {}", f.sku, f.error),
            },
            Self::Skipped(s) => {
                let mark = if s.reason.is_unavailable() { '⊘' } else { '○' };
                let mut line = format!("{mark} {}: {}", s.sku, s.reason);
                push_rejected(&mut line, &s.rejected);
                line
            }
        }
    }
}

fn push_rejected(line: &mut String, rejected: &[Rejected]) {
    if rejected.is_empty() {
        return;
    }
    let rejected = rejected
        .iter()
        .map(|r| format!("{} {}", r.sku, r.reason))
        .join(", ");
    line.push_str(&format!(" (rejected {rejected})"));
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub processed: usize,
    pub successes: Vec<PushSuccess>,
    pub failures: Vec<PushFailure>,
    pub skipped: Vec<Skip>,
    pub log: VecDeque<String>,
    pub cancelled: bool,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn push_log<S: Into<String>>(&mut self, line: S) {
        if self.log.len() >= LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(line.into());
    }

    pub fn record(&mut self, outcome: SkuOutcome) {
        self.push_log(outcome.log_line());
        self.processed += 1;
        match outcome {
            SkuOutcome::Pushed(s) => self.successes.push(s),
            SkuOutcome::Failed(f) => self.failures.push(f),
            SkuOutcome::Skipped(s) => self.skipped.push(s),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.processed == self.successes.len() + self.failures.len() + self.skipped.len()
            && self.processed <= self.total
    }
}

/// Where a slice stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceCursor {
    pub next_index: usize,
    pub done: bool,
}

enum Computed {
    Ready {
        mapping: SkuMapping,
        recommendation: Recommendation,
    },
    Settled(SkuOutcome),
    Cancelled,
}

enum Settled {
    Outcome(SkuOutcome),
    Cancelled,
}

pub struct Orchestrator {
    mappings: Arc<dyn MappingRepository>,
    transactions: Arc<dyn TransactionRepository>,
    publisher: Arc<dyn CatalogPublisher>,
    options: BatchOptions,
}

impl Orchestrator {
    pub fn new(
        mappings: Arc<dyn MappingRepository>,
        transactions: Arc<dyn TransactionRepository>,
        publisher: Arc<dyn CatalogPublisher>,
        options: BatchOptions,
    ) -> Self {
        Self {
            mappings,
            transactions,
            publisher,
            options,
        }
    }

    pub fn options(&self) -> BatchOptions {
        self.options
    }

    pub fn mappings(&self) -> &Arc<dyn MappingRepository> {
        &self.mappings
    }

    /// Recomputes and publishes one SKU. `None` means the token fired before
    /// the SKU settled.
    pub async fn push_one(
        &self,
        sku: &str,
        overrides: &ManualOverrideSet,
        token: &CancellationToken,
    ) -> anyhow::Result<Option<SkuOutcome>> {
        let sku = fbt_types::normalize_sku(sku);
        let cache = self
            .mappings
            .get_many(std::slice::from_ref(&sku))
            .await
            .context("Unable to load sku mapping")?;
        let computed = self.compute(&sku, &cache, overrides, token).await;
        Ok(match self.settle(computed, token).await {
            Settled::Outcome(outcome) => Some(outcome),
            Settled::Cancelled => None,
        })
    }

    /// Processes up to `len` SKUs of `skus` starting at `start`, one chunk at
    /// a time, folding every settled SKU into `progress`.
    ///
    /// Only loading the mapping cache can fail the slice; `progress` keeps
    /// everything recorded before that.
    pub async fn push_slice(
        &self,
        progress: &mut BatchProgress,
        skus: &[String],
        start: usize,
        len: usize,
        cache: Option<&MappingCache>,
        overrides: &ManualOverrideSet,
        token: &CancellationToken,
    ) -> anyhow::Result<SliceCursor> {
        let start = start.min(skus.len());
        let end = start.saturating_add(len).min(skus.len());
        let slice = skus[start..end]
            .iter()
            .map(fbt_types::normalize_sku)
            .collect::<Vec<_>>();

        let loaded;
        let cache = match cache {
            Some(cache) => cache,
            None => {
                loaded = self
                    .mappings
                    .get_many(&slice)
                    .await
                    .context("Unable to load sku mappings")?;
                &loaded
            }
        };

        let chunk_size = self.options.chunk_size.max(1);
        let mut next_index = start;
        for chunk in slice.chunks(chunk_size) {
            if token.is_cancelled() {
                break;
            }
            let results = self.run_chunk(chunk, cache, overrides, token).await;
            let mut resume_at = None;
            let (mut pushed, mut failed, mut skipped) = (0, 0, 0);
            for (offset, settled) in results.into_iter().enumerate() {
                match settled {
                    // Everything from the first cancelled SKU on is redone on resume.
                    Settled::Outcome(_) if resume_at.is_some() => {}
                    Settled::Outcome(outcome) => {
                        match &outcome {
                            SkuOutcome::Pushed(_) => pushed += 1,
                            SkuOutcome::Failed(_) => failed += 1,
                            SkuOutcome::Skipped(_) => skipped += 1,
                        }
                        progress.record(outcome);
                    }
                    Settled::Cancelled => {
                        resume_at.get_or_insert(next_index + offset);
                    }
                }
            }
            log::info!(
                "FBT chunk {next_index}..{}: {pushed} pushed, {failed} failed, {skipped} skipped ({}/{} processed)",
                next_index + chunk.len(),
                progress.processed,
                progress.total
            );
            if let Some(resume_at) = resume_at {
                next_index = resume_at;
                break;
            }
            next_index += chunk.len();
        }

        if token.is_cancelled() {
            progress.cancelled = true;
            progress.push_log(format!("Cancelled, resume from {next_index}"));
        }
        Ok(SliceCursor {
            next_index,
            done: next_index >= skus.len(),
        })
    }

    /// Results come back in chunk order.
    async fn run_chunk(
        &self,
        chunk: &[String],
        cache: &MappingCache,
        overrides: &ManualOverrideSet,
        token: &CancellationToken,
    ) -> Vec<Settled> {
        let mut computed = stream::iter(chunk.iter().enumerate())
            .map(|(i, sku)| async move { (i, self.compute(sku, cache, overrides, token).await) })
            .buffer_unordered(self.options.compute_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        computed.sort_by_key(|(i, _)| *i);

        let mut settled = stream::iter(computed)
            .map(|(i, c)| async move { (i, self.settle(c, token).await) })
            .buffer_unordered(self.options.push_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        settled.sort_by_key(|(i, _)| *i);
        settled.into_iter().map(|(_, s)| s).collect()
    }

    async fn compute(
        &self,
        sku: &str,
        cache: &MappingCache,
        overrides: &ManualOverrideSet,
        token: &CancellationToken,
    ) -> Computed {
        let origin = match assembler::check_origin(cache, sku) {
            Ok(origin) => origin.clone(),
            Err(reason) => {
                return Computed::Settled(SkuOutcome::Skipped(Skip {
                    sku: sku.to_string(),
                    reason,
                    rejected: vec![],
                }))
            }
        };
        if token.is_cancelled() {
            return Computed::Cancelled;
        }
        let fail = |error: anyhow::Error| {
            Computed::Settled(SkuOutcome::Failed(PushFailure {
                sku: sku.to_string(),
                product_id: Some(origin.product_id.clone()),
                error: format!("{error:#}"),
            }))
        };

        let limit = self.options.limit;
        let candidates = match self
            .transactions
            .co_purchase_candidates(std::slice::from_ref(&origin.sku), limit * CANDIDATE_FACTOR)
            .await
        {
            Ok(mut lists) => lists.remove(&origin.sku).unwrap_or_default(),
            Err(err) => return fail(err),
        };
        let manual = overrides.for_mapping(&origin);

        let missing = candidates
            .iter()
            .map(|c| &c.paired_sku)
            .chain(manual.into_iter().flatten())
            .filter(|s| !cache.contains_key(s.as_str()))
            .unique()
            .cloned()
            .collect::<Vec<_>>();
        let fetched = if missing.is_empty() {
            MappingCache::new()
        } else {
            match self.mappings.get_many(&missing).await {
                Ok(fetched) => fetched,
                Err(err) => return fail(err),
            }
        };
        let lookup = candidates
            .iter()
            .map(|c| &c.paired_sku)
            .chain(manual.into_iter().flatten())
            .filter_map(|s| cache.get(s).or_else(|| fetched.get(s)))
            .map(|m| (m.sku.clone(), m.clone()))
            .collect::<MappingCache>();

        let recommendation = assembler::assemble(&origin.sku, &candidates, manual, &lookup, limit);
        if recommendation.is_empty() {
            return Computed::Settled(SkuOutcome::Skipped(Skip {
                sku: origin.sku.clone(),
                reason: SkipReason::NoRecommendations,
                rejected: recommendation.rejected,
            }));
        }
        Computed::Ready {
            mapping: origin,
            recommendation,
        }
    }

    async fn settle(&self, computed: Computed, token: &CancellationToken) -> Settled {
        let (mapping, recommendation) = match computed {
            Computed::Ready {
                mapping,
                recommendation,
            } => (mapping, recommendation),
            Computed::Settled(outcome) => return Settled::Outcome(outcome),
            Computed::Cancelled => return Settled::Cancelled,
        };
        if token.is_cancelled() {
            return Settled::Cancelled;
        }
        match self
            .publisher
            .publish(&mapping.product_id, &recommendation.skus, token)
            .await
        {
            Ok(outcome) => {
                if outcome.used_fallback {
                    log::warn!("{} published via fallback {}", mapping.sku, outcome.base_url);
                }
                Settled::Outcome(SkuOutcome::Pushed(PushSuccess {
                    sku: mapping.sku,
                    product_id: mapping.product_id,
                    recommendations: recommendation.skus,
                    rejected: recommendation.rejected,
                    warning: outcome.warning,
                }))
            }
            Err(CatalogError::Cancelled) => Settled::Cancelled,
            Err(err) => Settled::Outcome(SkuOutcome::Failed(PushFailure {
                sku: mapping.sku,
                product_id: Some(mapping.product_id),
                error: err.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::SqliteMappingRepository;
    use crate::transaction::SqliteTransactionRepository;
    use async_trait::async_trait;
    use catalog_client::PublishOutcome;
    use fbt_types::transaction::{CandidateLists, TransactionItem, TransactionRecord};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio_rusqlite::Connection;

    #[derive(Default)]
    struct FakeCatalog {
        published: Mutex<HashMap<String, Vec<String>>>,
        failing: Vec<String>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    #[async_trait]
    impl CatalogPublisher for FakeCatalog {
        async fn publish(
            &self,
            product_id: &str,
            skus: &[String],
            token: &CancellationToken,
        ) -> Result<PublishOutcome, CatalogError> {
            if token.is_cancelled() {
                return Err(CatalogError::Cancelled);
            }
            if self.failing.iter().any(|f| f == product_id) {
                return Err(CatalogError::UnexpectedPayload(format!(
                    "catalog rejected {product_id}"
                )));
            }
            let count = {
                let mut published = self.published.lock().unwrap();
                published.insert(product_id.to_string(), skus.to_vec());
                published.len()
            };
            if let Some((after, token)) = &self.cancel_after {
                if count >= *after {
                    token.cancel();
                }
            }
            Ok(PublishOutcome {
                base_url: "http://catalog".to_string(),
                used_fallback: false,
                warning: None,
            })
        }
    }

    struct Fixture {
        mappings: Arc<SqliteMappingRepository>,
        transactions: Arc<SqliteTransactionRepository>,
    }

    impl Fixture {
        async fn new() -> Self {
            let mappings = SqliteMappingRepository::init(Connection::open_in_memory().await.unwrap())
                .await
                .unwrap();
            let transactions =
                SqliteTransactionRepository::init(Connection::open_in_memory().await.unwrap())
                    .await
                    .unwrap();
            Self {
                mappings: Arc::new(mappings),
                transactions: Arc::new(transactions),
            }
        }

        async fn mapping(&self, sku: &str, flag: &str, stock: i64, hub: &str) {
            self.mappings
                .upsert_many(vec![SkuMapping::new(sku, &format!("p-{sku}"), flag, stock, [hub])])
                .await
                .unwrap();
        }

        async fn order(&self, id: &str, skus: &[&str]) {
            self.transactions
                .insert(TransactionRecord {
                    transaction_id: id.to_string(),
                    channel: "web".to_string(),
                    items: skus
                        .iter()
                        .map(|sku| TransactionItem {
                            sku: sku.to_string(),
                            price: 10.0,
                        })
                        .collect(),
                })
                .await
                .unwrap();
        }

        fn orchestrator(&self, catalog: Arc<FakeCatalog>, options: BatchOptions) -> Orchestrator {
            Orchestrator::new(self.mappings.clone(), self.transactions.clone(), catalog, options)
        }
    }

    fn skus(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn pushes_co_purchased_skus_for_one_sku() {
        let f = Fixture::new().await;
        for (sku, stock) in [("S1", 1), ("S2", 3), ("S3", 2), ("S4", 0)] {
            f.mapping(sku, "1", stock, "north").await;
        }
        for i in 0..10 {
            f.order(&format!("a{i}"), &["S1", "S2"]).await;
        }
        for i in 0..7 {
            f.order(&format!("b{i}"), &["S1", "S3"]).await;
        }
        f.order("c0", &["S1", "S4"]).await;
        let catalog = Arc::new(FakeCatalog::default());
        let orchestrator = f.orchestrator(catalog.clone(), BatchOptions::default());

        let outcome = orchestrator
            .push_one("S1", &ManualOverrideSet::default(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        match outcome {
            SkuOutcome::Pushed(s) => assert_eq!(s.recommendations, skus(&["S2", "S3"])),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(catalog.published.lock().unwrap()["p-S1"], skus(&["S2", "S3"]));
    }

    #[tokio::test]
    async fn falls_back_to_manual_hub_list() {
        let f = Fixture::new().await;
        f.mapping("S5", "1", 1, "north").await;
        f.mapping("S6", "1", 1, "south").await;
        f.mapping("S7", "0", 1, "south").await;
        f.mapping("S8", "1", 1, "south").await;
        let overrides = ManualOverrideSet::parse("north: [S6, S7, S8]").unwrap();
        let catalog = Arc::new(FakeCatalog::default());
        let orchestrator = f.orchestrator(catalog.clone(), BatchOptions::default());

        let outcome = orchestrator
            .push_one("S5", &overrides, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            outcome.log_line(),
            "✓ S5 → p-S5: S6, S8 (rejected S7 unpublished)"
        );
        assert_eq!(catalog.published.lock().unwrap()["p-S5"], skus(&["S6", "S8"]));
    }

    #[tokio::test]
    async fn slice_accounts_for_every_sku() {
        let f = Fixture::new().await;
        f.mapping("A", "1", 1, "hub").await;
        f.mapping("B", "1", 1, "hub").await;
        f.mapping("C", "0", 1, "hub").await;
        f.mapping("D", "1", 1, "hub").await;
        f.mapping("E", "1", 1, "hub").await;
        f.order("t1", &["A", "B"]).await;
        f.order("t2", &["E", "A"]).await;
        let catalog = Arc::new(FakeCatalog {
            failing: vec!["p-E".to_string()],
            ..Default::default()
        });
        let orchestrator = f.orchestrator(
            catalog,
            BatchOptions {
                chunk_size: 2,
                ..Default::default()
            },
        );
        let all = skus(&["A", "B", "C", "D", "E", "GHOST"]);
        let mut progress = BatchProgress::new(all.len());
        let token = CancellationToken::new();

        let cursor = orchestrator
            .push_slice(&mut progress, &all, 0, 4, None, &ManualOverrideSet::default(), &token)
            .await
            .unwrap();
        assert_eq!(cursor, SliceCursor { next_index: 4, done: false });
        assert!(progress.is_consistent());
        assert_eq!(progress.processed, 4);

        let cursor = orchestrator
            .push_slice(&mut progress, &all, cursor.next_index, 4, None, &ManualOverrideSet::default(), &token)
            .await
            .unwrap();
        assert_eq!(cursor, SliceCursor { next_index: 6, done: true });
        assert!(progress.is_consistent());
        assert_eq!(progress.processed, 6);
        assert_eq!(
            progress.successes.iter().map(|s| s.sku.as_str()).collect::<Vec<_>>(),
            vec!["A", "B"]
        );
        assert_eq!(progress.failures.len(), 1);
        assert_eq!(progress.failures[0].product_id.as_deref(), Some("p-E"));
        assert!(progress.failures[0].error.contains("p-E"));
        let reasons = progress
            .skipped
            .iter()
            .map(|s| (s.sku.as_str(), s.reason.clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            reasons,
            vec![
                ("C", SkipReason::Unavailable),
                ("D", SkipReason::NoRecommendations),
                ("GHOST", SkipReason::NoMapping)
            ]
        );
        assert!(progress.log.iter().any(|l| l.starts_with("⊘ C")));
        assert!(progress.log.iter().any(|l| l.starts_with("○ GHOST")));
        assert!(progress.log.iter().any(|l| l.starts_with("✗ E")));
        assert!(!progress.cancelled);
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_chunk() {
        let f = Fixture::new().await;
        let all = (0..6).map(|i| format!("S{i}")).collect::<Vec<_>>();
        for sku in &all {
            f.mapping(sku, "1", 1, "hub").await;
        }
        for (i, pair) in all.chunks(2).enumerate() {
            f.order(&format!("t{i}"), &[pair[0].as_str(), pair[1].as_str()]).await;
        }
        let token = CancellationToken::new();
        let catalog = Arc::new(FakeCatalog {
            cancel_after: Some((2, token.clone())),
            ..Default::default()
        });
        let orchestrator = f.orchestrator(
            catalog.clone(),
            BatchOptions {
                chunk_size: 2,
                push_concurrency: 1,
                ..Default::default()
            },
        );
        let mut progress = BatchProgress::new(all.len());
        let cursor = orchestrator
            .push_slice(&mut progress, &all, 0, all.len(), None, &ManualOverrideSet::default(), &token)
            .await
            .unwrap();

        assert!(progress.cancelled);
        assert_eq!(progress.processed, 2);
        assert!(progress.is_consistent());
        assert_eq!(cursor, SliceCursor { next_index: 2, done: false });
        assert_eq!(catalog.published.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resume_after_mid_chunk_cancel_counts_each_sku_once() {
        let f = Fixture::new().await;
        f.mapping("S0", "1", 1, "hub").await;
        f.mapping("S1", "1", 1, "hub").await;
        f.mapping("C", "0", 1, "hub").await;
        f.order("t1", &["S0", "S1"]).await;
        let first = CancellationToken::new();
        let catalog = Arc::new(FakeCatalog {
            cancel_after: Some((1, first.clone())),
            ..Default::default()
        });
        let orchestrator = f.orchestrator(
            catalog.clone(),
            BatchOptions {
                push_concurrency: 1,
                ..Default::default()
            },
        );
        let all = skus(&["S0", "S1", "C"]);
        let mut progress = BatchProgress::new(all.len());

        let cursor = orchestrator
            .push_slice(&mut progress, &all, 0, all.len(), None, &ManualOverrideSet::default(), &first)
            .await
            .unwrap();
        assert!(progress.cancelled);
        assert_eq!(cursor, SliceCursor { next_index: 1, done: false });
        assert_eq!(progress.processed, 1);
        assert!(progress.skipped.is_empty());
        assert!(progress.is_consistent());

        progress.cancelled = false;
        let cursor = orchestrator
            .push_slice(
                &mut progress,
                &all,
                cursor.next_index,
                all.len(),
                None,
                &ManualOverrideSet::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(cursor, SliceCursor { next_index: 3, done: true });
        assert_eq!(progress.processed, 3);
        assert!(progress.is_consistent());
        assert_eq!(
            progress.successes.iter().map(|s| s.sku.as_str()).collect::<Vec<_>>(),
            vec!["S0", "S1"]
        );
        assert_eq!(
            progress.skipped.iter().map(|s| s.sku.as_str()).collect::<Vec<_>>(),
            vec!["C"]
        );
    }

    #[tokio::test]
    async fn aggregation_failure_is_recorded_and_slice_continues() {
        struct BrokenTransactions;

        #[async_trait]
        impl TransactionRepository for BrokenTransactions {
            async fn co_purchase_candidates(
                &self,
                _: &[String],
                _: usize,
            ) -> anyhow::Result<CandidateLists> {
                Err(anyhow::anyhow!("aggregation offline"))
            }
            async fn insert(&self, _: TransactionRecord) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let f = Fixture::new().await;
        f.mapping("A", "1", 1, "hub").await;
        f.mapping("B", "1", 1, "hub").await;
        f.mapping("C", "0", 1, "hub").await;
        let catalog = Arc::new(FakeCatalog::default());
        let orchestrator = Orchestrator::new(
            f.mappings.clone(),
            Arc::new(BrokenTransactions),
            catalog.clone(),
            BatchOptions {
                chunk_size: 1,
                ..Default::default()
            },
        );
        let all = skus(&["A", "B", "C"]);
        let mut progress = BatchProgress::new(all.len());
        let cursor = orchestrator
            .push_slice(
                &mut progress,
                &all,
                0,
                all.len(),
                None,
                &ManualOverrideSet::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(cursor, SliceCursor { next_index: 3, done: true });
        assert!(progress.is_consistent());
        assert_eq!(progress.processed, 3);
        assert_eq!(
            progress
                .failures
                .iter()
                .map(|f| (f.sku.as_str(), f.product_id.as_deref()))
                .collect::<Vec<_>>(),
            vec![("A", Some("p-A")), ("B", Some("p-B"))]
        );
        assert!(progress.failures[0].error.contains("aggregation offline"));
        assert_eq!(progress.skipped.len(), 1);
        assert!(catalog.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mapping_load_failure_keeps_progress() {
        struct BrokenMappings;

        #[async_trait]
        impl MappingRepository for BrokenMappings {
            async fn get_many(&self, _: &[String]) -> anyhow::Result<MappingCache> {
                Err(anyhow::anyhow!("store offline"))
            }
            async fn list_skus(&self) -> anyhow::Result<Vec<String>> {
                Ok(vec![])
            }
            async fn upsert_many(&self, _: Vec<SkuMapping>) -> anyhow::Result<usize> {
                Ok(0)
            }
        }

        let f = Fixture::new().await;
        let orchestrator = Orchestrator::new(
            Arc::new(BrokenMappings),
            f.transactions.clone(),
            Arc::new(FakeCatalog::default()),
            BatchOptions::default(),
        );
        let mut progress = BatchProgress::new(3);
        progress.record(SkuOutcome::Skipped(Skip {
            sku: "X".to_string(),
            reason: SkipReason::NoMapping,
            rejected: vec![],
        }));
        let res = orchestrator
            .push_slice(
                &mut progress,
                &skus(&["X", "Y", "Z"]),
                1,
                2,
                None,
                &ManualOverrideSet::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(res.is_err());
        assert_eq!(progress.processed, 1);
    }

    #[test]
    fn log_is_bounded() {
        let mut progress = BatchProgress::new(0);
        for i in 0..LOG_CAPACITY + 5 {
            progress.push_log(format!("line {i}"));
        }
        assert_eq!(progress.log.len(), LOG_CAPACITY);
        assert_eq!(progress.log.front().map(String::as_str), Some("line 5"));
    }
}
