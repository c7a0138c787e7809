use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Transactions from this channel are operator-made and carry no signal.
pub const EXCLUDED_CHANNEL: &str = "admin";
/// Promotional and free-item placeholders are priced at exactly one.
pub const PLACEHOLDER_PRICE: f64 = 1.0;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransactionItem {
    pub sku: String,
    pub price: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub channel: String,
    pub items: Vec<TransactionItem>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CoPurchasePair {
    pub main_sku: String,
    pub paired_sku: String,
    pub count: u64,
}

/// Ranked co-purchase candidates keyed by main SKU, highest count first.
pub type CandidateLists = HashMap<String, Vec<CoPurchasePair>>;

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Top `top_n` paired SKUs per main SKU, ordered by descending count.
    /// Ties are ordered by paired SKU so one execution is always consistent.
    async fn co_purchase_candidates(
        &self,
        main_skus: &[String],
        top_n: usize,
    ) -> anyhow::Result<CandidateLists>;
    async fn insert(&self, record: TransactionRecord) -> anyhow::Result<()>;
}
