use crate::{normalize_sku, parse_publish_flag, Rejection};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Link between a SKU and the catalog product it lives on.
///
/// `is_published` is derived from the raw publish flag exactly once, when the
/// mapping enters the system, so nothing downstream compares flags by hand.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SkuMapping {
    pub sku: String,
    pub product_id: String,
    pub is_published: bool,
    pub inventory_count: i64,
    pub substores: BTreeSet<String>,
}

impl SkuMapping {
    pub fn new<I, S>(
        sku: &str,
        product_id: &str,
        publish_flag: &str,
        inventory_count: i64,
        substores: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            sku: normalize_sku(sku),
            product_id: product_id.trim().to_string(),
            is_published: parse_publish_flag(publish_flag),
            inventory_count,
            substores: substores
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.is_published && self.inventory_count > 0
    }

    pub fn check(&self) -> Result<(), Rejection> {
        if !self.is_published {
            Err(Rejection::Unpublished)
        } else if self.inventory_count <= 0 {
            Err(Rejection::OutOfStock)
        } else {
            Ok(())
        }
    }
}

pub type MappingCache = HashMap<String, SkuMapping>;

pub fn check_availability(cache: &MappingCache, sku: &str) -> Result<(), Rejection> {
    cache.get(sku).ok_or(Rejection::NotFound)?.check()
}

#[async_trait]
pub trait MappingRepository: Send + Sync {
    async fn get_many(&self, skus: &[String]) -> anyhow::Result<MappingCache>;
    async fn list_skus(&self) -> anyhow::Result<Vec<String>>;
    async fn upsert_many(&self, mappings: Vec<SkuMapping>) -> anyhow::Result<usize>;
}
