use derive_more::Display;
use fbt_types::mapping::{check_availability, MappingCache, SkuMapping};
use fbt_types::transaction::CoPurchasePair;
use fbt_types::Rejection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Why a SKU produced nothing to publish.
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    #[display("no product mapping found")]
    NoMapping,
    #[display("not published or out of stock")]
    Unavailable,
    #[display("no valid recommendations")]
    NoRecommendations,
}

impl SkipReason {
    /// The SKU itself is not sellable, as opposed to having nothing to pair.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejected {
    pub sku: String,
    pub reason: Rejection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub skus: Vec<String>,
    /// Manual SKUs that were considered and dropped.
    pub rejected: Vec<Rejected>,
}

impl Recommendation {
    pub fn is_empty(&self) -> bool {
        self.skus.is_empty()
    }
}

/// Resolves the SKU being recommended for. Only a mapped, published and
/// in-stock SKU is worth the aggregation query.
pub fn check_origin<'a>(cache: &'a MappingCache, sku: &str) -> Result<&'a SkuMapping, SkipReason> {
    let mapping = cache.get(sku).ok_or(SkipReason::NoMapping)?;
    if mapping.is_available() {
        Ok(mapping)
    } else {
        Err(SkipReason::Unavailable)
    }
}

/// Merges ranked co-purchase candidates with the operator's list.
///
/// The automatic list wins outright once it fills `limit`. An empty automatic
/// list is replaced by the manual one, and a short one is topped up from it.
/// Every returned SKU is available in `cache`.
pub fn assemble(
    origin: &str,
    candidates: &[CoPurchasePair],
    manual: Option<&[String]>,
    cache: &MappingCache,
    limit: usize,
) -> Recommendation {
    let mut seen = HashSet::from([origin]);
    let mut skus = candidates
        .iter()
        .map(|c| c.paired_sku.as_str())
        .filter(|sku| check_availability(cache, sku).is_ok())
        .filter(|sku| seen.insert(*sku))
        .take(limit)
        .map(str::to_string)
        .collect::<Vec<_>>();

    let manual = match manual {
        Some(manual) if !manual.is_empty() && skus.len() < limit => manual,
        _ => {
            return Recommendation {
                skus,
                rejected: vec![],
            }
        }
    };

    let mut rejected = vec![];
    for sku in manual {
        if skus.len() >= limit {
            break;
        }
        if seen.contains(sku.as_str()) {
            continue;
        }
        match check_availability(cache, sku) {
            Ok(()) => {
                seen.insert(sku.as_str());
                skus.push(sku.clone());
            }
            Err(reason) => rejected.push(Rejected {
                sku: sku.clone(),
                reason,
            }),
        }
    }
    Recommendation { skus, rejected }
}
