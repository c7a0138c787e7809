use crate::mapping::SkuMapping;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MAX_OVERRIDE_SKUS: usize = 6;
/// Hub key that applies to every SKU regardless of its substores.
pub const ANY_HUB: &str = "*";

/// Operator-curated recommendation lists keyed by hub tag.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(try_from = "BTreeMap<String, Vec<String>>", into = "BTreeMap<String, Vec<String>>")]
pub struct ManualOverrideSet {
    hubs: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum OverrideError {
    #[display("hub {_0} has no SKUs")]
    Empty(String),
    #[display("hub {_0} has {_1} SKUs, at most 6 allowed")]
    TooMany(String, usize),
    #[display("hub {_0} lists SKU {_1} which is not uppercase")]
    NotUppercase(String, String),
    #[display("hub {_0} is listed more than once")]
    DuplicateHub(String),
}

impl std::error::Error for OverrideError {}

impl TryFrom<BTreeMap<String, Vec<String>>> for ManualOverrideSet {
    type Error = OverrideError;

    fn try_from(raw: BTreeMap<String, Vec<String>>) -> Result<Self, Self::Error> {
        let mut hubs = BTreeMap::new();
        for (hub, skus) in raw {
            let hub = hub.trim().to_lowercase();
            let skus = skus
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unique()
                .collect::<Vec<_>>();
            if skus.is_empty() {
                return Err(OverrideError::Empty(hub));
            }
            if skus.len() > MAX_OVERRIDE_SKUS {
                return Err(OverrideError::TooMany(hub, skus.len()));
            }
            if let Some(sku) = skus.iter().find(|s| s.to_uppercase() != **s) {
                return Err(OverrideError::NotUppercase(hub, sku.clone()));
            }
            if hubs.contains_key(&hub) {
                return Err(OverrideError::DuplicateHub(hub));
            }
            hubs.insert(hub, skus);
        }
        Ok(Self { hubs })
    }
}

impl From<ManualOverrideSet> for BTreeMap<String, Vec<String>> {
    fn from(set: ManualOverrideSet) -> Self {
        set.hubs
    }
}

impl ManualOverrideSet {
    /// A single list applied to every SKU.
    pub fn for_any_hub(skus: Vec<String>) -> Result<Self, OverrideError> {
        BTreeMap::from([(ANY_HUB.to_string(), skus)]).try_into()
    }

    /// Accepts either YAML or JSON, the same way shop configs are read.
    pub fn parse(data: &str) -> anyhow::Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let set = serde_json::from_str::<Self>(data).or_else(|_| serde_yaml::from_str(data))?;
        Ok(set)
    }

    /// The override list that applies to `mapping`: the first of its substores
    /// (in sorted order) with an entry, falling back to the `*` hub.
    pub fn for_mapping(&self, mapping: &SkuMapping) -> Option<&[String]> {
        mapping
            .substores
            .iter()
            .find_map(|s| self.hubs.get(s))
            .or_else(|| self.hubs.get(ANY_HUB))
            .map(Vec::as_slice)
    }
}
