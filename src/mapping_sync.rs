use anyhow::Context;
use catalog_client::{CatalogClient, ProductPage};
use fbt_types::mapping::{MappingRepository, SkuMapping};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub const PRODUCT_FIELDS: [&str; 5] = ["id", "sku", "publish", "inventory_quantity", "substores"];

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

/// Reads the listing fields of one catalog product. Products without a SKU
/// or an id yield `None`.
pub fn product_to_mapping(product: &Value) -> Option<SkuMapping> {
    let id = product.get("id").and_then(scalar_to_string)?;
    let sku = product
        .get("sku")
        .and_then(scalar_to_string)
        .filter(|s| !s.trim().is_empty())?;
    let publish = product
        .get("publish")
        .and_then(scalar_to_string)
        .unwrap_or_default();
    let inventory = match product.get("inventory_quantity") {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
        _ => 0,
    };
    let substores = match product.get("substores") {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_to_string).collect(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        _ => vec![],
    };
    Some(SkuMapping::new(&sku, &id, &publish, inventory, substores))
}

/// Walks the product listing with a `since_id` cursor and upserts every
/// product that carries a SKU. Returns the number of mappings written.
pub async fn sync_mappings(
    client: &CatalogClient,
    repo: &dyn MappingRepository,
    page_size: usize,
    token: &CancellationToken,
) -> anyhow::Result<usize> {
    let mut since_id: Option<String> = None;
    let mut written = 0;
    loop {
        let page = client
            .list_products(&PRODUCT_FIELDS, page_size, since_id.as_deref(), token)
            .await
            .context("Unable to list catalog products")?;
        let products = match page {
            ProductPage::Products(products) if !products.is_empty() => products,
            ProductPage::Products(_) => break,
            ProductPage::LimitReached => {
                log::info!("Catalog listing limit reached after {written} mappings");
                break;
            }
        };
        let last_id = products
            .last()
            .and_then(|p| p.get("id"))
            .and_then(scalar_to_string);
        let mut mappings = Vec::with_capacity(products.len());
        for product in &products {
            match product_to_mapping(product) {
                Some(mapping) => mappings.push(mapping),
                None => log::warn!(
                    "Skipping catalog product without sku: {}",
                    product.get("id").unwrap_or(&Value::Null)
                ),
            }
        }
        written += repo.upsert_many(mappings).await?;
        if last_id.is_none() || last_id == since_id {
            break;
        }
        since_id = last_id;
    }
    log::info!("Synced {written} sku mappings");
    Ok(written)
}
