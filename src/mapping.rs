use anyhow::Context;
use async_trait::async_trait;
use fbt_types::mapping::{MappingCache, MappingRepository, SkuMapping};
use time::OffsetDateTime;
use tokio_rusqlite::Connection;

const IN_CHUNK: usize = 400;

pub struct SqliteMappingRepository {
    conn: Connection,
}

impl SqliteMappingRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            let _ = conn.pragma_update(None, "journal_mode", &"WAL");
            let _ = conn.pragma_update(None, "synchronous", &"NORMAL");
            let _ = conn.pragma_update(None, "busy_timeout", &5000i64);
            conn.execute(
                "CREATE TABLE IF NOT EXISTS sku_mapping (
                    sku TEXT PRIMARY KEY,
                    product_id TEXT NOT NULL,
                    is_published INTEGER NOT NULL,
                    inventory_count INTEGER NOT NULL,
                    substores TEXT,
                    updated_at INTEGER NOT NULL
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn substores_to_db(mapping: &SkuMapping) -> Option<String> {
    if mapping.substores.is_empty() {
        None
    } else {
        Some(mapping.substores.iter().map(String::as_str).collect::<Vec<_>>().join(","))
    }
}

fn from_row(row: &rusqlite::Row) -> rusqlite::Result<SkuMapping> {
    let sku: String = row.get(0)?;
    let product_id: String = row.get(1)?;
    let is_published: bool = row.get(2)?;
    let inventory_count: i64 = row.get(3)?;
    let substores: Option<String> = row.get(4)?;
    Ok(SkuMapping {
        sku,
        product_id,
        is_published,
        inventory_count,
        substores: substores
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

const SELECT: &str =
    "SELECT sku, product_id, is_published, inventory_count, substores FROM sku_mapping";

#[async_trait]
impl MappingRepository for SqliteMappingRepository {
    async fn get_many(&self, skus: &[String]) -> anyhow::Result<MappingCache> {
        let mut cache = MappingCache::with_capacity(skus.len());
        for chunk in skus.chunks(IN_CHUNK) {
            let chunk = chunk.iter().map(|s| s.trim().to_string()).collect::<Vec<_>>();
            let items = self
                .conn
                .call(move |conn| {
                    let placeholders = vec!["?"; chunk.len()].join(", ");
                    let mut stmt =
                        conn.prepare(&format!("{SELECT} WHERE sku IN ({placeholders})"))?;
                    let items = stmt
                        .query_map(rusqlite::params_from_iter(chunk), from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(items)
                })
                .await
                .context("Unable to read sku mappings")?;
            cache.extend(items.into_iter().map(|m| (m.sku.clone(), m)));
        }
        Ok(cache)
    }

    async fn list_skus(&self) -> anyhow::Result<Vec<String>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT sku FROM sku_mapping ORDER BY sku")?;
                let skus = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(skus)
            })
            .await
            .context("Unable to list skus")
    }

    async fn upsert_many(&self, mappings: Vec<SkuMapping>) -> anyhow::Result<usize> {
        if mappings.is_empty() {
            return Ok(0);
        }
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut count = 0;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO sku_mapping
                            (sku, product_id, is_published, inventory_count, substores, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(sku) DO UPDATE SET
                            product_id = excluded.product_id,
                            is_published = excluded.is_published,
                            inventory_count = excluded.inventory_count,
                            substores = excluded.substores,
                            updated_at = excluded.updated_at",
                    )?;
                    for m in mappings.iter() {
                        count += stmt.execute(rusqlite::params![
                            m.sku,
                            m.product_id,
                            m.is_published,
                            m.inventory_count,
                            substores_to_db(m),
                            now,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(count)
            })
            .await
            .context("Unable to store sku mappings")
    }
}
