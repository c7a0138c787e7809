use anyhow::Context;
use async_trait::async_trait;
use fbt_types::transaction::{
    CandidateLists, CoPurchasePair, TransactionRecord, TransactionRepository, EXCLUDED_CHANNEL,
    PLACEHOLDER_PRICE,
};
use itertools::Itertools;
use rusqlite::types::Value;
use time::OffsetDateTime;
use tokio_rusqlite::Connection;

const IN_CHUNK: usize = 400;

// Pairs are counted once per transaction. Only transactions holding one of
// the main SKUs are read, found through the sku index. A transaction needs
// two raw items to qualify even if one of them is later dropped for its
// placeholder price.
//
// ?1 excluded channel, ?2 placeholder price, ?3 top n, then the main SKUs.
const CO_PURCHASE_QUERY: &str = "
    WITH touched AS (
        SELECT DISTINCT transaction_id
        FROM transaction_item
        WHERE sku IN ({placeholders})
    ),
    eligible AS (
        SELECT t.transaction_id
        FROM touched
        JOIN transaction_record t ON t.transaction_id = touched.transaction_id
        JOIN transaction_item i ON i.transaction_id = t.transaction_id
        WHERE t.channel <> ?1
        GROUP BY t.transaction_id
        HAVING COUNT(*) >= 2
    ),
    items AS (
        SELECT DISTINCT i.transaction_id, i.sku
        FROM eligible e
        JOIN transaction_item i ON i.transaction_id = e.transaction_id
        WHERE i.price <> ?2
    ),
    pairs AS (
        SELECT m.sku AS main_sku, p.sku AS paired_sku,
               COUNT(DISTINCT m.transaction_id) AS cnt
        FROM items m
        JOIN items p ON p.transaction_id = m.transaction_id AND p.sku <> m.sku
        WHERE m.sku IN ({placeholders})
        GROUP BY m.sku, p.sku
    ),
    ranked AS (
        SELECT main_sku, paired_sku, cnt,
               ROW_NUMBER() OVER (
                   PARTITION BY main_sku ORDER BY cnt DESC, paired_sku ASC
               ) AS rn
        FROM pairs
    )
    SELECT main_sku, paired_sku, cnt FROM ranked WHERE rn <= ?3 ORDER BY main_sku, rn";

const FIRST_SKU_PARAM: usize = 4;

fn co_purchase_sql(sku_count: usize) -> String {
    let placeholders = (FIRST_SKU_PARAM..FIRST_SKU_PARAM + sku_count)
        .map(|i| format!("?{i}"))
        .join(", ");
    CO_PURCHASE_QUERY.replace("{placeholders}", &placeholders)
}

pub struct SqliteTransactionRepository {
    conn: Connection,
}

impl SqliteTransactionRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            let _ = conn.pragma_update(None, "journal_mode", &"WAL");
            let _ = conn.pragma_update(None, "synchronous", &"NORMAL");
            let _ = conn.pragma_update(None, "busy_timeout", &5000i64);
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS transaction_record (
                    transaction_id TEXT PRIMARY KEY,
                    channel TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS transaction_item (
                    transaction_id TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    sku TEXT NOT NULL,
                    price REAL NOT NULL,
                    PRIMARY KEY (transaction_id, position)
                );
                CREATE INDEX IF NOT EXISTS transaction_item_sku ON transaction_item (sku);",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl TransactionRepository for SqliteTransactionRepository {
    async fn co_purchase_candidates(
        &self,
        main_skus: &[String],
        top_n: usize,
    ) -> anyhow::Result<CandidateLists> {
        let mut res = CandidateLists::new();
        if top_n == 0 {
            return Ok(res);
        }
        for chunk in main_skus.chunks(IN_CHUNK) {
            let chunk = chunk.iter().map(|s| s.trim().to_string()).collect::<Vec<_>>();
            let pairs = self
                .conn
                .call(move |conn| {
                    let sql = co_purchase_sql(chunk.len());
                    let mut params: Vec<Value> = Vec::with_capacity(chunk.len() + 3);
                    params.push(EXCLUDED_CHANNEL.to_string().into());
                    params.push(PLACEHOLDER_PRICE.into());
                    params.push((top_n as i64).into());
                    params.extend(chunk.into_iter().map(Value::from));
                    let mut stmt = conn.prepare(&sql)?;
                    let pairs = stmt
                        .query_map(rusqlite::params_from_iter(params), |row| {
                            let count: i64 = row.get(2)?;
                            Ok(CoPurchasePair {
                                main_sku: row.get(0)?,
                                paired_sku: row.get(1)?,
                                count: count.max(0) as u64,
                            })
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(pairs)
                })
                .await
                .context("Unable to aggregate co-purchases")?;
            for pair in pairs {
                res.entry(pair.main_sku.clone()).or_default().push(pair);
            }
        }
        Ok(res)
    }

    async fn insert(&self, record: TransactionRecord) -> anyhow::Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR REPLACE INTO transaction_record (transaction_id, channel, created_at)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![record.transaction_id, record.channel.trim(), now],
                )?;
                tx.execute(
                    "DELETE FROM transaction_item WHERE transaction_id = ?1",
                    [&record.transaction_id],
                )?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO transaction_item (transaction_id, position, sku, price)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for (position, item) in record.items.iter().enumerate() {
                        stmt.execute(rusqlite::params![
                            record.transaction_id,
                            position as i64,
                            item.sku.trim(),
                            item.price,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .context("Unable to store transaction")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbt_types::transaction::TransactionItem;

    async fn repo() -> SqliteTransactionRepository {
        let conn = Connection::open_in_memory().await.unwrap();
        SqliteTransactionRepository::init(conn).await.unwrap()
    }

    async fn order(repo: &SqliteTransactionRepository, id: &str, channel: &str, items: &[(&str, f64)]) {
        repo.insert(TransactionRecord {
            transaction_id: id.to_string(),
            channel: channel.to_string(),
            items: items
                .iter()
                .map(|(sku, price)| TransactionItem {
                    sku: sku.to_string(),
                    price: *price,
                })
                .collect(),
        })
        .await
        .unwrap();
    }

    fn paired(lists: &CandidateLists, sku: &str) -> Vec<(String, u64)> {
        lists
            .get(sku)
            .map(|l| l.iter().map(|p| (p.paired_sku.clone(), p.count)).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn counts_distinct_transactions_per_pair() {
        let repo = repo().await;
        order(&repo, "t1", "web", &[("S1", 10.0), ("S2", 5.0), ("S3", 7.0)]).await;
        order(&repo, "t2", "web", &[("S1", 10.0), ("S2", 5.0)]).await;
        order(&repo, "t3", "app", &[("S1", 10.0), ("S4", 3.0), ("S4", 3.0)]).await;
        let lists = repo
            .co_purchase_candidates(&["S1".to_string()], 18)
            .await
            .unwrap();
        assert_eq!(
            paired(&lists, "S1"),
            vec![
                ("S2".to_string(), 2),
                ("S3".to_string(), 1),
                ("S4".to_string(), 1)
            ]
        );
    }

    #[tokio::test]
    async fn excludes_admin_single_item_and_placeholder_prices() {
        let repo = repo().await;
        order(&repo, "t1", "admin", &[("S1", 10.0), ("S2", 5.0)]).await;
        order(&repo, "t2", "web", &[("S1", 10.0)]).await;
        order(&repo, "t3", "web", &[("S1", 10.0), ("S3", 1.0)]).await;
        order(&repo, "t4", "web", &[("S1", 10.0), ("S1", 12.0)]).await;
        order(&repo, "t5", "web", &[("S1", 10.0), ("S5", 2.0)]).await;
        let lists = repo
            .co_purchase_candidates(&["S1".to_string(), "S3".to_string()], 18)
            .await
            .unwrap();
        assert_eq!(paired(&lists, "S1"), vec![("S5".to_string(), 1)]);
        assert!(!lists.contains_key("S3"));
    }

    #[tokio::test]
    async fn truncates_to_top_n_with_sku_tie_break() {
        let repo = repo().await;
        order(&repo, "t1", "web", &[("M", 1.5), ("C", 2.0), ("B", 2.0), ("A", 2.0)]).await;
        order(&repo, "t2", "web", &[("M", 1.5), ("C", 2.0)]).await;
        order(&repo, "t3", "web", &[("X", 1.5), ("A", 2.0)]).await;
        let lists = repo
            .co_purchase_candidates(&["M".to_string(), "X".to_string()], 2)
            .await
            .unwrap();
        assert_eq!(
            paired(&lists, "M"),
            vec![("C".to_string(), 2), ("A".to_string(), 1)]
        );
        assert_eq!(paired(&lists, "X"), vec![("A".to_string(), 1)]);
    }

    #[tokio::test]
    async fn finds_transactions_through_sku_index() {
        let repo = repo().await;
        order(&repo, "t1", "web", &[("S1", 10.0), ("S2", 5.0)]).await;
        order(&repo, "t2", "web", &[("S8", 10.0), ("S9", 5.0)]).await;
        let plan = repo
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&format!("EXPLAIN QUERY PLAN {}", co_purchase_sql(1)))?;
                let details = stmt
                    .query_map(
                        rusqlite::params!["admin", 1.0, 18i64, "S1"],
                        |row| row.get::<_, String>(3),
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(details)
            })
            .await
            .unwrap();
        assert!(
            plan.iter().any(|d| d.contains("transaction_item_sku")),
            "{plan:?}"
        );
    }
}
