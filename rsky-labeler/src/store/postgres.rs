//! Postgres-backed label store.
//!
//! Identities come from a `BIGSERIAL` column. Sequence values are handed out
//! before commit, so every insert first takes a transaction-scoped advisory
//! lock. Writers then draw and commit ids one at a time, and a cursor reader
//! never sees id N+1 while id N is still uncommitted.
//! The signed `exp` string is stored verbatim (it is part of the signed
//! bytes) next to a `TIMESTAMPTZ` copy that expiration filtering runs on.

use crate::label::SignedLabel;
use crate::store::{FindOptions, LabelFilter, LabelStore, SortOrder, StoreError, StoredLabel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{
    Config as PgConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts,
};
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

const LABEL_COLUMNS: &str = "id, src, uri, cid, val, neg, cts, exp, sig, ver";

/// Advisory lock key serializing label inserts.
pub(crate) const INSERT_LOCK_KEY: i64 = 0x6c61_6265_6c73;

/// Converts a row count to a SQL `BIGINT`, saturating instead of wrapping.
pub(crate) fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

type SqlParam = Box<dyn ToSql + Sync + Send>;

pub struct PostgresLabelStore {
    pool: Pool,
}

impl PostgresLabelStore {
    pub fn new(database_url: &str, max_pool_size: usize) -> Result<Self, StoreError> {
        let mut pg_config = PgConfig::new();
        pg_config.url = Some(database_url.to_string());
        pg_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pg_config.pool = Some(PoolConfig {
            max_size: max_pool_size,
            timeouts: Timeouts {
                wait: Some(Duration::from_secs(30)),
                create: Some(Duration::from_secs(30)),
                recycle: Some(Duration::from_secs(30)),
            },
            ..Default::default()
        });
        let pool = pg_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }
}

fn row_to_stored(row: &Row) -> Result<StoredLabel, StoreError> {
    Ok(StoredLabel {
        id: row.try_get("id")?,
        label: SignedLabel {
            cid: row.try_get("cid")?,
            cts: row.try_get("cts")?,
            exp: row.try_get("exp")?,
            neg: row.try_get("neg")?,
            sig: row.try_get("sig")?,
            src: row.try_get("src")?,
            uri: row.try_get("uri")?,
            val: row.try_get("val")?,
            ver: row.try_get("ver")?,
        },
    })
}

fn exp_instant(label: &SignedLabel) -> Option<DateTime<Utc>> {
    label
        .exp
        .as_deref()
        .and_then(|exp| DateTime::parse_from_rfc3339(exp).ok())
        .map(|exp| exp.with_timezone(&Utc))
}

/// Escapes `LIKE` metacharacters so a pattern prefix matches literally.
pub(crate) fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Builds the `WHERE` clause for a filter. Parameters are numbered from $1.
pub(crate) fn filter_clause(filter: &LabelFilter, now: DateTime<Utc>) -> (String, Vec<SqlParam>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<SqlParam> = Vec::new();

    if let Some(uri) = &filter.uri {
        params.push(Box::new(uri.clone()));
        conditions.push(format!("uri = ${}", params.len()));
    }
    if !filter.uri_patterns.is_empty() {
        let mut alternatives = Vec::new();
        for pattern in &filter.uri_patterns {
            match pattern.strip_suffix('*') {
                Some(prefix) => {
                    params.push(Box::new(format!("{}%", escape_like(prefix))));
                    alternatives.push(format!("uri LIKE ${}", params.len()));
                }
                None => {
                    params.push(Box::new(pattern.clone()));
                    alternatives.push(format!("uri = ${}", params.len()));
                }
            }
        }
        conditions.push(format!("({})", alternatives.join(" OR ")));
    }
    if !filter.sources.is_empty() {
        params.push(Box::new(filter.sources.clone()));
        conditions.push(format!("src = ANY(${})", params.len()));
    }
    if let Some(val) = &filter.val {
        params.push(Box::new(val.clone()));
        conditions.push(format!("val = ${}", params.len()));
    }
    if let Some(neg) = filter.neg {
        params.push(Box::new(neg));
        conditions.push(format!("neg = ${}", params.len()));
    }
    if let Some(exp) = &filter.exp {
        params.push(Box::new(exp.clone()));
        conditions.push(format!("exp = ${}", params.len()));
    }
    if !filter.allow_expired {
        params.push(Box::new(now));
        conditions.push(format!("(exp_at IS NULL OR exp_at > ${})", params.len()));
    }

    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    (clause, params)
}

#[async_trait]
impl LabelStore for PostgresLabelStore {
    async fn connect(&self) -> Result<(), StoreError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS signed_label (
                    id BIGSERIAL PRIMARY KEY,
                    src TEXT NOT NULL,
                    uri TEXT NOT NULL,
                    cid TEXT,
                    val TEXT NOT NULL,
                    neg BOOLEAN NOT NULL DEFAULT FALSE,
                    cts TEXT NOT NULL,
                    exp TEXT,
                    exp_at TIMESTAMPTZ,
                    sig BYTEA NOT NULL,
                    ver BIGINT NOT NULL DEFAULT 1
                );
                CREATE INDEX IF NOT EXISTS idx_signed_label_uri ON signed_label (uri);
                CREATE INDEX IF NOT EXISTS idx_signed_label_src_val ON signed_label (src, val);
                "#,
            )
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        info!("Connected to label database");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.pool.is_closed() {
            return Err(StoreError::Close("pool is already closed".to_string()));
        }
        self.pool.close();
        Ok(())
    }

    async fn insert(&self, label: SignedLabel) -> Result<StoredLabel, StoreError> {
        let mut client = self.pool.get().await?;
        let exp_at = exp_instant(&label);
        let tx = client.transaction().await?;
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&INSERT_LOCK_KEY])
            .await?;
        let row = tx
            .query_one(
                "INSERT INTO signed_label (src, uri, cid, val, neg, cts, exp, exp_at, sig, ver)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 RETURNING id",
                &[
                    &label.src,
                    &label.uri,
                    &label.cid,
                    &label.val,
                    &label.neg,
                    &label.cts,
                    &label.exp,
                    &exp_at,
                    &label.sig,
                    &label.ver,
                ],
            )
            .await
            .map_err(|e| {
                if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                    StoreError::Constraint(e.to_string())
                } else {
                    StoreError::Postgres(e)
                }
            })?;
        let id: i64 = row.try_get("id")?;
        tx.commit().await?;
        debug!("Inserted label {id}: {} on {}", label.val, label.uri);
        Ok(StoredLabel { id, label })
    }

    async fn find_many(
        &self,
        filter: &LabelFilter,
        options: FindOptions,
    ) -> Result<Vec<StoredLabel>, StoreError> {
        let (clause, mut params) = filter_clause(filter, Utc::now());
        let order = match options.sort {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let mut sql = format!("SELECT {LABEL_COLUMNS} FROM signed_label{clause} ORDER BY id {order}");
        if let Some(limit) = options.limit {
            params.push(Box::new(sql_count(limit)));
            sql.push_str(&format!(" LIMIT ${}", params.len()));
        }
        if options.skip > 0 {
            params.push(Box::new(sql_count(options.skip)));
            sql.push_str(&format!(" OFFSET ${}", params.len()));
        }

        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let client = self.pool.get().await?;
        let rows = client.query(sql.as_str(), &refs).await?;
        rows.iter().map(row_to_stored).collect()
    }

    async fn find_one(&self, id: i64) -> Result<Option<StoredLabel>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {LABEL_COLUMNS} FROM signed_label WHERE id = $1");
        let row = client.query_opt(sql.as_str(), &[&id]).await?;
        row.as_ref().map(row_to_stored).transpose()
    }

    async fn find_after(&self, id: i64, limit: usize) -> Result<Vec<StoredLabel>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {LABEL_COLUMNS} FROM signed_label WHERE id > $1 ORDER BY id ASC LIMIT $2"
        );
        let rows = client
            .query(sql.as_str(), &[&id, &sql_count(limit)])
            .await?;
        rows.iter().map(row_to_stored).collect()
    }

    async fn update_by_id(&self, id: i64, label: &SignedLabel) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let exp_at = exp_instant(label);
        let updated = client
            .execute(
                "UPDATE signed_label
                 SET src = $2, uri = $3, cid = $4, val = $5, neg = $6, cts = $7,
                     exp = $8, exp_at = $9, sig = $10, ver = $11
                 WHERE id = $1",
                &[
                    &id,
                    &label.src,
                    &label.uri,
                    &label.cid,
                    &label.val,
                    &label.neg,
                    &label.cts,
                    &label.exp,
                    &exp_at,
                    &label.sig,
                    &label.ver,
                ],
            )
            .await?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_sql_count_saturates() {
        assert_eq!(sql_count(0), 0);
        assert_eq!(sql_count(250), 250);
        assert_eq!(sql_count(usize::MAX), i64::MAX);
    }

    /// Needs a scratch database in `TEST_DATABASE_URL`; skipped otherwise.
    #[tokio::test]
    async fn test_insert_waits_for_earlier_writer() {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            return;
        };
        let store = PostgresLabelStore::new(&url, 4).unwrap();
        store.connect().await.unwrap();

        let (mut other, connection) = tokio_postgres::connect(&url, NoTls).await.unwrap();
        tokio::spawn(connection);
        let tx = other.transaction().await.unwrap();
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&INSERT_LOCK_KEY])
            .await
            .unwrap();

        let label = SignedLabel {
            cid: None,
            cts: "2025-06-01T12:00:00.000Z".to_string(),
            exp: None,
            neg: false,
            sig: vec![7; 64],
            src: "did:web:labeler.test".to_string(),
            uri: "did:plc:7iza6de2dwap2sbkpav7c6c6".to_string(),
            val: "spam".to_string(),
            ver: 1,
        };
        let store = std::sync::Arc::new(store);
        let writer = tokio::spawn({
            let store = store.clone();
            async move { store.insert(label).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!writer.is_finished());

        tx.commit().await.unwrap();
        let stored = writer.await.unwrap().unwrap();
        let after = store.find_after(stored.id - 1, 10).await.unwrap();
        assert_eq!(after.first().map(|s| s.id), Some(stored.id));
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("at://did:plc:a/"), "at://did:plc:a/");
        assert_eq!(escape_like("100%_\\"), "100\\%\\_\\\\");
    }

    #[test]
    fn test_default_filter_only_excludes_expired() {
        let (clause, params) = filter_clause(&LabelFilter::default(), now());
        assert_eq!(clause, " WHERE (exp_at IS NULL OR exp_at > $1)");
        assert_eq!(params.len(), 1);

        let all = LabelFilter {
            allow_expired: true,
            ..Default::default()
        };
        let (clause, params) = filter_clause(&all, now());
        assert_eq!(clause, "");
        assert!(params.is_empty());
    }

    #[test]
    fn test_filter_clause_numbers_params_in_order() {
        let filter = LabelFilter {
            uri: None,
            uri_patterns: vec!["at://did:plc:a/*".to_string(), "did:plc:b".to_string()],
            sources: vec!["did:web:labeler.test".to_string()],
            val: Some("spam".to_string()),
            neg: Some(false),
            exp: None,
            allow_expired: true,
        };
        let (clause, params) = filter_clause(&filter, now());
        assert_eq!(
            clause,
            " WHERE (uri LIKE $1 OR uri = $2) AND src = ANY($3) AND val = $4 AND neg = $5"
        );
        assert_eq!(params.len(), 5);
    }
}
