//! [`SimilarityIndex`] over the `manual_vectors` table.
//!
//! One vector per APPROVED entry. Search is a brute-force cosine scan over
//! the rows matching the metadata filter, which is adequate for a
//! knowledge base of support manuals. A SHA-256 of the model name and text
//! is stored with each vector so re-indexing unchanged content skips the
//! embedding call.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::sync::Arc;
use tracing::debug;

use manual_kb_core::index::{IndexHit, IndexMetadata, IndexQuery, SimilarityIndex};

use crate::db::to_millis;
use crate::embedding::{blob_to_vec, cosine_similarity, embed_one, vec_to_blob, EmbeddingProvider};

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    provider: Arc<dyn EmbeddingProvider>,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { pool, provider }
    }

    /// Number of stored vectors.
    pub async fn len(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM manual_vectors")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

fn content_hash(model: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl SimilarityIndex for SqliteVectorIndex {
    async fn index(&self, id: &str, text: &str, metadata: &IndexMetadata) -> Result<()> {
        let model = self.provider.model_name().to_string();
        let hash = content_hash(&model, text);

        let stored: Option<String> =
            sqlx::query_scalar("SELECT content_hash FROM manual_vectors WHERE entry_id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        if stored.as_deref() == Some(hash.as_str()) {
            // Content unchanged; only the key may have moved.
            sqlx::query(
                "UPDATE manual_vectors SET business_type = ?, error_code = ? WHERE entry_id = ?",
            )
            .bind(&metadata.business_type)
            .bind(&metadata.error_code)
            .bind(id)
            .execute(&self.pool)
            .await?;
            debug!(entry_id = id, "vector up to date");
            return Ok(());
        }

        let vector = embed_one(self.provider.as_ref(), text).await?;
        if vector.len() != self.provider.dims() {
            bail!(
                "embedding has {} dims, expected {}",
                vector.len(),
                self.provider.dims()
            );
        }

        sqlx::query(
            r#"
            INSERT INTO manual_vectors
                (entry_id, business_type, error_code, model, dims, content_hash, embedding, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(entry_id) DO UPDATE SET
                business_type = excluded.business_type,
                error_code = excluded.error_code,
                model = excluded.model,
                dims = excluded.dims,
                content_hash = excluded.content_hash,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(&metadata.business_type)
        .bind(&metadata.error_code)
        .bind(&model)
        .bind(vector.len() as i64)
        .bind(&hash)
        .bind(vec_to_blob(&vector))
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        debug!(entry_id = id, dims = vector.len(), "vector stored");
        Ok(())
    }

    async fn search(&self, query: &IndexQuery<'_>) -> Result<Vec<IndexHit>> {
        if query.top_k == 0 || query.text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = embed_one(self.provider.as_ref(), query.text).await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT entry_id, business_type, error_code, embedding FROM manual_vectors WHERE model = ",
        );
        qb.push_bind(self.provider.model_name().to_string());
        if let Some(filter) = query.filter {
            if let Some(bt) = &filter.business_type {
                qb.push(" AND business_type = ").push_bind(bt.clone());
            }
            if let Some(ec) = &filter.error_code {
                qb.push(" AND error_code = ").push_bind(ec.clone());
            }
        }
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut hits: Vec<IndexHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let score = f64::from(cosine_similarity(&query_vec, &blob_to_vec(&blob))).clamp(0.0, 1.0);
                IndexHit {
                    id: row.get("entry_id"),
                    score,
                    metadata: IndexMetadata {
                        business_type: row.get("business_type"),
                        error_code: row.get("error_code"),
                    },
                }
            })
            .filter(|hit| query.threshold.map_or(true, |t| hit.score >= t))
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(query.top_k);
        Ok(hits)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM manual_vectors WHERE entry_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_depends_on_model_and_text() {
        let a = content_hash("m1", "hello");
        assert_eq!(a, content_hash("m1", "hello"));
        assert_ne!(a, content_hash("m2", "hello"));
        assert_ne!(a, content_hash("m1", "hello!"));
        assert_eq!(a.len(), 64);
    }
}
