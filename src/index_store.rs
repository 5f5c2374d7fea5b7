//! SQLite persistence for the built index.
//!
//! `shx index` replaces the stored chunks and vectors wholesale inside one
//! transaction; the chat path loads them back in insertion order so the
//! retrievers' tie-breaks survive a restart.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use support_harness_core::dense::DenseRow;
use support_harness_core::embedding::{blob_to_vec, vec_to_blob};
use support_harness_core::models::Chunk;

/// What the stored index was built with.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMeta {
    pub model: String,
    pub dims: usize,
    pub built_at: DateTime<Utc>,
}

/// Replace the stored index with `chunks` and their `rows`.
pub async fn save_index(
    pool: &SqlitePool,
    chunks: &[Chunk],
    rows: &[DenseRow],
    model: &str,
    dims: usize,
) -> Result<()> {
    if chunks.len() != rows.len() {
        bail!(
            "Index mismatch: {} chunks but {} embedding rows",
            chunks.len(),
            rows.len()
        );
    }

    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM embeddings").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM index_meta").execute(&mut *tx).await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, source_document, position, char_start, char_end, text, hash) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.source_document)
        .bind(chunk.position as i64)
        .bind(chunk.char_start as i64)
        .bind(chunk.char_end as i64)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;
    }

    for row in rows {
        sqlx::query(
            "INSERT INTO embeddings (chunk_id, source_document, model, dims, vector) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&row.chunk_id)
        .bind(&row.source_document)
        .bind(model)
        .bind(row.vector.len() as i64)
        .bind(vec_to_blob(&row.vector))
        .execute(&mut *tx)
        .await?;
    }

    for (key, value) in [
        ("model", model.to_string()),
        ("dims", dims.to_string()),
        ("built_at", Utc::now().to_rfc3339()),
    ] {
        sqlx::query("INSERT INTO index_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn load_chunks(pool: &SqlitePool) -> Result<Vec<Chunk>> {
    let rows = sqlx::query(
        "SELECT id, source_document, position, char_start, char_end, text, hash FROM chunks ORDER BY rowid",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Chunk {
            id: row.get("id"),
            source_document: row.get("source_document"),
            position: row.get::<i64, _>("position") as usize,
            char_start: row.get::<i64, _>("char_start") as usize,
            char_end: row.get::<i64, _>("char_end") as usize,
            text: row.get("text"),
            hash: row.get("hash"),
        })
        .collect())
}

pub async fn load_dense_rows(pool: &SqlitePool) -> Result<Vec<DenseRow>> {
    let rows = sqlx::query("SELECT chunk_id, source_document, vector FROM embeddings ORDER BY rowid")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("vector");
            DenseRow {
                chunk_id: row.get("chunk_id"),
                source_document: row.get("source_document"),
                vector: blob_to_vec(&blob),
            }
        })
        .collect())
}

/// `None` when no index has been built yet.
pub async fn load_meta(pool: &SqlitePool) -> Result<Option<IndexMeta>> {
    let rows = sqlx::query("SELECT key, value FROM index_meta")
        .fetch_all(pool)
        .await?;
    if rows.is_empty() {
        return Ok(None);
    }

    let mut model = None;
    let mut dims = None;
    let mut built_at = None;
    for row in &rows {
        let key: String = row.get("key");
        let value: String = row.get("value");
        match key.as_str() {
            "model" => model = Some(value),
            "dims" => dims = value.parse::<usize>().ok(),
            "built_at" => {
                built_at = DateTime::parse_from_rfc3339(&value)
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            }
            _ => {}
        }
    }

    match (model, dims, built_at) {
        (Some(model), Some(dims), Some(built_at)) => Ok(Some(IndexMeta {
            model,
            dims,
            built_at,
        })),
        _ => bail!("Stored index metadata is incomplete; rebuild with `shx index`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::db;
    use tempfile::TempDir;

    fn chunk(id: &str, doc: &str, position: usize, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            source_document: doc.to_string(),
            position,
            char_start: 0,
            char_end: text.chars().count(),
            hash: "h".to_string(),
        }
    }

    fn row(id: &str, doc: &str, vector: Vec<f32>) -> DenseRow {
        DenseRow {
            chunk_id: id.to_string(),
            source_document: doc.to_string(),
            vector,
        }
    }

    #[tokio::test]
    async fn test_save_and_load_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&DbConfig {
            path: tmp.path().join("data/index.sqlite"),
        })
        .await
        .unwrap();

        assert!(load_meta(&pool).await.unwrap().is_none());

        let chunks = vec![
            chunk("zeta#0", "zeta", 0, "last alphabetically"),
            chunk("alpha#0", "alpha", 0, "first alphabetically"),
        ];
        let rows = vec![
            row("zeta#0", "zeta", vec![0.5, 0.25]),
            row("alpha#0", "alpha", vec![1.0, -1.0]),
        ];
        save_index(&pool, &chunks, &rows, "hash-v1", 2).await.unwrap();

        assert_eq!(load_chunks(&pool).await.unwrap(), chunks);
        assert_eq!(load_dense_rows(&pool).await.unwrap(), rows);

        let meta = load_meta(&pool).await.unwrap().unwrap();
        assert_eq!(meta.model, "hash-v1");
        assert_eq!(meta.dims, 2);
    }

    #[tokio::test]
    async fn test_save_replaces_previous_index() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&DbConfig {
            path: tmp.path().join("index.sqlite"),
        })
        .await
        .unwrap();

        save_index(&pool, &[chunk("a#0", "a", 0, "old")], &[row("a#0", "a", vec![1.0])], "m", 1)
            .await
            .unwrap();
        save_index(&pool, &[chunk("b#0", "b", 0, "new")], &[row("b#0", "b", vec![2.0])], "m", 1)
            .await
            .unwrap();

        let chunks = load_chunks(&pool).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "b#0");
    }

    #[tokio::test]
    async fn test_mismatched_rows_rejected() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&DbConfig {
            path: tmp.path().join("index.sqlite"),
        })
        .await
        .unwrap();

        let result = save_index(&pool, &[chunk("a#0", "a", 0, "text")], &[], "m", 1).await;
        assert!(result.is_err());
    }
}
