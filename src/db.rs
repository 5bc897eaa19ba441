use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::models::{
    AnswerOutcome, Chunk, Document, DocumentStats, DocumentStatus, NewDocument, NewQueryRecord,
    QueryRecord,
};

const DOCUMENT_COLUMNS: &str = "id, filename, content_hash, file_size, title, author, page_count, status, status_message, uploaded_at, processed_at";
const CHUNK_COLUMNS: &str = "c.id, c.document_id, c.ordinal, c.content, c.page, c.start_char, c.end_char";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        Self::connect(&config.database_url, 10).await
    }

    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Private in-memory database. A single connection that is never recycled
    /// keeps the schema alive for the whole test.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                title TEXT,
                author TEXT,
                page_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                status_message TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                uploaded_at TEXT NOT NULL,
                processed_at TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS documents_live_hash
                ON documents (content_hash)
                WHERE deleted = 0 AND status != 'failed';

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id INTEGER NOT NULL,
                ordinal INTEGER NOT NULL,
                content TEXT NOT NULL,
                page INTEGER,
                start_char INTEGER NOT NULL,
                end_char INTEGER NOT NULL,
                UNIQUE (document_id, ordinal),
                FOREIGN KEY (document_id) REFERENCES documents(id)
            );

            CREATE TABLE IF NOT EXISTS query_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                outcome TEXT NOT NULL,
                confidence REAL NOT NULL,
                sources TEXT NOT NULL,
                retrieved_chunks INTEGER NOT NULL,
                response_time_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts a document in the `processing` state. The partial unique index
    /// on `content_hash` makes this the atomic duplicate check.
    pub async fn reserve_document(&self, doc: &NewDocument) -> Result<Document> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO documents (filename, content_hash, file_size, title, author, page_count, status, uploaded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.filename)
        .bind(&doc.content_hash)
        .bind(doc.file_size)
        .bind(&doc.title)
        .bind(&doc.author)
        .bind(doc.page_count)
        .bind(DocumentStatus::Processing.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(result) => self.get_document(result.last_insert_rowid()).await,
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                let existing = self.find_live_document_by_hash(&doc.content_hash).await?;
                Err(AppError::DuplicateDocument {
                    existing_id: existing.map(|d| d.id).unwrap_or_default(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn find_live_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE content_hash = ? AND deleted = 0 AND status != 'failed'"
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_document))
    }

    pub async fn get_document(&self, id: i64) -> Result<Document> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ? AND deleted = 0"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_document)
            .ok_or_else(|| AppError::NotFound(format!("document {id}")))
    }

    /// Non-deleted documents, newest first.
    pub async fn list_documents(&self, offset: i64, limit: i64) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE deleted = 0 ORDER BY id DESC LIMIT ? OFFSET ?"
        ))
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_document).collect())
    }

    pub async fn count_documents(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM documents WHERE deleted = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Stores chunk rows and flips the document to `ready` in one transaction.
    pub async fn complete_document(&self, id: i64, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            insert_chunk_tx(&mut tx, chunk).await?;
        }

        let updated = sqlx::query(
            r#"
            UPDATE documents
            SET status = ?, status_message = NULL, processed_at = ?
            WHERE id = ? AND deleted = 0
            "#,
        )
        .bind(DocumentStatus::Ready.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("document {id}")));
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn fail_document(&self, id: i64, message: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE documents SET status = ?, status_message = ?, processed_at = ? WHERE id = ?",
        )
        .bind(DocumentStatus::Failed.as_str())
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Marks every document still `processing` as failed and drops its chunk
    /// rows. Only safe before any ingest has started in this process.
    pub async fn fail_interrupted_documents(&self, message: &str) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM documents WHERE status = ? AND deleted = 0")
                .bind(DocumentStatus::Processing.as_str())
                .fetch_all(&mut *tx)
                .await?;

        for &id in &ids {
            sqlx::query("DELETE FROM chunks WHERE document_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE documents SET status = ?, status_message = ?, processed_at = ? WHERE id = ?",
            )
            .bind(DocumentStatus::Failed.as_str())
            .bind(message)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Removes the document's chunk rows and flags the document deleted.
    /// Unknown and already-deleted ids are `NotFound`.
    pub async fn delete_document(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let flagged = sqlx::query("UPDATE documents SET deleted = 1 WHERE id = ? AND deleted = 0")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if flagged.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("document {id}")));
        }

        let removed = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!(
            "deleted document {} ({} chunk rows)",
            id,
            removed.rows_affected()
        );
        Ok(())
    }

    pub async fn document_stats(&self, id: i64) -> Result<DocumentStats> {
        let document = self.get_document(id).await?;
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS chunk_count, COALESCE(MAX(end_char), 0) AS total_characters
            FROM chunks
            WHERE document_id = ?
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(DocumentStats {
            document_id: document.id,
            filename: document.filename,
            status: document.status,
            chunk_count: row.get("chunk_count"),
            page_count: document.page_count,
            file_size: document.file_size,
            total_characters: row.get("total_characters"),
            uploaded_at: document.uploaded_at,
            vector_count: None,
        })
    }

    pub async fn chunks_for_document(&self, document_id: i64) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.document_id = ? ORDER BY c.ordinal ASC"
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    /// Chunks (with their document's filename) that belong to ready,
    /// non-deleted documents, in the order of `ids`. Unknown ids are dropped.
    pub async fn live_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<(Chunk, String)>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {CHUNK_COLUMNS}, d.filename FROM chunks c JOIN documents d ON d.id = c.document_id WHERE d.deleted = 0 AND d.status = 'ready' AND c.id IN ("
        ));
        let mut separated = qb.separated(",");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<SqliteRow> = qb.build().fetch_all(&self.pool).await?;
        let mut chunks: Vec<(Chunk, String)> = rows
            .into_iter()
            .map(|row| {
                let filename: String = row.get("filename");
                (row_to_chunk(row), filename)
            })
            .collect();

        chunks.sort_by_key(|(chunk, _)| {
            ids.iter()
                .position(|id| id == &chunk.id)
                .unwrap_or(usize::MAX)
        });

        Ok(chunks)
    }

    pub async fn insert_query_record(&self, record: &NewQueryRecord) -> Result<i64> {
        let sources = serde_json::to_string(&record.sources)?;
        let result = sqlx::query(
            r#"
            INSERT INTO query_history (question, answer, outcome, confidence, sources, retrieved_chunks, response_time_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.question)
        .bind(&record.answer)
        .bind(record.outcome.as_str())
        .bind(record.confidence)
        .bind(sources)
        .bind(record.retrieved_chunks)
        .bind(record.response_time_ms)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent query records first.
    pub async fn list_query_records(&self, limit: i64) -> Result<Vec<QueryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, question, answer, outcome, confidence, sources, retrieved_chunks, response_time_ms, created_at
            FROM query_history
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_query_record).collect()
    }

    pub async fn get_query_record(&self, id: i64) -> Result<QueryRecord> {
        let row = sqlx::query(
            r#"
            SELECT id, question, answer, outcome, confidence, sources, retrieved_chunks, response_time_ms, created_at
            FROM query_history
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_query_record(row),
            None => Err(AppError::NotFound(format!("query {id}"))),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn insert_chunk_tx(tx: &mut Transaction<'_, Sqlite>, chunk: &Chunk) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chunks (id, document_id, ordinal, content, page, start_char, end_char)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&chunk.id)
    .bind(chunk.document_id)
    .bind(chunk.ordinal)
    .bind(&chunk.content)
    .bind(chunk.page)
    .bind(chunk.start_char)
    .bind(chunk.end_char)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_document(row: SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        filename: row.get("filename"),
        content_hash: row.get("content_hash"),
        file_size: row.get("file_size"),
        title: row.get("title"),
        author: row.get("author"),
        page_count: row.get("page_count"),
        status: DocumentStatus::from_db(&row.get::<String, _>("status")),
        status_message: row.get("status_message"),
        uploaded_at: parse_timestamp(&row.get::<String, _>("uploaded_at")),
        processed_at: row
            .get::<Option<String>, _>("processed_at")
            .map(|raw| parse_timestamp(&raw)),
    }
}

fn row_to_chunk(row: SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        ordinal: row.get("ordinal"),
        content: row.get("content"),
        page: row.get("page"),
        start_char: row.get("start_char"),
        end_char: row.get("end_char"),
    }
}

fn row_to_query_record(row: SqliteRow) -> Result<QueryRecord> {
    Ok(QueryRecord {
        id: row.get("id"),
        question: row.get("question"),
        answer: row.get("answer"),
        outcome: AnswerOutcome::from_db(&row.get::<String, _>("outcome")),
        confidence: row.get::<f64, _>("confidence") as f32,
        sources: serde_json::from_str(&row.get::<String, _>("sources"))?,
        retrieved_chunks: row.get("retrieved_chunks"),
        response_time_ms: row.get("response_time_ms"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceAttribution;

    fn new_document(name: &str, hash: &str) -> NewDocument {
        NewDocument {
            filename: name.to_string(),
            content_hash: hash.to_string(),
            file_size: 2048,
            title: Some("Policy".to_string()),
            author: None,
            page_count: 3,
        }
    }

    fn chunks_for(document_id: i64, count: i64) -> Vec<Chunk> {
        (0..count)
            .map(|ordinal| Chunk {
                id: Chunk::derive_id(document_id, ordinal),
                document_id,
                ordinal,
                content: format!("chunk {ordinal} of {document_id}"),
                page: Some(1 + ordinal / 4),
                start_char: ordinal * 100,
                end_char: ordinal * 100 + 120,
            })
            .collect()
    }

    #[tokio::test]
    async fn reserve_then_complete_makes_document_ready() {
        let db = Database::in_memory().await.unwrap();
        let doc = db.reserve_document(&new_document("a.pdf", "h1")).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Processing);
        assert!(doc.processed_at.is_none());

        db.complete_document(doc.id, &chunks_for(doc.id, 3)).await.unwrap();

        let doc = db.get_document(doc.id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
        assert!(doc.processed_at.is_some());

        let chunks = db.chunks_for_document(doc.id).await.unwrap();
        let ordinals: Vec<i64> = chunks.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn duplicate_hash_is_rejected_with_existing_id() {
        let db = Database::in_memory().await.unwrap();
        let first = db.reserve_document(&new_document("a.pdf", "same")).await.unwrap();

        let err = db
            .reserve_document(&new_document("copy.pdf", "same"))
            .await
            .unwrap_err();
        match err {
            AppError::DuplicateDocument { existing_id } => assert_eq!(existing_id, first.id),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(db.count_documents().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_and_deleted_documents_release_their_hash() {
        let db = Database::in_memory().await.unwrap();
        let failed = db.reserve_document(&new_document("a.pdf", "h")).await.unwrap();
        db.fail_document(failed.id, "embedding service down").await.unwrap();

        let retried = db.reserve_document(&new_document("a.pdf", "h")).await.unwrap();
        db.complete_document(retried.id, &chunks_for(retried.id, 1))
            .await
            .unwrap();
        db.delete_document(retried.id).await.unwrap();

        let again = db.reserve_document(&new_document("a.pdf", "h")).await.unwrap();
        assert_ne!(again.id, retried.id);
    }

    #[tokio::test]
    async fn interrupted_documents_are_failed_and_release_their_hash() {
        let db = Database::in_memory().await.unwrap();
        let ready = db.reserve_document(&new_document("done.pdf", "h1")).await.unwrap();
        db.complete_document(ready.id, &chunks_for(ready.id, 2)).await.unwrap();
        let stuck = db.reserve_document(&new_document("stuck.pdf", "h2")).await.unwrap();

        let failed = db.fail_interrupted_documents("interrupted").await.unwrap();
        assert_eq!(failed, vec![stuck.id]);

        let stuck = db.get_document(stuck.id).await.unwrap();
        assert_eq!(stuck.status, DocumentStatus::Failed);
        assert_eq!(stuck.status_message.as_deref(), Some("interrupted"));
        assert_eq!(
            db.get_document(ready.id).await.unwrap().status,
            DocumentStatus::Ready
        );
        assert!(db.find_live_document_by_hash("h2").await.unwrap().is_none());
        assert!(db.fail_interrupted_documents("interrupted").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_cascades_to_chunks() {
        let db = Database::in_memory().await.unwrap();
        let doc = db.reserve_document(&new_document("seven.pdf", "h7")).await.unwrap();
        let chunks = chunks_for(doc.id, 12);
        db.complete_document(doc.id, &chunks).await.unwrap();

        db.delete_document(doc.id).await.unwrap();

        assert!(db.chunks_for_document(doc.id).await.unwrap().is_empty());
        assert!(matches!(
            db.get_document(doc.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(db.list_documents(0, 10).await.unwrap().is_empty());

        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        assert!(db.live_chunks_by_ids(&ids).await.unwrap().is_empty());

        assert!(matches!(
            db.delete_document(doc.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            db.delete_document(9999).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn live_chunks_skip_unready_documents_and_keep_order() {
        let db = Database::in_memory().await.unwrap();
        let ready = db.reserve_document(&new_document("r.pdf", "r")).await.unwrap();
        db.complete_document(ready.id, &chunks_for(ready.id, 2)).await.unwrap();
        let pending = db.reserve_document(&new_document("p.pdf", "p")).await.unwrap();

        let wanted = vec![
            Chunk::derive_id(ready.id, 1),
            Chunk::derive_id(pending.id, 0),
            Chunk::derive_id(ready.id, 0),
        ];
        let found = db.live_chunks_by_ids(&wanted).await.unwrap();

        let got: Vec<(i64, &str)> = found
            .iter()
            .map(|(chunk, filename)| (chunk.ordinal, filename.as_str()))
            .collect();
        assert_eq!(got, vec![(1, "r.pdf"), (0, "r.pdf")]);
    }

    #[tokio::test]
    async fn documents_are_listed_newest_first_with_paging() {
        let db = Database::in_memory().await.unwrap();
        for n in 0..5 {
            db.reserve_document(&new_document(&format!("{n}.pdf"), &format!("h{n}")))
                .await
                .unwrap();
        }

        let page = db.list_documents(1, 2).await.unwrap();
        let names: Vec<&str> = page.iter().map(|d| d.filename.as_str()).collect();
        assert_eq!(names, vec!["3.pdf", "2.pdf"]);
        assert_eq!(db.count_documents().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn stats_report_chunk_and_character_counts() {
        let db = Database::in_memory().await.unwrap();
        let doc = db.reserve_document(&new_document("s.pdf", "s")).await.unwrap();
        db.complete_document(doc.id, &chunks_for(doc.id, 4)).await.unwrap();

        let stats = db.document_stats(doc.id).await.unwrap();
        assert_eq!(stats.chunk_count, 4);
        assert_eq!(stats.page_count, 3);
        assert_eq!(stats.file_size, 2048);
        assert_eq!(stats.total_characters, 420);
        assert_eq!(stats.vector_count, None);
    }

    #[tokio::test]
    async fn query_history_round_trips_sources() {
        let db = Database::in_memory().await.unwrap();
        let source = SourceAttribution {
            source_id: 1,
            chunk_id: "c".to_string(),
            document_id: 1,
            filename: "policy.pdf".to_string(),
            page: Some(2),
            ordinal: 0,
            score: 0.9,
            snippet: "Refunds are issued".to_string(),
        };
        let first = db
            .insert_query_record(&NewQueryRecord {
                question: "What is the refund window?".to_string(),
                answer: "30 days [Source 1]".to_string(),
                outcome: AnswerOutcome::Answered,
                confidence: 0.85,
                sources: vec![source],
                retrieved_chunks: 1,
                response_time_ms: 420,
            })
            .await
            .unwrap();
        let second = db
            .insert_query_record(&NewQueryRecord {
                question: "Who won?".to_string(),
                answer: "no context".to_string(),
                outcome: AnswerOutcome::NoContext,
                confidence: 0.0,
                sources: vec![],
                retrieved_chunks: 0,
                response_time_ms: 12,
            })
            .await
            .unwrap();

        let records = db.list_query_records(10).await.unwrap();
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second, first]);

        let record = db.get_query_record(first).await.unwrap();
        assert_eq!(record.outcome, AnswerOutcome::Answered);
        assert_eq!(record.sources.len(), 1);
        assert_eq!(record.sources[0].page, Some(2));
        assert!((record.confidence - 0.85).abs() < 1e-6);

        assert!(matches!(
            db.get_query_record(12345).await,
            Err(AppError::NotFound(_))
        ));
    }
}
