//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding per-user state:
//! query lines and their queries, the versioned knowledge record, interaction
//! history, the recommendation run audit trail, and the extracted-content cache.
//!
//! **Access rules:**
//! - The pipeline: read-write via [`Storage::open`]
//! - Inspection commands: read-only via [`Storage::open_readonly`]

mod migrations;

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use learnline_shared::{
    ExtractedDocument, Interaction, InteractionKind, KnowledgeState, LearnlineError, LineId,
    Query, QueryLine, Result, RunOutcome,
};
use libsql::{Connection, Database, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LearnlineError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LearnlineError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LearnlineError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    /// Create the user record on first sight. No-op for known users.
    pub async fn ensure_user(&self, user_id: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO users (id, created_at) VALUES (?1, ?2)
                 ON CONFLICT(id) DO NOTHING",
                params![user_id, now.as_str()],
            )
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Query lines
    // -----------------------------------------------------------------------

    /// Save a line and append any of its queries not yet stored.
    ///
    /// The write only lands if the stored line is still at `line.version`
    /// (`0` for a line never saved); otherwise another writer got there first
    /// and [`LearnlineError::Conflict`] is returned with nothing written. The
    /// row and its queries are written in one transaction. On success the
    /// line's version is bumped. Stored queries are never rewritten.
    pub async fn save_line(&self, line: &mut QueryLine) -> Result<()> {
        self.check_writable()?;
        let next = line.version + 1;

        let mut value =
            serde_json::to_value(&*line).map_err(|e| LearnlineError::Storage(e.to_string()))?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("queries");
            obj.insert("version".into(), next.into());
        }
        let data_json = value.to_string();

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;
        if let Err(e) = write_line(&tx, line, &data_json, next).await {
            tx.rollback()
                .await
                .map_err(|e| LearnlineError::Storage(e.to_string()))?;
            return Err(e);
        }
        tx.commit()
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        line.version = next;
        Ok(())
    }

    /// Get a line with all of its queries.
    pub async fn get_line(&self, line_id: &LineId) -> Result<Option<QueryLine>> {
        let mut rows = self
            .conn
            .query(
                "SELECT data_json, active, version FROM query_lines WHERE id = ?1",
                params![line_id.to_string()],
            )
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        let line = match rows.next().await {
            Ok(Some(row)) => row_to_line(&row)?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(LearnlineError::Storage(e.to_string())),
        };
        Ok(Some(self.with_queries(line).await?))
    }

    /// List a user's lines, most recently active first.
    pub async fn list_lines(
        &self,
        user_id: &str,
        limit: usize,
        include_inactive: bool,
    ) -> Result<Vec<QueryLine>> {
        let mut rows = self
            .conn
            .query(
                "SELECT data_json, active, version FROM query_lines
                 WHERE user_id = ?1 AND (active = 1 OR ?2 = 1)
                 ORDER BY last_active_at DESC
                 LIMIT ?3",
                params![user_id, i64::from(include_inactive), limit as i64],
            )
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        let mut lines = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            lines.push(row_to_line(&row)?);
        }

        let mut results = Vec::with_capacity(lines.len());
        for line in lines {
            results.push(self.with_queries(line).await?);
        }
        Ok(results)
    }

    async fn with_queries(&self, mut line: QueryLine) -> Result<QueryLine> {
        let mut rows = self
            .conn
            .query(
                "SELECT text, response, citations_json, asked_at FROM queries
                 WHERE line_id = ?1 ORDER BY seq",
                params![line.id.to_string()],
            )
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        line.queries.clear();
        while let Ok(Some(row)) = rows.next().await {
            let citations: String = row
                .get(2)
                .map_err(|e| LearnlineError::Storage(e.to_string()))?;
            let asked_at: String = row
                .get(3)
                .map_err(|e| LearnlineError::Storage(e.to_string()))?;
            line.queries.push(Query {
                text: row
                    .get::<String>(0)
                    .map_err(|e| LearnlineError::Storage(e.to_string()))?,
                response: row
                    .get::<String>(1)
                    .map_err(|e| LearnlineError::Storage(e.to_string()))?,
                citations: serde_json::from_str(&citations).unwrap_or_default(),
                asked_at: parse_time(&asked_at)?,
            });
        }
        Ok(line)
    }

    /// Mark a line active or inactive. Returns `false` if the user owns no such line.
    pub async fn set_line_active(
        &self,
        user_id: &str,
        line_id: &LineId,
        active: bool,
    ) -> Result<bool> {
        self.check_writable()?;
        let Some(mut line) = self.get_line(line_id).await? else {
            return Ok(false);
        };
        if line.user_id != user_id {
            return Ok(false);
        }
        line.active = active;
        self.save_line(&mut line).await?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Knowledge state
    // -----------------------------------------------------------------------

    /// Load a user's knowledge state, or an empty version-0 state.
    pub async fn load_knowledge(&self, user_id: &str) -> Result<KnowledgeState> {
        let mut rows = self
            .conn
            .query(
                "SELECT data_json FROM knowledge_state WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row
                    .get(0)
                    .map_err(|e| LearnlineError::Storage(e.to_string()))?;
                serde_json::from_str(&json).map_err(|e| {
                    LearnlineError::Storage(format!("corrupt knowledge state for {user_id}: {e}"))
                })
            }
            Ok(None) => Ok(KnowledgeState::empty(user_id)),
            Err(e) => Err(LearnlineError::Storage(e.to_string())),
        }
    }

    /// Persist `state` if the stored version still equals `expected_version`.
    ///
    /// Returns [`LearnlineError::Conflict`] when another writer got there first.
    pub async fn save_knowledge(&self, state: &KnowledgeState, expected_version: u64) -> Result<()> {
        self.check_writable()?;
        if state.version == expected_version {
            return Ok(());
        }

        let json =
            serde_json::to_string(state).map_err(|e| LearnlineError::Storage(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        let affected = if expected_version == 0 {
            self.conn
                .execute(
                    "INSERT INTO knowledge_state (user_id, version, data_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(user_id) DO NOTHING",
                    params![state.user_id.as_str(), state.version as i64, json, now.as_str()],
                )
                .await
        } else {
            self.conn
                .execute(
                    "UPDATE knowledge_state SET version = ?1, data_json = ?2, updated_at = ?3
                     WHERE user_id = ?4 AND version = ?5",
                    params![
                        state.version as i64,
                        json,
                        now.as_str(),
                        state.user_id.as_str(),
                        expected_version as i64
                    ],
                )
                .await
        }
        .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        if affected == 0 {
            return Err(LearnlineError::Conflict(format!(
                "knowledge state for {} changed since version {expected_version}",
                state.user_id
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Interactions
    // -----------------------------------------------------------------------

    /// Record one interaction.
    pub async fn insert_interaction(&self, interaction: &Interaction) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let payload = serde_json::to_string(&interaction.kind)
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO interactions (id, user_id, content_id, interaction_type, payload_json, occurred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    interaction.user_id.as_str(),
                    interaction.content_id.as_str(),
                    interaction.kind.name(),
                    payload,
                    interaction.timestamp.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;
        Ok(id)
    }

    /// Most recent interactions for a user, oldest first.
    pub async fn list_interactions(&self, user_id: &str, limit: usize) -> Result<Vec<Interaction>> {
        let mut rows = self
            .conn
            .query(
                "SELECT user_id, content_id, payload_json, occurred_at FROM (
                    SELECT * FROM interactions WHERE user_id = ?1
                    ORDER BY occurred_at DESC LIMIT ?2
                 ) ORDER BY occurred_at ASC",
                params![user_id, limit as i64],
            )
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_interaction(&row)?);
        }
        Ok(results)
    }

    /// All interactions a user had with one piece of content, oldest first.
    pub async fn list_content_interactions(
        &self,
        user_id: &str,
        content_id: &str,
    ) -> Result<Vec<Interaction>> {
        let mut rows = self
            .conn
            .query(
                "SELECT user_id, content_id, payload_json, occurred_at FROM interactions
                 WHERE user_id = ?1 AND content_id = ?2 ORDER BY occurred_at ASC",
                params![user_id, content_id],
            )
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_interaction(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Recommendation runs
    // -----------------------------------------------------------------------

    /// Append a terminal run to the audit trail.
    pub async fn record_run(
        &self,
        user_id: &str,
        query: &str,
        knowledge_version: u64,
        outcome: &RunOutcome,
    ) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let (line_id, label) = match outcome {
            RunOutcome::RecommendationsReady(result) => (result.line_id, "recommendations_ready"),
            RunOutcome::Exhausted(report) => (report.line_id, "exhausted"),
        };
        let json =
            serde_json::to_string(outcome).map_err(|e| LearnlineError::Storage(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO recommendation_runs (id, user_id, line_id, query, outcome, knowledge_version, result_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.as_str(),
                    user_id,
                    line_id.to_string(),
                    query,
                    label,
                    knowledge_version as i64,
                    json,
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;
        Ok(id)
    }

    /// Content ids recommended to `user_id` on any of `line_ids`.
    pub async fn recommended_content(
        &self,
        user_id: &str,
        line_ids: &[LineId],
    ) -> Result<HashSet<String>> {
        let mut content = HashSet::new();
        for line_id in line_ids {
            let mut rows = self
                .conn
                .query(
                    "SELECT result_json FROM recommendation_runs
                     WHERE user_id = ?1 AND line_id = ?2 AND outcome = 'recommendations_ready'",
                    params![user_id, line_id.to_string()],
                )
                .await
                .map_err(|e| LearnlineError::Storage(e.to_string()))?;

            while let Ok(Some(row)) = rows.next().await {
                let json: String = row
                    .get(0)
                    .map_err(|e| LearnlineError::Storage(e.to_string()))?;
                let outcome: RunOutcome = serde_json::from_str(&json)
                    .map_err(|e| LearnlineError::Storage(format!("corrupt run record: {e}")))?;
                if let RunOutcome::RecommendationsReady(result) = outcome {
                    content.extend(result.recommendations.into_iter().map(|r| r.content_id));
                }
            }
        }
        Ok(content)
    }

    /// A user's most recent runs, newest first.
    pub async fn list_runs(&self, user_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, user_id, query, knowledge_version, result_json, created_at
                 FROM recommendation_runs WHERE user_id = ?1
                 ORDER BY created_at DESC LIMIT ?2",
                params![user_id, limit as i64],
            )
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let json: String = row
                .get(4)
                .map_err(|e| LearnlineError::Storage(e.to_string()))?;
            let created_at: String = row
                .get(5)
                .map_err(|e| LearnlineError::Storage(e.to_string()))?;
            results.push(RunRecord {
                id: row
                    .get::<String>(0)
                    .map_err(|e| LearnlineError::Storage(e.to_string()))?,
                user_id: row
                    .get::<String>(1)
                    .map_err(|e| LearnlineError::Storage(e.to_string()))?,
                query: row
                    .get::<String>(2)
                    .map_err(|e| LearnlineError::Storage(e.to_string()))?,
                knowledge_version: row.get::<i64>(3).unwrap_or(0) as u64,
                outcome: serde_json::from_str(&json)
                    .map_err(|e| LearnlineError::Storage(format!("corrupt run record: {e}")))?,
                created_at: parse_time(&created_at)?,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Content cache
    // -----------------------------------------------------------------------

    /// Get an extracted document no older than `max_age`.
    pub async fn get_cached_content(
        &self,
        content_id: &str,
        max_age: chrono::Duration,
    ) -> Result<Option<CachedContent>> {
        let mut rows = self
            .conn
            .query(
                "SELECT url, document_json, extracted_at FROM content_cache WHERE content_id = ?1",
                params![content_id],
            )
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let extracted_at: String = row
                    .get(2)
                    .map_err(|e| LearnlineError::Storage(e.to_string()))?;
                let extracted_at = parse_time(&extracted_at)?;
                if Utc::now() - extracted_at > max_age {
                    return Ok(None);
                }
                let json: String = row
                    .get(1)
                    .map_err(|e| LearnlineError::Storage(e.to_string()))?;
                Ok(Some(CachedContent {
                    content_id: content_id.to_string(),
                    url: row
                        .get::<String>(0)
                        .map_err(|e| LearnlineError::Storage(e.to_string()))?,
                    document: serde_json::from_str(&json)
                        .map_err(|e| LearnlineError::Storage(e.to_string()))?,
                    extracted_at,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(LearnlineError::Storage(e.to_string())),
        }
    }

    /// Store an extracted document in the cache (upserts).
    pub async fn put_cached_content(
        &self,
        content_id: &str,
        url: &str,
        document: &ExtractedDocument,
    ) -> Result<()> {
        self.check_writable()?;
        let json =
            serde_json::to_string(document).map_err(|e| LearnlineError::Storage(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO content_cache (content_id, url, document_json, extracted_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(content_id) DO UPDATE SET
                   url = excluded.url,
                   document_json = excluded.document_json,
                   extracted_at = excluded.extracted_at",
                params![content_id, url, json, now.as_str()],
            )
            .await
            .map_err(|e| LearnlineError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// One entry of the recommendation audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub user_id: String,
    pub query: String,
    pub knowledge_version: u64,
    pub outcome: RunOutcome,
    pub created_at: DateTime<Utc>,
}

/// A cached extraction result.
#[derive(Debug, Clone)]
pub struct CachedContent {
    pub content_id: String,
    pub url: String,
    pub document: ExtractedDocument,
    pub extracted_at: DateTime<Utc>,
}

/// Convert a `(data_json, active)` row to a [`QueryLine`] without its queries.
fn row_to_line(row: &libsql::Row) -> Result<QueryLine> {
    let json: String = row
        .get(0)
        .map_err(|e| LearnlineError::Storage(e.to_string()))?;
    let mut line: QueryLine = serde_json::from_str(&json)
        .map_err(|e| LearnlineError::Storage(format!("corrupt query line: {e}")))?;
    line.active = row.get::<i64>(1).unwrap_or(1) != 0;
    line.version = row.get::<i64>(2).unwrap_or(0) as u64;
    Ok(line)
}

/// Write a line row at version `next` plus its unsaved queries, inside `conn`'s
/// open transaction.
async fn write_line(conn: &Connection, line: &QueryLine, data_json: &str, next: u64) -> Result<()> {
    let goal =
        serde_json::to_value(line.goal).map_err(|e| LearnlineError::Storage(e.to_string()))?;
    let goal = goal.as_str().unwrap_or("general");

    let written = if line.version == 0 {
        conn.execute(
            "INSERT INTO query_lines (id, user_id, goal, refined_topic, data_json, active, created_at, last_active_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO NOTHING",
            params![
                line.id.to_string(),
                line.user_id.as_str(),
                goal,
                line.refined_topic.as_str(),
                data_json,
                i64::from(line.active),
                line.created_at.to_rfc3339(),
                line.last_active_at.to_rfc3339(),
                next as i64,
            ],
        )
        .await
    } else {
        conn.execute(
            "UPDATE query_lines SET
               goal = ?1,
               refined_topic = ?2,
               data_json = ?3,
               active = ?4,
               last_active_at = ?5,
               version = ?6
             WHERE id = ?7 AND version = ?8",
            params![
                goal,
                line.refined_topic.as_str(),
                data_json,
                i64::from(line.active),
                line.last_active_at.to_rfc3339(),
                next as i64,
                line.id.to_string(),
                line.version as i64,
            ],
        )
        .await
    };
    let written = written.map_err(|e| LearnlineError::Storage(e.to_string()))?;

    if written == 0 {
        return Err(LearnlineError::Conflict(format!(
            "query line {} changed since version {}",
            line.id, line.version
        )));
    }

    for (seq, query) in line.queries.iter().enumerate() {
        insert_query(conn, &line.id, &line.user_id, seq, query).await?;
    }
    Ok(())
}

async fn insert_query(
    conn: &Connection,
    line_id: &LineId,
    user_id: &str,
    seq: usize,
    query: &Query,
) -> Result<()> {
    let citations = serde_json::to_string(&query.citations)
        .map_err(|e| LearnlineError::Storage(e.to_string()))?;
    conn.execute(
        "INSERT INTO queries (line_id, seq, user_id, text, response, citations_json, asked_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(line_id, seq) DO NOTHING",
        params![
            line_id.to_string(),
            seq as i64,
            user_id,
            query.text.as_str(),
            query.response.as_str(),
            citations,
            query.asked_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| LearnlineError::Storage(e.to_string()))?;
    Ok(())
}

/// Convert a `(user_id, content_id, payload_json, occurred_at)` row to an [`Interaction`].
fn row_to_interaction(row: &libsql::Row) -> Result<Interaction> {
    let payload: String = row
        .get(2)
        .map_err(|e| LearnlineError::Storage(e.to_string()))?;
    let kind: InteractionKind = serde_json::from_str(&payload)
        .map_err(|e| LearnlineError::Storage(format!("corrupt interaction: {e}")))?;
    let occurred_at: String = row
        .get(3)
        .map_err(|e| LearnlineError::Storage(e.to_string()))?;
    Ok(Interaction {
        user_id: row
            .get::<String>(0)
            .map_err(|e| LearnlineError::Storage(e.to_string()))?,
        content_id: row
            .get::<String>(1)
            .map_err(|e| LearnlineError::Storage(e.to_string()))?,
        kind,
        timestamp: parse_time(&occurred_at)?,
    })
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LearnlineError::Storage(format!("invalid date: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use learnline_shared::{
        ConceptChange, ContentMetadata, ContentSection, ExhaustedReport, GoalFrame,
        KnowledgeDelta, LineAnalysis, Suggestions,
    };

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("ll_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn sample_line(user: &str) -> QueryLine {
        let mut line = QueryLine::open(user, GoalFrame::MarketPosition, Utc::now());
        line.refined_topic = "nvidia".into();
        line.inferred_goal = "understand nvidia's market position".into();
        line.queries.push(Query {
            text: "what's NVIDIA's market share?".into(),
            response: "NVIDIA holds roughly 80% of the AI accelerator market.".into(),
            citations: vec!["https://example.com/share".into()],
            asked_at: Utc::now(),
        });
        line
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("ll_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 3);
    }

    #[tokio::test]
    async fn line_roundtrip_keeps_queries_append_only() {
        let storage = test_storage().await;
        storage.ensure_user("u1").await.unwrap();

        let mut line = sample_line("u1");
        storage.save_line(&mut line).await.expect("save line");
        assert_eq!(line.version, 1);

        // A rewritten first query must not replace the recorded one.
        line.queries[0].response = "rewritten".into();
        line.queries.push(Query {
            text: "how are cloud providers affecting chip demand?".into(),
            response: "Hyperscalers buy most accelerators.".into(),
            citations: vec![],
            asked_at: Utc::now(),
        });
        storage.save_line(&mut line).await.expect("save again");

        let loaded = storage.get_line(&line.id).await.unwrap().expect("line exists");
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.queries.len(), 2);
        assert!(loaded.queries[0].response.contains("80%"));
        assert_eq!(loaded.queries[0].citations.len(), 1);
        assert_eq!(loaded.goal, GoalFrame::MarketPosition);
    }

    #[tokio::test]
    async fn deactivated_lines_are_hidden_by_default() {
        let storage = test_storage().await;
        storage.ensure_user("u1").await.unwrap();
        let mut line = sample_line("u1");
        storage.save_line(&mut line).await.unwrap();

        assert!(storage.set_line_active("u1", &line.id, false).await.unwrap());
        assert!(!storage.set_line_active("someone-else", &line.id, true).await.unwrap());

        assert!(storage.list_lines("u1", 10, false).await.unwrap().is_empty());
        let all = storage.list_lines("u1", 10, true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].active);
    }

    #[tokio::test]
    async fn stale_line_writes_conflict() {
        let storage = test_storage().await;
        storage.ensure_user("u1").await.unwrap();
        let mut line = sample_line("u1");
        storage.save_line(&mut line).await.unwrap();

        let mut stale = storage.get_line(&line.id).await.unwrap().unwrap();
        line.refined_topic = "nvidia datacenter".into();
        storage.save_line(&mut line).await.unwrap();

        stale.queries.push(Query {
            text: "and AMD's share?".into(),
            response: String::new(),
            citations: vec![],
            asked_at: Utc::now(),
        });
        let err = storage.save_line(&mut stale).await.unwrap_err();
        assert!(matches!(err, LearnlineError::Conflict(_)));
        assert_eq!(stale.version, 1);

        // The losing write left neither its row nor its query behind.
        let stored = storage.get_line(&line.id).await.unwrap().unwrap();
        assert_eq!(stored.refined_topic, "nvidia datacenter");
        assert_eq!(stored.queries.len(), 1);
        assert_eq!(stored.version, 2);

        // A fresh line whose id is already taken conflicts too.
        let mut duplicate = sample_line("u1");
        duplicate.id = line.id;
        assert!(matches!(
            storage.save_line(&mut duplicate).await,
            Err(LearnlineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn knowledge_versions_are_checked() {
        let storage = test_storage().await;
        storage.ensure_user("u1").await.unwrap();

        let mut state = storage.load_knowledge("u1").await.unwrap();
        assert_eq!(state.version, 0);

        state.merge(&KnowledgeDelta {
            changes: vec![ConceptChange {
                concept: "gpu".into(),
                line_id: None,
                demonstration_level: 0.3,
                evidence: vec!["connected gpu supply to demand".into()],
                exposures: vec![],
                confusions: vec![],
                observed_at: Utc::now(),
            }],
            seen_content: vec![],
        });
        storage.save_knowledge(&state, 0).await.expect("first save");

        let loaded = storage.load_knowledge("u1").await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.level("gpu"), 0.3);

        // A writer still holding version 0 loses.
        let mut stale = KnowledgeState::empty("u1");
        stale.version = 1;
        let err = storage.save_knowledge(&stale, 0).await.unwrap_err();
        assert!(matches!(err, LearnlineError::Conflict(_)));
    }

    #[tokio::test]
    async fn interactions_roundtrip() {
        let storage = test_storage().await;
        let base = Utc::now();
        for (i, kind) in [
            InteractionKind::ReadStart { section: None },
            InteractionKind::Highlight {
                highlighted_text: "CoWoS packaging capacity".into(),
                surrounding_context: None,
            },
        ]
        .into_iter()
        .enumerate()
        {
            storage
                .insert_interaction(&Interaction {
                    user_id: "u1".into(),
                    content_id: "c1".into(),
                    kind,
                    timestamp: base + chrono::Duration::seconds(i as i64),
                })
                .await
                .expect("insert interaction");
        }

        let all = storage.list_interactions("u1", 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind.name(), "read_start");

        let for_content = storage.list_content_interactions("u1", "c1").await.unwrap();
        assert_eq!(for_content.len(), 2);
        assert!(storage.list_content_interactions("u1", "c2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_audit_trail() {
        let storage = test_storage().await;
        let outcome = RunOutcome::Exhausted(ExhaustedReport {
            moment: None,
            line_id: LineId::new(),
            line_analysis: LineAnalysis::default(),
            failures: vec![],
            suggestions: Suggestions::default(),
        });
        storage
            .record_run("u1", "how big is the AI chip market?", 3, &outcome)
            .await
            .expect("record run");

        let runs = storage.list_runs("u1", 5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].knowledge_version, 3);
        assert!(matches!(runs[0].outcome, RunOutcome::Exhausted(_)));
    }

    #[tokio::test]
    async fn content_cache_respects_age() {
        let storage = test_storage().await;
        let doc = ExtractedDocument {
            sections: vec![ContentSection {
                title: "Overview".into(),
                body: "Accelerators dominate data center spend.".into(),
            }],
            metadata: ContentMetadata {
                title: Some("AI chips".into()),
                source: Some("example.com".into()),
                metrics: vec![],
                word_count: 5,
            },
        };
        storage
            .put_cached_content("abc", "https://example.com/a", &doc)
            .await
            .unwrap();

        let hit = storage
            .get_cached_content("abc", chrono::Duration::hours(1))
            .await
            .unwrap()
            .expect("fresh entry");
        assert_eq!(hit.document, doc);

        let expired = storage
            .get_cached_content("abc", chrono::Duration::seconds(-1))
            .await
            .unwrap();
        assert!(expired.is_none());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("ll_test_{}.db", Uuid::now_v7()));
        drop(Storage::open(&tmp).await.unwrap());
        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert!(ro.ensure_user("u1").await.is_err());
    }
}
