//! SQL migration definitions for the Learnline database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: users, query_lines, queries, knowledge_state, interactions",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- One row per query line; queries live in their own append-only table
CREATE TABLE IF NOT EXISTS query_lines (
    id             TEXT PRIMARY KEY,
    user_id        TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    goal           TEXT NOT NULL,
    refined_topic  TEXT NOT NULL,
    data_json      TEXT NOT NULL,
    active         INTEGER NOT NULL DEFAULT 1,
    created_at     TEXT NOT NULL,
    last_active_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_query_lines_user ON query_lines(user_id, last_active_at);

CREATE TABLE IF NOT EXISTS queries (
    line_id        TEXT NOT NULL REFERENCES query_lines(id) ON DELETE CASCADE,
    seq            INTEGER NOT NULL,
    user_id        TEXT NOT NULL,
    text           TEXT NOT NULL,
    response       TEXT NOT NULL,
    citations_json TEXT NOT NULL,
    asked_at       TEXT NOT NULL,
    PRIMARY KEY (line_id, seq)
);

-- Versioned per-user knowledge record
CREATE TABLE IF NOT EXISTS knowledge_state (
    user_id    TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
    version    INTEGER NOT NULL,
    data_json  TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS interactions (
    id               TEXT PRIMARY KEY,
    user_id          TEXT NOT NULL,
    content_id       TEXT NOT NULL,
    interaction_type TEXT NOT NULL,
    payload_json     TEXT NOT NULL,
    occurred_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_interactions_user ON interactions(user_id, occurred_at);
CREATE INDEX IF NOT EXISTS idx_interactions_content ON interactions(user_id, content_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Recommendation run audit trail and extracted content cache",
            sql: r#"
CREATE TABLE IF NOT EXISTS recommendation_runs (
    id                TEXT PRIMARY KEY,
    user_id           TEXT NOT NULL,
    line_id           TEXT NOT NULL,
    query             TEXT NOT NULL,
    outcome           TEXT NOT NULL,
    knowledge_version INTEGER NOT NULL,
    result_json       TEXT NOT NULL,
    created_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_user ON recommendation_runs(user_id, created_at);

CREATE TABLE IF NOT EXISTS content_cache (
    content_id    TEXT PRIMARY KEY,
    url           TEXT NOT NULL,
    document_json TEXT NOT NULL,
    extracted_at  TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
        Migration {
            version: 3,
            description: "Optimistic version column on query lines",
            sql: r#"
ALTER TABLE query_lines ADD COLUMN version INTEGER NOT NULL DEFAULT 0;

-- Lines saved before versioning count as saved once
UPDATE query_lines SET version = 1;

INSERT INTO schema_migrations (version) VALUES (3);
"#,
        },
    ]
}
