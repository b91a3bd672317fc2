//! SQLite-backed catalog.
//!
//! One connection behind a mutex serves every trait in [`crate::catalog`]. Progress appends use
//! SQLite's JSON functions so the log grows inside a single `UPDATE`, and job claims use
//! `UPDATE … RETURNING`, so neither needs a read-modify-write round trip in Rust.

use super::types::{
    ArtifactKind, ArtifactRecord, ArtifactSource, ArtifactStatus, IngestionJob, KnowledgeEntity,
    NewArtifact, OrganizationPolicy, ProcessingStatus, ProgressEntry, ProviderSettings,
    ResolvedRelationship, UsageEvent,
};
use super::{ArtifactRepository, CatalogError, JobStore, OrganizationDirectory, UsageRecorder};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS organizations (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        provider_mode TEXT NOT NULL DEFAULT 'managed',
        provider_endpoint TEXT,
        provider_credential TEXT,
        chat_model TEXT,
        embedding_model TEXT,
        cross_division_query INTEGER NOT NULL DEFAULT 0,
        created_at TEXT DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS divisions (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL REFERENCES organizations(id),
        name TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS artifacts (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL REFERENCES organizations(id),
        division_id TEXT,
        kind TEXT NOT NULL,
        title TEXT NOT NULL,
        file_name TEXT,
        media_type TEXT NOT NULL,
        summary TEXT,
        content BLOB NOT NULL,
        status TEXT NOT NULL DEFAULT 'unprocessed',
        processed INTEGER NOT NULL DEFAULT 0,
        published INTEGER NOT NULL DEFAULT 1,
        error TEXT,
        embedding_model TEXT,
        embedding_version INTEGER NOT NULL DEFAULT 0,
        progress_log TEXT NOT NULL DEFAULT '[]',
        created_at TEXT DEFAULT (datetime('now')),
        updated_at TEXT DEFAULT (datetime('now'))
    );
    CREATE INDEX IF NOT EXISTS idx_artifacts_status ON artifacts(status);

    CREATE TABLE IF NOT EXISTS knowledge_entities (
        id TEXT PRIMARY KEY,
        artifact_id TEXT NOT NULL REFERENCES artifacts(id),
        name TEXT NOT NULL,
        entity_type TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT ''
    );
    CREATE INDEX IF NOT EXISTS idx_entities_artifact ON knowledge_entities(artifact_id);

    CREATE TABLE IF NOT EXISTS knowledge_relationships (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        artifact_id TEXT NOT NULL REFERENCES artifacts(id),
        source_entity_id TEXT NOT NULL REFERENCES knowledge_entities(id),
        target_entity_id TEXT NOT NULL REFERENCES knowledge_entities(id),
        relation_type TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT ''
    );
    CREATE INDEX IF NOT EXISTS idx_relationships_artifact ON knowledge_relationships(artifact_id);

    CREATE TABLE IF NOT EXISTS usage_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        organization_id TEXT NOT NULL,
        artifact_id TEXT,
        operation TEXT NOT NULL,
        model TEXT NOT NULL,
        estimated_tokens INTEGER NOT NULL,
        created_at TEXT DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS ingestion_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        artifact_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        attempts INTEGER NOT NULL DEFAULT 0,
        available_at INTEGER NOT NULL,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_due ON ingestion_jobs(status, available_at);
";

/// Catalog stored in a single SQLite database.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    /// Open or create the catalog at `path`, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.migrate()?;
        tracing::debug!(path = %path.display(), "Opened catalog");
        Ok(catalog)
    }

    /// Open a private in-memory catalog.
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.migrate()?;
        Ok(catalog)
    }

    fn migrate(&self) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            let has_published = conn
                .prepare("SELECT 1 FROM pragma_table_info('artifacts') WHERE name = 'published'")?
                .exists([])?;
            if !has_published {
                conn.execute_batch(
                    "ALTER TABLE artifacts ADD COLUMN published INTEGER NOT NULL DEFAULT 1",
                )?;
            }
            Ok(())
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, CatalogError> {
        let conn = self.conn.lock().map_err(|_| CatalogError::Poisoned)?;
        f(&conn).map_err(CatalogError::from)
    }

    fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, CatalogError> {
        let mut conn = self.conn.lock().map_err(|_| CatalogError::Poisoned)?;
        f(&mut conn).map_err(CatalogError::from)
    }

    /// Insert an organization with its provider settings and policy.
    pub fn create_organization(
        &self,
        id: Uuid,
        name: &str,
        settings: &ProviderSettings,
        policy: OrganizationPolicy,
    ) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO organizations (id, name, provider_mode, provider_endpoint,
                    provider_credential, chat_model, embedding_model, cross_division_query)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.to_string(),
                    name,
                    settings.mode.as_str(),
                    settings.endpoint,
                    settings.sealed_credential,
                    settings.chat_model,
                    settings.embedding_model,
                    policy.cross_division_query,
                ],
            )
        })?;
        Ok(())
    }

    /// Replace an organization's provider settings.
    pub fn update_provider_settings(
        &self,
        id: Uuid,
        settings: &ProviderSettings,
    ) -> Result<(), CatalogError> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE organizations SET provider_mode = ?2, provider_endpoint = ?3,
                    provider_credential = ?4, chat_model = ?5, embedding_model = ?6
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    settings.mode.as_str(),
                    settings.endpoint,
                    settings.sealed_credential,
                    settings.chat_model,
                    settings.embedding_model,
                ],
            )
        })?;
        ensure_found(changed, "organization", id)
    }

    /// Insert a division.
    pub fn create_division(
        &self,
        id: Uuid,
        organization_id: Uuid,
        name: &str,
    ) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO divisions (id, organization_id, name) VALUES (?1, ?2, ?3)",
                params![id.to_string(), organization_id.to_string(), name],
            )
        })?;
        Ok(())
    }

    /// Insert an artifact in the `unprocessed` state.
    pub fn create_artifact(&self, artifact: &NewArtifact) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO artifacts (id, organization_id, division_id, kind, title, file_name,
                    media_type, summary, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    artifact.id.to_string(),
                    artifact.organization_id.to_string(),
                    artifact.division_id.map(|id| id.to_string()),
                    artifact.kind.as_str(),
                    artifact.title,
                    artifact.file_name,
                    artifact.media_type,
                    artifact.summary,
                    artifact.content,
                ],
            )
        })?;
        Ok(())
    }

    /// Move an artifact to another division, or make it organization-wide with `None`.
    pub fn move_artifact(&self, id: Uuid, division_id: Option<Uuid>) -> Result<(), CatalogError> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE artifacts SET division_id = ?2, updated_at = datetime('now') WHERE id = ?1",
                params![id.to_string(), division_id.map(|id| id.to_string())],
            )
        })?;
        ensure_found(changed, "artifact", id)
    }

    /// Publish or withdraw an artifact. Withdrawn artifacts keep their chunks but never surface.
    pub fn set_published(&self, id: Uuid, published: bool) -> Result<(), CatalogError> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE artifacts SET published = ?2, updated_at = datetime('now') WHERE id = ?1",
                params![id.to_string(), published],
            )
        })?;
        ensure_found(changed, "artifact", id)
    }

    /// Delete an artifact row and its knowledge graph. Chunks are left to the index.
    pub fn delete_artifact(&self, id: Uuid) -> Result<(), CatalogError> {
        let changed = self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let key = id.to_string();
            tx.execute(
                "DELETE FROM knowledge_relationships WHERE artifact_id = ?1",
                params![key],
            )?;
            tx.execute("DELETE FROM knowledge_entities WHERE artifact_id = ?1", params![key])?;
            let changed = tx.execute("DELETE FROM artifacts WHERE id = ?1", params![key])?;
            tx.commit()?;
            Ok(changed)
        })?;
        ensure_found(changed, "artifact", id)
    }

    /// Usage events recorded for an organization, oldest first.
    pub fn usage_events(&self, organization_id: Uuid) -> Result<Vec<UsageEvent>, CatalogError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT artifact_id, operation, model, estimated_tokens FROM usage_events
                 WHERE organization_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![organization_id.to_string()], |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(artifact_id, operation, model, tokens)| {
                Ok(UsageEvent {
                    organization_id,
                    artifact_id: artifact_id.as_deref().map(parse_uuid).transpose()?,
                    operation,
                    model,
                    estimated_tokens: u64::try_from(tokens).unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Entities currently stored for an artifact, by name.
    pub fn entity_names(&self, artifact_id: Uuid) -> Result<Vec<String>, CatalogError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM knowledge_entities WHERE artifact_id = ?1 ORDER BY name",
            )?;
            let names = stmt
                .query_map(params![artifact_id.to_string()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
    }

    /// Number of relationships stored for an artifact.
    pub fn relationship_count(&self, artifact_id: Uuid) -> Result<usize, CatalogError> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM knowledge_relationships WHERE artifact_id = ?1",
                params![artifact_id.to_string()],
                |row| row.get(0),
            )
        })?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Job rows for an artifact as `(status, attempts)`, oldest first.
    pub fn job_states(&self, artifact_id: Uuid) -> Result<Vec<(String, u32)>, CatalogError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, attempts FROM ingestion_jobs WHERE artifact_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![artifact_id.to_string()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

type ArtifactRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    String,
    bool,
    bool,
    Option<String>,
    Option<String>,
    i64,
);

const ARTIFACT_COLUMNS: &str = "id, organization_id, division_id, kind, title, file_name, \
    media_type, summary, status, processed, published, error, embedding_model, embedding_version";

fn artifact_row(row: &Row<'_>) -> rusqlite::Result<ArtifactRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn artifact_from_row(row: ArtifactRow) -> Result<ArtifactRecord, CatalogError> {
    let (
        id,
        organization_id,
        division_id,
        kind,
        title,
        file_name,
        media_type,
        summary,
        status,
        processed,
        published,
        error,
        embedding_model,
        embedding_version,
    ) = row;

    Ok(ArtifactRecord {
        id: parse_uuid(&id)?,
        organization_id: parse_uuid(&organization_id)?,
        division_id: division_id.as_deref().map(parse_uuid).transpose()?,
        kind: kind.parse::<ArtifactKind>().map_err(CatalogError::Corrupt)?,
        title,
        file_name,
        media_type,
        summary,
        status: status
            .parse::<ProcessingStatus>()
            .map_err(CatalogError::Corrupt)?,
        processed,
        published,
        error,
        embedding_model,
        embedding_version,
    })
}

#[async_trait]
impl ArtifactRepository for SqliteCatalog {
    async fn artifact(&self, id: Uuid) -> Result<ArtifactRecord, CatalogError> {
        let row: Option<ArtifactRow> = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE id = ?1"),
                params![id.to_string()],
                artifact_row,
            )
            .optional()
        })?;

        match row {
            Some(row) => artifact_from_row(row),
            None => Err(not_found("artifact", id)),
        }
    }

    async fn artifacts(&self, ids: &[Uuid]) -> Result<Vec<ArtifactRecord>, CatalogError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE id IN ({placeholders})"
            ))?;
            let rows = stmt
                .query_map(params_from_iter(ids.iter().map(Uuid::to_string)), artifact_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(artifact_from_row).collect()
    }

    async fn load_source(&self, id: Uuid) -> Result<ArtifactSource, CatalogError> {
        let source = self.with_conn(|conn| {
            conn.query_row(
                "SELECT content, media_type, file_name FROM artifacts WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(ArtifactSource {
                        bytes: row.get(0)?,
                        media_type: row.get(1)?,
                        file_name: row.get(2)?,
                    })
                },
            )
            .optional()
        })?;
        source.ok_or_else(|| not_found("artifact", id))
    }

    async fn status(&self, id: Uuid) -> Result<ArtifactStatus, CatalogError> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT status, progress_log, processed, error FROM artifacts WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
        })?;

        let (status, log, processed, error) = row.ok_or_else(|| not_found("artifact", id))?;
        let progress_log: Vec<ProgressEntry> = serde_json::from_str(&log)
            .map_err(|err| CatalogError::Corrupt(format!("progress log of {id}: {err}")))?;
        Ok(ArtifactStatus {
            status: status.parse().map_err(CatalogError::Corrupt)?,
            progress_log,
            processed,
            error,
        })
    }

    async fn begin_processing(&self, id: Uuid) -> Result<(), CatalogError> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE artifacts SET status = 'processing', processed = 0, error = NULL,
                    updated_at = datetime('now')
                 WHERE id = ?1",
                params![id.to_string()],
            )
        })?;
        ensure_found(changed, "artifact", id)
    }

    async fn append_progress(&self, id: Uuid, entry: &ProgressEntry) -> Result<(), CatalogError> {
        let encoded = serde_json::to_string(entry)
            .map_err(|err| CatalogError::Corrupt(format!("progress entry: {err}")))?;
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE artifacts
                 SET progress_log = json_insert(progress_log, '$[#]', json(?2)),
                     updated_at = datetime('now')
                 WHERE id = ?1",
                params![id.to_string(), encoded],
            )
        })?;
        ensure_found(changed, "artifact", id)
    }

    async fn record_embedding_model(&self, id: Uuid, model: &str) -> Result<(), CatalogError> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE artifacts SET embedding_model = ?2, updated_at = datetime('now')
                 WHERE id = ?1",
                params![id.to_string(), model],
            )
        })?;
        ensure_found(changed, "artifact", id)
    }

    async fn complete_processing(&self, id: Uuid) -> Result<i64, CatalogError> {
        let version = self.with_conn(|conn| {
            conn.query_row(
                "UPDATE artifacts
                 SET status = 'completed', processed = 1, error = NULL,
                     embedding_version = embedding_version + 1, updated_at = datetime('now')
                 WHERE id = ?1
                 RETURNING embedding_version",
                params![id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })?;
        version.ok_or_else(|| not_found("artifact", id))
    }

    async fn fail_processing(&self, id: Uuid, message: &str) -> Result<(), CatalogError> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE artifacts SET status = 'failed', processed = 0, error = ?2,
                    updated_at = datetime('now')
                 WHERE id = ?1",
                params![id.to_string(), message],
            )
        })?;
        ensure_found(changed, "artifact", id)
    }

    async fn artifacts_in_status(
        &self,
        status: ProcessingStatus,
    ) -> Result<Vec<Uuid>, CatalogError> {
        let ids = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM artifacts WHERE status = ?1")?;
            let ids = stmt
                .query_map(params![status.as_str()], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })?;
        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    async fn replace_entities(
        &self,
        artifact_id: Uuid,
        entities: &[KnowledgeEntity],
    ) -> Result<HashMap<String, Uuid>, CatalogError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let key = artifact_id.to_string();
            tx.execute(
                "DELETE FROM knowledge_relationships WHERE artifact_id = ?1",
                params![key],
            )?;
            tx.execute(
                "DELETE FROM knowledge_entities WHERE artifact_id = ?1",
                params![key],
            )?;

            let mut ids = HashMap::with_capacity(entities.len());
            {
                let mut insert = tx.prepare(
                    "INSERT INTO knowledge_entities (id, artifact_id, name, entity_type, description)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for entity in entities {
                    if ids.contains_key(&entity.name) {
                        continue;
                    }
                    let id = Uuid::new_v4();
                    insert.execute(params![
                        id.to_string(),
                        key,
                        entity.name,
                        entity.entity_type,
                        entity.description,
                    ])?;
                    ids.insert(entity.name.clone(), id);
                }
            }
            tx.commit()?;
            Ok(ids)
        })
    }

    async fn insert_relationships(
        &self,
        artifact_id: Uuid,
        relationships: &[ResolvedRelationship],
    ) -> Result<(), CatalogError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO knowledge_relationships
                        (artifact_id, source_entity_id, target_entity_id, relation_type, description)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for relationship in relationships {
                    insert.execute(params![
                        artifact_id.to_string(),
                        relationship.source_entity_id.to_string(),
                        relationship.target_entity_id.to_string(),
                        relationship.relation_type,
                        relationship.description,
                    ])?;
                }
            }
            tx.commit()
        })
    }
}

#[async_trait]
impl OrganizationDirectory for SqliteCatalog {
    async fn provider_settings(
        &self,
        organization_id: Uuid,
    ) -> Result<ProviderSettings, CatalogError> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT provider_mode, provider_endpoint, provider_credential, chat_model,
                    embedding_model
                 FROM organizations WHERE id = ?1",
                params![organization_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()
        })?;

        let (mode, endpoint, sealed_credential, chat_model, embedding_model) =
            row.ok_or_else(|| not_found("organization", organization_id))?;
        Ok(ProviderSettings {
            mode: mode.parse().map_err(CatalogError::Corrupt)?,
            endpoint,
            sealed_credential,
            chat_model,
            embedding_model,
        })
    }

    async fn policy(&self, organization_id: Uuid) -> Result<OrganizationPolicy, CatalogError> {
        let flag = self.with_conn(|conn| {
            conn.query_row(
                "SELECT cross_division_query FROM organizations WHERE id = ?1",
                params![organization_id.to_string()],
                |row| row.get::<_, bool>(0),
            )
            .optional()
        })?;
        flag.map(|cross_division_query| OrganizationPolicy {
            cross_division_query,
        })
        .ok_or_else(|| not_found("organization", organization_id))
    }

    async fn division_names(
        &self,
        organization_id: Uuid,
    ) -> Result<HashMap<Uuid, String>, CatalogError> {
        let rows = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name FROM divisions WHERE organization_id = ?1")?;
            let rows = stmt
                .query_map(params![organization_id.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(id, name)| Ok((parse_uuid(&id)?, name)))
            .collect()
    }
}

#[async_trait]
impl UsageRecorder for SqliteCatalog {
    async fn record_usage(&self, event: UsageEvent) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO usage_events (organization_id, artifact_id, operation, model,
                    estimated_tokens)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.organization_id.to_string(),
                    event.artifact_id.map(|id| id.to_string()),
                    event.operation,
                    event.model,
                    i64::try_from(event.estimated_tokens).unwrap_or(i64::MAX),
                ],
            )
        })?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteCatalog {
    async fn enqueue(&self, artifact_id: Uuid) -> Result<bool, CatalogError> {
        let now = now_millis();
        let inserted = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ingestion_jobs (artifact_id, status, attempts, available_at,
                    created_at, updated_at)
                 SELECT ?1, 'queued', 0, ?2, ?2, ?2
                 WHERE NOT EXISTS (
                     SELECT 1 FROM ingestion_jobs WHERE artifact_id = ?1 AND status = 'queued'
                 )",
                params![artifact_id.to_string(), now],
            )
        })?;
        Ok(inserted > 0)
    }

    async fn claim_next(&self) -> Result<Option<IngestionJob>, CatalogError> {
        let now = now_millis();
        let row = self.with_conn(|conn| {
            conn.query_row(
                "UPDATE ingestion_jobs SET status = 'running', updated_at = ?1
                 WHERE id = (
                     SELECT id FROM ingestion_jobs
                     WHERE status = 'queued' AND available_at <= ?1
                     ORDER BY available_at, id LIMIT 1
                 )
                 RETURNING id, artifact_id, attempts",
                params![now],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                    ))
                },
            )
            .optional()
        })?;

        row.map(|(id, artifact_id, attempts)| {
            Ok(IngestionJob {
                id,
                artifact_id: parse_uuid(&artifact_id)?,
                attempts,
            })
        })
        .transpose()
    }

    async fn complete_job(&self, job_id: i64) -> Result<(), CatalogError> {
        self.set_job_state(job_id, "completed", None, None)
    }

    async fn reschedule_job(
        &self,
        job_id: i64,
        error: &str,
        delay: Duration,
    ) -> Result<(), CatalogError> {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let now = now_millis();
        // A newer queued job for the same artifact already covers the retry.
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE ingestion_jobs
                 SET status = CASE WHEN EXISTS (
                         SELECT 1 FROM ingestion_jobs AS other
                         WHERE other.artifact_id = ingestion_jobs.artifact_id
                             AND other.id != ingestion_jobs.id
                             AND other.status = 'queued'
                     ) THEN 'superseded' ELSE 'queued' END,
                     attempts = attempts + 1,
                     last_error = ?2,
                     available_at = ?3,
                     updated_at = ?4
                 WHERE id = ?1",
                params![job_id, error, now.saturating_add(delay_ms), now],
            )
        })?;
        ensure_found(changed, "ingestion job", job_id)
    }

    async fn abandon_job(&self, job_id: i64, error: &str) -> Result<(), CatalogError> {
        self.set_job_state(job_id, "failed", Some(error), None)
    }

    async fn requeue_interrupted(&self) -> Result<usize, CatalogError> {
        let now = now_millis();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE ingestion_jobs
                 SET status = CASE WHEN EXISTS (
                         SELECT 1 FROM ingestion_jobs AS other
                         WHERE other.artifact_id = ingestion_jobs.artifact_id
                             AND other.status = 'queued'
                     ) THEN 'superseded' ELSE 'queued' END,
                     available_at = ?1,
                     updated_at = ?1
                 WHERE status = 'running'",
                params![now],
            )
        })
    }
}

impl SqliteCatalog {
    fn set_job_state(
        &self,
        job_id: i64,
        status: &str,
        error: Option<&str>,
        available_at: Option<i64>,
    ) -> Result<(), CatalogError> {
        let now = now_millis();
        let counts_attempt = status != "completed";
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE ingestion_jobs
                 SET status = ?2,
                     attempts = attempts + ?3,
                     last_error = COALESCE(?4, last_error),
                     available_at = COALESCE(?5, available_at),
                     updated_at = ?6
                 WHERE id = ?1",
                params![job_id, status, counts_attempt as i64, error, available_at, now],
            )
        })?;
        ensure_found(changed, "ingestion job", job_id)
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, CatalogError> {
    Uuid::parse_str(value).map_err(|err| CatalogError::Corrupt(format!("uuid `{value}`: {err}")))
}

fn not_found(entity: &'static str, id: impl ToString) -> CatalogError {
    CatalogError::NotFound {
        entity,
        id: id.to_string(),
    }
}

fn ensure_found(changed: usize, entity: &'static str, id: impl ToString) -> Result<(), CatalogError> {
    if changed == 0 {
        Err(not_found(entity, id))
    } else {
        Ok(())
    }
}

fn now_millis() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}
