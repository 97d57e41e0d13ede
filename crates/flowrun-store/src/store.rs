use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::{ApprovalStore, CheckpointStore, ExecutionStore};
use flowrun_core::types::*;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        workflow_name TEXT NOT NULL,
        status TEXT NOT NULL,
        input TEXT NOT NULL,
        context TEXT NOT NULL,
        current_step INTEGER NOT NULL DEFAULT 0,
        step_results TEXT NOT NULL,
        output TEXT,
        error TEXT,
        started_at TEXT NOT NULL,
        finished_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_executions_started
        ON executions(started_at DESC);

    CREATE TABLE IF NOT EXISTS approvals (
        id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        status TEXT NOT NULL,
        message TEXT,
        approvers TEXT NOT NULL,
        data TEXT NOT NULL,
        context TEXT NOT NULL,
        reviewed_data TEXT,
        reason TEXT,
        created_at TEXT NOT NULL,
        resolved_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_approvals_status
        ON approvals(status, created_at);

    CREATE TABLE IF NOT EXISTS checkpoints (
        execution_id TEXT PRIMARY KEY,
        step INTEGER NOT NULL,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );";

fn db_err(e: rusqlite::Error) -> FlowError {
    FlowError::Store(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON column inside a row mapper.
fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        serde_json::from_str(&t).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    Ok(DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now()))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    Ok(text
        .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .map(|dt| dt.with_timezone(&Utc)))
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowExecution> {
    let status: String = row.get(3)?;
    Ok(WorkflowExecution {
        id: ExecutionId(row.get(0)?),
        workflow_id: row.get(1)?,
        workflow_name: row.get(2)?,
        status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Failed),
        input: json_col(row, 4)?,
        context: json_col(row, 5)?,
        current_step: row.get::<_, i64>(6)? as usize,
        step_results: json_col(row, 7)?,
        output: opt_json_col(row, 8)?,
        error: row.get(9)?,
        started_at: time_col(row, 10)?,
        finished_at: opt_time_col(row, 11)?,
    })
}

fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<ApprovalRecord> {
    let status: String = row.get(3)?;
    Ok(ApprovalRecord {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        node_id: row.get(2)?,
        status: ApprovalStatus::parse(&status).unwrap_or(ApprovalStatus::Pending),
        message: row.get(4)?,
        approvers: json_col(row, 5)?,
        data: json_col(row, 6)?,
        context: json_col(row, 7)?,
        reviewed_data: opt_json_col(row, 8)?,
        reason: row.get(9)?,
        created_at: time_col(row, 10)?,
        resolved_at: opt_time_col(row, 11)?,
    })
}

const EXECUTION_COLUMNS: &str = "id, workflow_id, workflow_name, status, input, context, \
     current_step, step_results, output, error, started_at, finished_at";

const APPROVAL_COLUMNS: &str = "id, execution_id, node_id, status, message, approvers, \
     data, context, reviewed_data, reason, created_at, resolved_at";

/// SQLite-backed store for execution records, approval requests and
/// checkpoints.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Store(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL lets the CLI read while a run is writing.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| FlowError::Store(e.to_string()))
    }

    /// Most recent executions first.
    pub fn recent_executions(&self, limit: usize) -> Result<Vec<WorkflowExecution>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM executions ORDER BY started_at DESC LIMIT ?1",
                EXECUTION_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], execution_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Resolve a unique approval id from a prefix.
    pub fn find_approval(&self, prefix: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id FROM approvals WHERE substr(id, 1, length(?1)) = ?1 LIMIT 2")
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        match ids.as_slice() {
            [only] => Ok(Some(only.clone())),
            [] => Ok(None),
            _ => Err(FlowError::Store(format!("approval prefix '{}' is ambiguous", prefix))),
        }
    }

    fn load_approval(conn: &Connection, id: &str) -> Result<Option<ApprovalRecord>> {
        conn.query_row(
            &format!("SELECT {} FROM approvals WHERE id = ?1", APPROVAL_COLUMNS),
            params![id],
            approval_from_row,
        )
        .optional()
        .map_err(db_err)
    }
}

impl ExecutionStore for SqliteStore {
    fn create(&self, seed: ExecutionSeed) -> BoxFuture<'_, Result<ExecutionId>> {
        Box::pin(async move {
            let id = ExecutionId::new();
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO executions (id, workflow_id, workflow_name, status, input, context,
                     current_step, step_results, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.0,
                    seed.workflow_id,
                    seed.workflow_name,
                    seed.status.as_str(),
                    to_json(&seed.input)?,
                    to_json(&seed.context)?,
                    seed.current_step as i64,
                    to_json(&seed.step_results)?,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            debug!(execution_id = %id, workflow_id = %seed.workflow_id, "Execution record created");
            Ok(id)
        })
    }

    fn update(&self, id: &ExecutionId, update: ExecutionUpdate) -> BoxFuture<'_, Result<()>> {
        let id = id.clone();
        Box::pin(async move {
            let conn = self.conn()?;
            let mut record = conn
                .query_row(
                    &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                    params![id.0],
                    execution_from_row,
                )
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| FlowError::Store(format!("unknown execution {}", id)))?;
            record.apply(update);

            conn.execute(
                "UPDATE executions SET status = ?2, current_step = ?3, step_results = ?4,
                     output = ?5, error = ?6, finished_at = ?7
                 WHERE id = ?1",
                params![
                    id.0,
                    record.status.as_str(),
                    record.current_step as i64,
                    to_json(&record.step_results)?,
                    record.output.as_ref().map(to_json).transpose()?,
                    record.error,
                    record.finished_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<WorkflowExecution>>> {
        let id = id.clone();
        Box::pin(async move {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                params![id.0],
                execution_from_row,
            )
            .optional()
            .map_err(db_err)
        })
    }
}

impl ApprovalStore for SqliteStore {
    fn create(&self, seed: ApprovalSeed) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let record = ApprovalRecord::from_seed(uuid::Uuid::new_v4().to_string(), seed);
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO approvals (id, execution_id, node_id, status, message, approvers,
                     data, context, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id,
                    record.execution_id,
                    record.node_id,
                    record.status.as_str(),
                    record.message,
                    to_json(&record.approvers)?,
                    to_json(&record.data)?,
                    to_json(&record.context)?,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(record.id)
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Result<Option<ApprovalRecord>>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            Self::load_approval(&conn, &id)
        })
    }

    fn resolve(&self, id: &str, decision: ApprovalDecision) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let Some(mut record) = Self::load_approval(&conn, &id)? else {
                return Ok(false);
            };
            if !record.resolve(decision) {
                return Ok(false);
            }

            // Guarded on status so a concurrent writer cannot resolve twice.
            let changed = conn
                .execute(
                    "UPDATE approvals SET status = ?2, reviewed_data = ?3, reason = ?4, resolved_at = ?5
                     WHERE id = ?1 AND status = 'pending'",
                    params![
                        id,
                        record.status.as_str(),
                        record.reviewed_data.as_ref().map(to_json).transpose()?,
                        record.reason,
                        record.resolved_at.map(|t| t.to_rfc3339()),
                    ],
                )
                .map_err(db_err)?;
            Ok(changed == 1)
        })
    }

    fn list_pending(&self) -> BoxFuture<'_, Result<Vec<ApprovalRecord>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM approvals WHERE status = 'pending' ORDER BY created_at ASC",
                    APPROVAL_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt.query_map([], approval_from_row).map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
    }
}

impl CheckpointStore for SqliteStore {
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let body = to_json(checkpoint);
        let execution_id = checkpoint.execution_id.clone();
        let step = checkpoint.step as i64;
        let updated_at = checkpoint.timestamp.to_rfc3339();
        Box::pin(async move {
            let body = body?;
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO checkpoints (execution_id, step, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(execution_id) DO UPDATE SET
                     step = excluded.step, body = excluded.body, updated_at = excluded.updated_at",
                params![execution_id, step, body, updated_at],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM checkpoints WHERE execution_id = ?1",
                    params![execution_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            match body {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        })
    }

    fn delete(&self, execution_id: &str) -> BoxFuture<'_, Result<()>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "DELETE FROM checkpoints WHERE execution_id = ?1",
                params![execution_id],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_core::context::ExecutionContext;
    use flowrun_core::workflow::{Node, WorkflowDefinition};
    use serde_json::json;

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition::new("wf-1", "Review").with_node(Node::agent("draft", "writer"))
    }

    fn approval_seed() -> ApprovalSeed {
        ApprovalSeed {
            execution_id: "ex-1".into(),
            node_id: "review".into(),
            message: Some("Check the draft".into()),
            approvers: vec!["ana@example.com".into()],
            data: json!({ "draft": "v1" }),
            context: json!({}),
        }
    }

    #[tokio::test]
    async fn test_execution_lifecycle() {
        let store = SqliteStore::in_memory().unwrap();
        let id = ExecutionStore::create(&store, ExecutionSeed::for_workflow(&workflow(), json!("in")))
            .await
            .unwrap();

        let record = ExecutionStore::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.input, json!("in"));
        assert!(record.output.is_none());

        store
            .update(
                &id,
                ExecutionUpdate {
                    status: Some(ExecutionStatus::Completed),
                    current_step: Some(2),
                    step_results: Some(vec![StepResult {
                        node_id: "draft".into(),
                        status: "completed".into(),
                        output: Some(json!("out")),
                        error: None,
                        elapsed_ms: 12,
                    }]),
                    output: Some(json!({ "text": "out" })),
                    finished_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let record = ExecutionStore::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.current_step, 2);
        assert_eq!(record.step_results[0].elapsed_ms, 12);
        assert_eq!(record.output, Some(json!({ "text": "out" })));
        assert!(record.finished_at.is_some());
        assert_eq!(store.recent_executions(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_execution() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .update(&ExecutionId::from_str("nope"), ExecutionUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Store(_)));
    }

    #[tokio::test]
    async fn test_approval_resolves_once() {
        let store = SqliteStore::in_memory().unwrap();
        let id = ApprovalStore::create(&store, approval_seed()).await.unwrap();

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].approvers, vec!["ana@example.com".to_string()]);

        assert!(store
            .resolve(&id, ApprovalDecision::Approved { reviewed_data: Some(json!("v2")) })
            .await
            .unwrap());
        assert!(!store
            .resolve(&id, ApprovalDecision::Rejected { reason: None })
            .await
            .unwrap());

        let record = ApprovalStore::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(record.status, ApprovalStatus::Approved);
        assert_eq!(record.reviewed_data, Some(json!("v2")));
        assert!(record.resolved_at.is_some());
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_approval_by_prefix() {
        let store = SqliteStore::in_memory().unwrap();
        let id = ApprovalStore::create(&store, approval_seed()).await.unwrap();

        assert_eq!(store.find_approval(&id[..8]).unwrap(), Some(id.clone()));
        assert_eq!(store.find_approval("zzzz").unwrap(), None);
    }

    #[tokio::test]
    async fn test_find_approval_treats_wildcards_literally() {
        let store = SqliteStore::in_memory().unwrap();
        ApprovalStore::create(&store, approval_seed()).await.unwrap();
        ApprovalStore::create(&store, approval_seed()).await.unwrap();

        assert_eq!(store.find_approval("%").unwrap(), None);
        assert_eq!(store.find_approval("_").unwrap(), None);
        assert_eq!(store.find_approval("%-%").unwrap(), None);
    }

    #[tokio::test]
    async fn test_checkpoint_upsert_and_delete() {
        let store = SqliteStore::in_memory().unwrap();
        let mut checkpoint = Checkpoint {
            execution_id: "ex-1".into(),
            workflow: workflow(),
            cursor: Cursor {
                node_id: "draft".into(),
                input: json!("in"),
                context: ExecutionContext::new().with_output("prev", json!(1)),
            },
            step: 0,
            step_results: vec![],
            timestamp: Utc::now(),
        };
        store.save(&checkpoint).await.unwrap();
        checkpoint.step = 3;
        store.save(&checkpoint).await.unwrap();

        let loaded = store.load("ex-1").await.unwrap().unwrap();
        assert_eq!(loaded.step, 3);
        assert_eq!(loaded.cursor.context.output("prev"), Some(&json!(1)));
        assert_eq!(loaded.workflow.id, "wf-1");

        store.delete("ex-1").await.unwrap();
        assert!(store.load("ex-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flowrun.db");

        let id = {
            let store = SqliteStore::open(&path).unwrap();
            ExecutionStore::create(&store, ExecutionSeed::for_workflow(&workflow(), json!(null)))
                .await
                .unwrap()
        };

        let store = SqliteStore::open(&path).unwrap();
        let record = ExecutionStore::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(record.workflow_name, "Review");
    }
}
