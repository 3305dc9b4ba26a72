//! libSQL backend — async `JobStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, ErrorInfo};
use crate::jobs::model::{Job, JobStatus, JobType};
use crate::store::migrations;
use crate::store::traits::JobStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Transactions on the shared connection must not overlap.
    write_lock: Mutex<()>,
}

/// One row of a job's status history.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTransition {
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    /// Error message of a failed or cancelled job.
    pub reason: Option<String>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Status history of a job, oldest first.
    pub async fn job_transitions(&self, job_id: Uuid) -> Result<Vec<JobTransition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT from_status, to_status, reason FROM job_transitions WHERE job_id = ?1 ORDER BY id",
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("job_transitions: {e}")))?;

        let mut history = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("job_transitions: {e}")))?
        {
            let from: Option<String> = row.get(0).ok();
            let to: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("job_transitions.to: {e}")))?;
            history.push(JobTransition {
                from: from.map(|s| parse_status(&s)).transpose()?,
                to: parse_status(&to)?,
                reason: row.get::<String>(2).ok(),
            });
        }
        Ok(history)
    }

    async fn query_jobs(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_status(s: &str) -> Result<JobStatus, DatabaseError> {
    s.parse()
        .map_err(|e: String| DatabaseError::Serialization(e))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_json<T: serde::Serialize>(v: Option<&T>) -> Result<libsql::Value, DatabaseError> {
    match v {
        Some(v) => serde_json::to_string(v)
            .map(libsql::Value::Text)
            .map_err(|e| DatabaseError::Serialization(e.to_string())),
        None => Ok(libsql::Value::Null),
    }
}

fn opt_real(v: Option<f32>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v as f64),
        None => libsql::Value::Null,
    }
}

fn opt_integer(v: Option<u64>, column: &str) -> Result<libsql::Value, DatabaseError> {
    match v {
        Some(v) => i64::try_from(v)
            .map(libsql::Value::Integer)
            .map_err(|_| DatabaseError::Serialization(format!("jobs.{column}: {v} out of range"))),
        None => Ok(libsql::Value::Null),
    }
}

/// Why a job reached its status, recorded with the transition.
fn transition_reason(job: &Job) -> libsql::Value {
    match (&job.status, &job.error) {
        (JobStatus::Failed | JobStatus::Cancelled, Some(error)) => {
            libsql::Value::Text(error.message.clone())
        }
        _ => libsql::Value::Null,
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str, column: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("jobs.{column}: {e}")))
}

const JOB_COLUMNS: &str = "id, tenant_id, job_type, params, status, result, error, progress, agent_id, conversation_id, collection_id, max_duration_secs, created_at, updated_at";

/// Map a libsql Row to a Job. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let col = |i: i32, name: &str| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("jobs.{name}: {e}")))
    };

    let id_str = col(0, "id")?;
    let job_type_str = col(2, "job_type")?;
    let params_str = col(3, "params")?;
    let status_str = col(4, "status")?;
    let result_str: Option<String> = row.get(5).ok();
    let error_str: Option<String> = row.get(6).ok();
    let progress: Option<f64> = row.get(7).ok();
    let max_duration: Option<i64> = row.get::<i64>(11).ok();

    Ok(Job {
        job_id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("jobs.id: {e}")))?,
        tenant_id: col(1, "tenant_id")?,
        job_type: job_type_str
            .parse::<JobType>()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        params: parse_json(&params_str, "params")?,
        status: parse_status(&status_str)?,
        result: result_str
            .map(|s| parse_json::<serde_json::Value>(&s, "result"))
            .transpose()?,
        error: error_str
            .map(|s| parse_json::<ErrorInfo>(&s, "error"))
            .transpose()?,
        progress: progress.map(|p| p as f32),
        agent_id: row.get(8).ok(),
        conversation_id: row.get(9).ok(),
        collection_id: row.get(10).ok(),
        max_duration_secs: max_duration.and_then(|v| u64::try_from(v).ok()),
        created_at: parse_datetime(&col(12, "created_at")?),
        updated_at: parse_datetime(&col(13, "updated_at")?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let params_json = serde_json::to_string(&job.params)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let max_duration = opt_integer(job.max_duration_secs, "max_duration_secs")?;

        let _write = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job begin: {e}")))?;

        tx.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                job.job_id.to_string(),
                job.tenant_id.clone(),
                job.job_type.as_str(),
                params_json,
                job.status.as_str(),
                opt_json(job.result.as_ref())?,
                opt_json(job.error.as_ref())?,
                opt_real(job.progress),
                opt_text_owned(job.agent_id.clone()),
                opt_text_owned(job.conversation_id.clone()),
                opt_text_owned(job.collection_id.clone()),
                max_duration,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        tx.execute(
            "INSERT INTO job_transitions (job_id, from_status, to_status, reason, created_at) VALUES (?1, NULL, ?2, ?3, ?4)",
            params![
                job.job_id.to_string(),
                job.status.as_str(),
                transition_reason(job),
                job.created_at.to_rfc3339()
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_job transition: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job commit: {e}")))?;

        debug!(job_id = %job.job_id, tenant = %job.tenant_id, "Job inserted into DB");
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let jobs = self
            .query_jobs(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id.to_string()],
                "get_job",
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn update_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let id = job.job_id.to_string();
        let params_json = serde_json::to_string(&job.params)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let _write = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job begin: {e}")))?;

        // Record the transition before the row changes so from_status is the old value.
        tx.execute(
            "INSERT INTO job_transitions (job_id, from_status, to_status, reason, created_at)
             SELECT id, status, ?2, ?3, ?4 FROM jobs WHERE id = ?1 AND status != ?2",
            params![
                id.clone(),
                job.status.as_str(),
                transition_reason(job),
                job.updated_at.to_rfc3339()
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("update_job transition: {e}")))?;

        let changed = tx
            .execute(
                "UPDATE jobs SET status = ?1, result = ?2, error = ?3, progress = ?4, params = ?5, agent_id = ?6, updated_at = ?7 WHERE id = ?8",
                params![
                    job.status.as_str(),
                    opt_json(job.result.as_ref())?,
                    opt_json(job.error.as_ref())?,
                    opt_real(job.progress),
                    params_json,
                    opt_text_owned(job.agent_id.clone()),
                    job.updated_at.to_rfc3339(),
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job: {e}")))?;

        if changed == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("update_job rollback: {e}")))?;
            return Err(DatabaseError::Query(format!(
                "update_job: job {} does not exist",
                job.job_id
            )));
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job commit: {e}")))?;

        debug!(job_id = %job.job_id, status = %job.status, "Job updated in DB");
        Ok(())
    }

    async fn list_jobs(&self, tenant_id: &str, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = ?1 ORDER BY created_at DESC LIMIT ?2"
            ),
            params![tenant_id, limit as i64],
            "list_jobs",
        )
        .await
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at ASC"),
            params![status.as_str()],
            "list_jobs_by_status",
        )
        .await
    }
}
