use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use hostd_common::{
    CoordinatorError, DesiredState, HostingInstance, InstanceSpec, LifecycleTask, ObservedState,
    ResourceSample, Result, TaskKind, TaskStatus, Uuid,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::schema;
use super::StateStore;

/// SQLite-backed [`StateStore`]. A single connection behind a mutex
/// serializes writers, which is what gives per-instance task ordering its
/// backbone; WAL mode keeps readers cheap.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(CoordinatorError::storage)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(CoordinatorError::storage)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(CoordinatorError::storage)?;
        schema::bootstrap(&conn)?;
        debug!(path = %path.as_ref().display(), "Opened state store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(CoordinatorError::storage)?;
        schema::bootstrap(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoordinatorError::Internal("state store lock poisoned".to_string()))
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_ts() -> String {
    ts(&Utc::now())
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoordinatorError::Storage(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| CoordinatorError::Storage(format!("bad uuid {raw:?}: {e}")))
}

/// Raw column values, parsed into domain types outside the rusqlite
/// row-mapping closure so conversion failures carry store errors.
struct RawInstance {
    id: String,
    owner: String,
    name: String,
    spec: String,
    desired: String,
    observed: String,
    container_handle: Option<String>,
    version: i64,
    restart_count: i64,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
    last_reconciled_at: Option<String>,
}

const INSTANCE_COLUMNS: &str = "id, owner, name, spec, desired, observed, container_handle, \
     version, restart_count, last_error, created_at, updated_at, last_reconciled_at";

fn raw_instance(row: &Row<'_>) -> rusqlite::Result<RawInstance> {
    Ok(RawInstance {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        spec: row.get(3)?,
        desired: row.get(4)?,
        observed: row.get(5)?,
        container_handle: row.get(6)?,
        version: row.get(7)?,
        restart_count: row.get(8)?,
        last_error: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        last_reconciled_at: row.get(12)?,
    })
}

impl RawInstance {
    fn into_instance(self) -> Result<HostingInstance> {
        let spec: InstanceSpec = serde_json::from_str(&self.spec)
            .map_err(|e| CoordinatorError::Storage(format!("bad instance spec: {e}")))?;
        let desired = DesiredState::parse(&self.desired)
            .ok_or_else(|| CoordinatorError::Storage(format!("bad desired state {:?}", self.desired)))?;
        let observed = ObservedState::parse(&self.observed)
            .ok_or_else(|| CoordinatorError::Storage(format!("bad observed state {:?}", self.observed)))?;
        Ok(HostingInstance {
            id: parse_uuid(&self.id)?,
            owner: self.owner,
            name: self.name,
            spec,
            desired,
            observed,
            container_handle: self.container_handle,
            version: self.version,
            restart_count: self.restart_count as u32,
            last_error: self.last_error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            last_reconciled_at: match self.last_reconciled_at {
                Some(raw) => Some(parse_ts(&raw)?),
                None => None,
            },
        })
    }
}

struct RawTask {
    id: String,
    instance_id: String,
    kind: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

const TASK_COLUMNS: &str =
    "id, instance_id, kind, status, attempts, last_error, created_at, updated_at";

fn raw_task(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        kind: row.get(2)?,
        status: row.get(3)?,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl RawTask {
    fn into_task(self) -> Result<LifecycleTask> {
        let kind = TaskKind::parse(&self.kind)
            .ok_or_else(|| CoordinatorError::Storage(format!("bad task kind {:?}", self.kind)))?;
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| CoordinatorError::Storage(format!("bad task status {:?}", self.status)))?;
        Ok(LifecycleTask {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            kind,
            status,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn get_instance_locked(conn: &Connection, id: Uuid) -> Result<HostingInstance> {
    let raw = conn
        .query_row(
            &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?1"),
            params![id.to_string()],
            raw_instance,
        )
        .optional()
        .map_err(CoordinatorError::storage)?
        .ok_or_else(|| CoordinatorError::NotFound(format!("instance {id}")))?;
    raw.into_instance()
}

impl StateStore for SqliteStore {
    fn upsert_desired_state(&self, instance: &HostingInstance) -> Result<HostingInstance> {
        let conn = self.lock()?;
        let spec_json = serde_json::to_string(&instance.spec)
            .map_err(|e| CoordinatorError::Storage(format!("spec serialization: {e}")))?;
        let now = now_ts();
        let id = instance.id.to_string();

        let updated = conn
            .execute(
                "UPDATE instances
                 SET owner = ?1, name = ?2, spec = ?3, desired = ?4,
                     version = version + 1, updated_at = ?5
                 WHERE id = ?6 AND version = ?7",
                params![
                    instance.owner,
                    instance.name,
                    spec_json,
                    instance.desired.as_str(),
                    now,
                    id,
                    instance.version,
                ],
            )
            .map_err(CoordinatorError::storage)?;

        if updated == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM instances WHERE id = ?1)",
                    params![id],
                    |row| row.get(0),
                )
                .map_err(CoordinatorError::storage)?;
            if exists {
                return Err(CoordinatorError::Conflict(format!(
                    "concurrent desired-state write for instance {id} (version {})",
                    instance.version
                )));
            }
            conn.execute(
                "INSERT INTO instances
                     (id, owner, name, spec, desired, observed, container_handle,
                      version, restart_count, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    id,
                    instance.owner,
                    instance.name,
                    spec_json,
                    instance.desired.as_str(),
                    instance.observed.as_str(),
                    instance.container_handle,
                    instance.version,
                    instance.restart_count,
                    instance.last_error,
                    ts(&instance.created_at),
                    now,
                ],
            )
            .map_err(CoordinatorError::storage)?;
        }

        get_instance_locked(&conn, instance.id)
    }

    fn get_instance(&self, id: Uuid) -> Result<HostingInstance> {
        let conn = self.lock()?;
        get_instance_locked(&conn, id)
    }

    fn list_instances(&self) -> Result<Vec<HostingInstance>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY created_at"
            ))
            .map_err(CoordinatorError::storage)?;
        let rows = stmt
            .query_map([], raw_instance)
            .map_err(CoordinatorError::storage)?;
        rows.map(|raw| raw.map_err(CoordinatorError::storage)?.into_instance())
            .collect()
    }

    fn list_drifted(&self) -> Result<Vec<HostingInstance>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM instances
                 WHERE desired != observed ORDER BY created_at"
            ))
            .map_err(CoordinatorError::storage)?;
        let rows = stmt
            .query_map([], raw_instance)
            .map_err(CoordinatorError::storage)?;
        rows.map(|raw| raw.map_err(CoordinatorError::storage)?.into_instance())
            .collect()
    }

    fn record_observed(&self, id: Uuid, state: ObservedState, handle: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        let now = now_ts();
        let updated = conn
            .execute(
                "UPDATE instances
                 SET observed = ?1, container_handle = ?2, updated_at = ?3,
                     last_reconciled_at = ?3
                 WHERE id = ?4",
                params![state.as_str(), handle, now, id.to_string()],
            )
            .map_err(CoordinatorError::storage)?;
        if updated == 0 {
            return Err(CoordinatorError::NotFound(format!("instance {id}")));
        }
        Ok(())
    }

    fn record_failure(&self, id: Uuid, error: &str) -> Result<()> {
        let conn = self.lock()?;
        let now = now_ts();
        let updated = conn
            .execute(
                "UPDATE instances
                 SET observed = 'failed', last_error = ?1, updated_at = ?2,
                     last_reconciled_at = ?2
                 WHERE id = ?3",
                params![error, now, id.to_string()],
            )
            .map_err(CoordinatorError::storage)?;
        if updated == 0 {
            return Err(CoordinatorError::NotFound(format!("instance {id}")));
        }
        Ok(())
    }

    fn bump_restart_count(&self, id: Uuid) -> Result<u32> {
        let conn = self.lock()?;
        let now = now_ts();
        conn.execute(
            "UPDATE instances SET restart_count = restart_count + 1, updated_at = ?1
             WHERE id = ?2",
            params![now, id.to_string()],
        )
        .map_err(CoordinatorError::storage)?;
        let count: i64 = conn
            .query_row(
                "SELECT restart_count FROM instances WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(CoordinatorError::storage)?
            .ok_or_else(|| CoordinatorError::NotFound(format!("instance {id}")))?;
        Ok(count as u32)
    }

    fn touch_reconciled(&self, id: Uuid) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE instances SET last_reconciled_at = ?1 WHERE id = ?2",
            params![now_ts(), id.to_string()],
        )
        .map_err(CoordinatorError::storage)?;
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(CoordinatorError::storage)?;
        Ok(())
    }

    fn insert_task(&self, task: &LifecycleTask) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (id, instance_id, kind, status, attempts, last_error,
                                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.id.to_string(),
                task.instance_id.to_string(),
                task.kind.as_str(),
                task.status.as_str(),
                task.attempts,
                task.last_error,
                ts(&task.created_at),
                ts(&task.updated_at),
            ],
        )
        .map_err(CoordinatorError::storage)?;
        Ok(())
    }

    fn get_task(&self, id: Uuid) -> Result<LifecycleTask> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                raw_task,
            )
            .optional()
            .map_err(CoordinatorError::storage)?
            .ok_or_else(|| CoordinatorError::NotFound(format!("task {id}")))?;
        raw.into_task()
    }

    fn claim_task(&self, id: Uuid) -> Result<Option<LifecycleTask>> {
        let conn = self.lock()?;
        let claimed = conn
            .execute(
                "UPDATE tasks SET status = 'in-flight', attempts = attempts + 1,
                                  updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now_ts(), id.to_string()],
            )
            .map_err(CoordinatorError::storage)?;
        if claimed == 0 {
            return Ok(None);
        }
        let raw = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                raw_task,
            )
            .map_err(CoordinatorError::storage)?;
        raw.into_task().map(Some)
    }

    fn complete_task(&self, id: Uuid) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tasks SET status = 'succeeded', updated_at = ?1 WHERE id = ?2",
            params![now_ts(), id.to_string()],
        )
        .map_err(CoordinatorError::storage)?;
        Ok(())
    }

    fn retry_task(&self, id: Uuid, error: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tasks SET status = 'pending', last_error = ?1, updated_at = ?2
             WHERE id = ?3",
            params![error, now_ts(), id.to_string()],
        )
        .map_err(CoordinatorError::storage)?;
        Ok(())
    }

    fn fail_task(&self, id: Uuid, error: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tasks SET status = 'failed', last_error = ?1, updated_at = ?2
             WHERE id = ?3",
            params![error, now_ts(), id.to_string()],
        )
        .map_err(CoordinatorError::storage)?;
        Ok(())
    }

    fn has_active_task(&self, instance_id: Uuid) -> Result<bool> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks
                           WHERE instance_id = ?1 AND status IN ('pending', 'in-flight'))",
            params![instance_id.to_string()],
            |row| row.get(0),
        )
        .map_err(CoordinatorError::storage)
    }

    fn list_tasks(&self, instance_id: Uuid, limit: usize) -> Result<Vec<LifecycleTask>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE instance_id = ?1
                 ORDER BY created_at DESC LIMIT ?2"
            ))
            .map_err(CoordinatorError::storage)?;
        let rows = stmt
            .query_map(params![instance_id.to_string(), limit as i64], raw_task)
            .map_err(CoordinatorError::storage)?;
        rows.map(|raw| raw.map_err(CoordinatorError::storage)?.into_task())
            .collect()
    }

    fn pending_task_ids(&self) -> Result<Vec<Uuid>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id FROM tasks WHERE status = 'pending' ORDER BY created_at")
            .map_err(CoordinatorError::storage)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(CoordinatorError::storage)?;
        rows.map(|raw| parse_uuid(&raw.map_err(CoordinatorError::storage)?))
            .collect()
    }

    fn reset_stale_in_flight(&self, older_than: Duration) -> Result<usize> {
        let conn = self.lock()?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| CoordinatorError::Internal(e.to_string()))?;
        let reset = conn
            .execute(
                "UPDATE tasks SET status = 'pending', updated_at = ?1
                 WHERE status = 'in-flight' AND updated_at < ?2",
                params![now_ts(), ts(&cutoff)],
            )
            .map_err(CoordinatorError::storage)?;
        Ok(reset)
    }

    fn append_sample(&self, sample: &ResourceSample) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO samples (instance_id, sampled_at, cpu_percent, memory_bytes, disk_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sample.instance_id.to_string(),
                ts(&sample.sampled_at),
                sample.cpu_percent,
                sample.memory_bytes as i64,
                sample.disk_bytes as i64,
            ],
        )
        .map_err(CoordinatorError::storage)?;
        Ok(())
    }

    fn list_samples(&self, instance_id: Uuid, limit: usize) -> Result<Vec<ResourceSample>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT instance_id, sampled_at, cpu_percent, memory_bytes, disk_bytes
                 FROM samples WHERE instance_id = ?1
                 ORDER BY sampled_at DESC LIMIT ?2",
            )
            .map_err(CoordinatorError::storage)?;
        let rows = stmt
            .query_map(params![instance_id.to_string(), limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(CoordinatorError::storage)?;
        rows.map(|raw| {
            let (instance_id, sampled_at, cpu_percent, memory_bytes, disk_bytes) =
                raw.map_err(CoordinatorError::storage)?;
            Ok(ResourceSample {
                instance_id: parse_uuid(&instance_id)?,
                sampled_at: parse_ts(&sampled_at)?,
                cpu_percent,
                memory_bytes: memory_bytes as u64,
                disk_bytes: disk_bytes as u64,
            })
        })
        .collect()
    }

    fn prune_samples(&self, retention: Duration) -> Result<usize> {
        let conn = self.lock()?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|e| CoordinatorError::Internal(e.to_string()))?;
        let pruned = conn
            .execute(
                "DELETE FROM samples WHERE sampled_at < ?1",
                params![ts(&cutoff)],
            )
            .map_err(CoordinatorError::storage)?;
        Ok(pruned)
    }
}
