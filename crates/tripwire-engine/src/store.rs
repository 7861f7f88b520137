use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};

use tripwire_core::action::ActionKind;
use tripwire_core::error::{Result, TripwireError};
use tripwire_core::traits::{RunStore, StoredFlow};
use tripwire_core::types::*;

/// Run store backed by SQLite.
///
/// Terminal runs live in `runs` (plus `node_results` for statistics);
/// in-flight runs live in `checkpoints` until appended.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flows (
        flow_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        definition TEXT NOT NULL,
        saved_at TEXT NOT NULL,
        PRIMARY KEY (flow_id, version)
    );

    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        flow_id TEXT NOT NULL,
        flow_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        simulated INTEGER NOT NULL DEFAULT 0,
        record TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_flow ON runs(flow_id, started_at DESC);

    CREATE TABLE IF NOT EXISTS node_results (
        run_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        action TEXT NOT NULL,
        status TEXT NOT NULL,
        simulated INTEGER NOT NULL DEFAULT 0,
        finished_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_node_results_action ON node_results(action, finished_at);

    CREATE TABLE IF NOT EXISTS checkpoints (
        run_id TEXT PRIMARY KEY,
        flow_id TEXT NOT NULL,
        flow_version INTEGER NOT NULL,
        record TEXT NOT NULL,
        walk TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
";

fn db_err(e: impl std::fmt::Display) -> TripwireError {
    TripwireError::Database(e.to_string())
}

/// Fixed-width timestamps so text comparison orders correctly.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SqliteRunStore {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn checkpoints_where(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<RunCheckpoint>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (record, walk, updated_at) = row.map_err(db_err)?;
            out.push(RunCheckpoint {
                record: serde_json::from_str(&record)?,
                walk: serde_json::from_str(&walk)?,
                updated_at: parse_ts(&updated_at),
            });
        }
        Ok(out)
    }
}

impl RunStore for SqliteRunStore {
    fn checkpoint(&self, cp: &RunCheckpoint) -> BoxFuture<'_, Result<()>> {
        let encoded = serde_json::to_string(&cp.record)
            .and_then(|r| serde_json::to_string(&cp.walk).map(|w| (r, w)));
        let run_id = cp.record.run_id.to_string();
        let flow_id = cp.record.flow_id.to_string();
        let version = cp.record.flow_version as i64;
        let updated_at = ts(&cp.updated_at);

        Box::pin(async move {
            let (record, walk) = encoded?;
            let conn = self.conn.lock().map_err(db_err)?;
            let already_final: bool = conn
                .query_row("SELECT 1 FROM runs WHERE run_id = ?1", params![run_id], |_| Ok(true))
                .optional()
                .map_err(db_err)?
                .unwrap_or(false);
            if already_final {
                return Err(TripwireError::DuplicateRun(run_id));
            }
            conn.execute(
                "INSERT INTO checkpoints (run_id, flow_id, flow_version, record, walk, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(run_id) DO UPDATE SET
                     record = excluded.record,
                     walk = excluded.walk,
                     updated_at = excluded.updated_at",
                params![run_id, flow_id, version, record, walk, updated_at],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn append(&self, record: &RunRecord) -> BoxFuture<'_, Result<()>> {
        let encoded = serde_json::to_string(record);
        let record = record.clone();

        Box::pin(async move {
            let json = encoded?;
            let run_id = record.run_id.to_string();
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;

            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO runs (run_id, flow_id, flow_version, status, started_at, finished_at, simulated, record)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        run_id,
                        record.flow_id.as_str(),
                        record.flow_version as i64,
                        record.status.as_str(),
                        ts(&record.started_at),
                        record.finished_at.as_ref().map(ts),
                        record.simulated,
                        json,
                    ],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                return Err(TripwireError::DuplicateRun(run_id));
            }

            for r in &record.node_results {
                tx.execute(
                    "INSERT INTO node_results (run_id, node_id, action, status, simulated, finished_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        run_id,
                        r.node_id,
                        r.action.as_str(),
                        r.status.as_str(),
                        r.simulated || record.simulated,
                        ts(&r.finished_at),
                    ],
                )
                .map_err(db_err)?;
            }

            tx.execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id])
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
    }

    fn get(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>> {
        let run_id = run_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT record FROM runs WHERE run_id = ?1
                     UNION ALL
                     SELECT record FROM checkpoints WHERE run_id = ?1
                     LIMIT 1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            match json {
                Some(j) => Ok(Some(serde_json::from_str(&j)?)),
                None => Ok(None),
            }
        })
    }

    fn list(&self, flow_id: &FlowId, filter: &RunFilter) -> BoxFuture<'_, Result<Vec<RunRecord>>> {
        let flow_id = flow_id.to_string();
        let filter = filter.clone();
        Box::pin(async move {
            let mut records: Vec<RunRecord> = {
                let conn = self.conn.lock().map_err(db_err)?;
                let mut stmt = conn
                    .prepare(
                        "SELECT record FROM runs WHERE flow_id = ?1
                         UNION ALL
                         SELECT record FROM checkpoints WHERE flow_id = ?1",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![flow_id], |row| row.get::<_, String>(0))
                    .map_err(db_err)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(serde_json::from_str::<RunRecord>(&row.map_err(db_err)?)?);
                }
                out
            };

            records.retain(|r| {
                filter.status.map_or(true, |s| r.status == s)
                    && filter.version.map_or(true, |v| r.flow_version == v)
                    && filter.since.map_or(true, |t| r.started_at >= t)
            });
            records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            if let Some(limit) = filter.limit {
                records.truncate(limit);
            }
            Ok(records)
        })
    }

    fn load_checkpoint(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunCheckpoint>>> {
        let run_id = run_id.0.clone();
        Box::pin(async move {
            let mut found = self.checkpoints_where(
                "SELECT record, walk, updated_at FROM checkpoints WHERE run_id = ?1",
                &[&run_id],
            )?;
            Ok(found.pop())
        })
    }

    fn in_flight(&self) -> BoxFuture<'_, Result<Vec<RunCheckpoint>>> {
        Box::pin(async move {
            self.checkpoints_where(
                "SELECT record, walk, updated_at FROM checkpoints ORDER BY updated_at",
                &[],
            )
        })
    }

    fn action_stats(
        &self,
        kind: ActionKind,
        since: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<(u64, u64)>> {
        let since = since.as_ref().map(ts).unwrap_or_default();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT status, COUNT(*) FROM node_results
                     WHERE action = ?1 AND simulated = 0 AND finished_at >= ?2
                       AND status IN ('succeeded', 'failed')
                     GROUP BY status",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![kind.as_str(), since], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(db_err)?;

            let (mut succeeded, mut failed) = (0u64, 0u64);
            for row in rows {
                let (status, count) = row.map_err(db_err)?;
                match status.as_str() {
                    "succeeded" => succeeded = count as u64,
                    _ => failed = count as u64,
                }
            }
            Ok((succeeded, failed))
        })
    }

    fn has_history(&self, flow_id: &FlowId, version: u64) -> BoxFuture<'_, Result<bool>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM runs WHERE flow_id = ?1 AND flow_version = ?2
                     UNION ALL
                     SELECT 1 FROM checkpoints WHERE flow_id = ?1 AND flow_version = ?2
                     LIMIT 1",
                    params![flow_id, version as i64],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            Ok(found.is_some())
        })
    }

    fn save_flow(&self, flow: StoredFlow) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let definition = serde_json::to_string(&flow.definition)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO flows (flow_id, version, definition, saved_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(flow_id, version) DO UPDATE SET
                     definition = excluded.definition,
                     saved_at = excluded.saved_at",
                params![flow.flow_id.as_str(), flow.version as i64, definition, ts(&Utc::now())],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_flows(&self) -> BoxFuture<'_, Result<Vec<StoredFlow>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare("SELECT flow_id, version, definition FROM flows ORDER BY flow_id, version")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(db_err)?;

            let mut out = Vec::new();
            for row in rows {
                let (flow_id, version, definition) = row.map_err(db_err)?;
                out.push(StoredFlow {
                    flow_id: FlowId(flow_id),
                    version: version as u64,
                    definition: serde_json::from_str(&definition)?,
                });
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(flow: &str, version: u64) -> RunRecord {
        RunRecord::new(FlowId::from_string(flow), version, "t", false)
    }

    fn result(node: &str, action: ActionKind, status: NodeStatus) -> NodeResult {
        NodeResult {
            node_id: node.into(),
            action,
            status,
            detail: "ok".into(),
            confidence: Some(90),
            gate: None,
            simulated: false,
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn checkpoint_then_append_moves_run() {
        let store = SqliteRunStore::in_memory().unwrap();
        let mut rec = record("f", 1);
        rec.status = RunStatus::Running;
        store
            .checkpoint(&RunCheckpoint {
                record: rec.clone(),
                walk: serde_json::json!({"cursor": 1}),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let inflight = store.in_flight().await.unwrap();
        assert_eq!(inflight.len(), 1);
        assert_eq!(inflight[0].walk["cursor"], 1);
        let loaded = store.load_checkpoint(&rec.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.record.run_id, rec.run_id);
        assert_eq!(
            store.get(&rec.run_id).await.unwrap().unwrap().status,
            RunStatus::Running
        );

        rec.finish(RunStatus::Completed, None);
        store.append(&rec).await.unwrap();
        assert!(store.in_flight().await.unwrap().is_empty());
        assert!(store.load_checkpoint(&rec.run_id).await.unwrap().is_none());
        assert_eq!(
            store.get(&rec.run_id).await.unwrap().unwrap().status,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn duplicate_append_is_rejected() {
        let store = SqliteRunStore::in_memory().unwrap();
        let mut rec = record("f", 1);
        rec.finish(RunStatus::Completed, None);
        store.append(&rec).await.unwrap();
        let err = store.append(&rec).await.unwrap_err();
        assert!(matches!(err, TripwireError::DuplicateRun(_)));

        // A finished run cannot be checkpointed back into flight either.
        let err = store
            .checkpoint(&RunCheckpoint {
                record: rec.clone(),
                walk: serde_json::Value::Null,
                updated_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TripwireError::DuplicateRun(_)));
    }

    #[tokio::test]
    async fn list_filters_and_orders() {
        let store = SqliteRunStore::in_memory().unwrap();
        let mut old = record("f", 1);
        old.started_at = Utc::now() - Duration::hours(2);
        old.finish(RunStatus::Failed, None);
        let mut new = record("f", 2);
        new.finish(RunStatus::Completed, None);
        let other = {
            let mut r = record("g", 1);
            r.finish(RunStatus::Completed, None);
            r
        };
        for r in [&old, &new, &other] {
            store.append(r).await.unwrap();
        }

        let all = store.list(&FlowId::from_string("f"), &RunFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].run_id, new.run_id);

        let failed = store
            .list(
                &FlowId::from_string("f"),
                &RunFilter {
                    status: Some(RunStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);

        let recent = store
            .list(
                &FlowId::from_string("f"),
                &RunFilter {
                    since: Some(Utc::now() - Duration::hours(1)),
                    limit: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].flow_version, 2);
    }

    #[tokio::test]
    async fn action_stats_ignore_simulated_and_skipped() {
        let store = SqliteRunStore::in_memory().unwrap();
        let mut live = record("f", 1);
        live.node_results = vec![
            result("a", ActionKind::SwitchRegion, NodeStatus::Succeeded),
            result("b", ActionKind::SwitchRegion, NodeStatus::Failed),
            result("c", ActionKind::SwitchRegion, NodeStatus::Skipped),
            result("d", ActionKind::Notification, NodeStatus::Succeeded),
        ];
        live.finish(RunStatus::Failed, None);
        store.append(&live).await.unwrap();

        let mut sim = RunRecord::new(FlowId::from_string("f"), 1, "t", true);
        sim.node_results = vec![result("a", ActionKind::SwitchRegion, NodeStatus::Succeeded)];
        sim.finish(RunStatus::Completed, None);
        store.append(&sim).await.unwrap();

        assert_eq!(store.action_stats(ActionKind::SwitchRegion, None).await.unwrap(), (1, 1));
        assert_eq!(store.action_stats(ActionKind::Notification, None).await.unwrap(), (1, 0));
        let future = Utc::now() + Duration::hours(1);
        assert_eq!(
            store.action_stats(ActionKind::SwitchRegion, Some(future)).await.unwrap(),
            (0, 0)
        );
    }

    #[tokio::test]
    async fn history_and_flows() {
        let store = SqliteRunStore::in_memory().unwrap();
        let flow = FlowId::from_string("f");
        assert!(!store.has_history(&flow, 1).await.unwrap());
        let mut rec = record("f", 1);
        rec.finish(RunStatus::Completed, None);
        store.append(&rec).await.unwrap();
        assert!(store.has_history(&flow, 1).await.unwrap());
        assert!(!store.has_history(&flow, 2).await.unwrap());

        for version in [2, 1] {
            store
                .save_flow(StoredFlow {
                    flow_id: flow.clone(),
                    version,
                    definition: serde_json::json!({"version": version}),
                })
                .await
                .unwrap();
        }
        let flows = store.load_flows().await.unwrap();
        assert_eq!(flows.iter().map(|f| f.version).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tripwire.db");
        let store = SqliteRunStore::open(&path).unwrap();
        assert!(store.in_flight().await.unwrap().is_empty());
        assert!(path.exists());
    }
}
