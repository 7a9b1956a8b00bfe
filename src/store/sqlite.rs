use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use rusqlite::types::Type;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_rusqlite::Connection;

use crate::error::StoreError;
use crate::model::{Collection, DataFile, ExecutionPlan, Plan, RunHistory, RunningPlan};

use super::{ExecutionStore, LaunchCounts};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS collection (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        project_id INTEGER NOT NULL,
        data TEXT NOT NULL,
        csv_split INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS execution_plan (
        collection_id INTEGER NOT NULL,
        plan_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        engines INTEGER NOT NULL,
        concurrency INTEGER NOT NULL,
        rampup INTEGER NOT NULL,
        duration INTEGER NOT NULL,
        csv_split INTEGER NOT NULL,
        PRIMARY KEY (collection_id, plan_id)
    );
    CREATE TABLE IF NOT EXISTS plan (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        project_id INTEGER NOT NULL,
        test_file TEXT,
        data TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS running_plan (
        collection_id INTEGER NOT NULL,
        plan_id INTEGER NOT NULL,
        started_time INTEGER NOT NULL,
        PRIMARY KEY (collection_id, plan_id)
    );
    CREATE TABLE IF NOT EXISTS collection_run (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        collection_id INTEGER NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS collection_run_history (
        run_id INTEGER PRIMARY KEY,
        collection_id INTEGER NOT NULL,
        started_time INTEGER NOT NULL,
        end_time INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_run_history_collection
        ON collection_run_history(collection_id);
    CREATE TABLE IF NOT EXISTS collection_launch (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        collection_id INTEGER NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS collection_launch_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        collection_id INTEGER NOT NULL,
        owner TEXT NOT NULL,
        context TEXT NOT NULL,
        engines INTEGER NOT NULL,
        nodes INTEGER NOT NULL,
        virtual_users INTEGER NOT NULL,
        started_time INTEGER NOT NULL,
        end_time INTEGER
    );";

/// SQLite-backed store shared by every controller replica pointed at the same file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened or the schema fails.
    pub async fn open<P>(path: P) -> Result<Self, StoreError>
    where
        P: AsRef<Path>,
    {
        let conn = Connection::open(path)
            .await
            .map_err(sqlite("open sqlite store"))?;
        Self::with_schema(conn).await
    }

    /// # Errors
    ///
    /// Returns an error when the schema cannot be applied.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(sqlite("open in-memory sqlite store"))?;
        Self::with_schema(conn).await
    }

    async fn with_schema(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(sqlite("initialize sqlite store"))?;
        Ok(Self { conn })
    }
}

fn sqlite(context: &'static str) -> impl FnOnce(tokio_rusqlite::Error) -> StoreError {
    move |source| StoreError::Sqlite { context, source }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_json<T: Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
}

fn from_json<T: DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn timestamp(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(
        idx, millis,
    ))
}

fn collection_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Collection> {
    let data: String = row.get(3)?;
    Ok(Collection {
        id: row.get(0)?,
        name: row.get(1)?,
        project_id: row.get(2)?,
        data: from_json(3, &data)?,
        csv_split: row.get(4)?,
    })
}

fn execution_plan_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionPlan> {
    let engines: i64 = row.get(2)?;
    Ok(ExecutionPlan {
        plan_id: row.get(0)?,
        name: row.get(1)?,
        engines: usize::try_from(engines)
            .map_err(|_err| rusqlite::Error::IntegralValueOutOfRange(2, engines))?,
        concurrency: row.get(3)?,
        rampup: row.get(4)?,
        duration: row.get(5)?,
        csv_split: row.get(6)?,
    })
}

fn running_plan_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunningPlan> {
    Ok(RunningPlan {
        collection_id: row.get(0)?,
        plan_id: row.get(1)?,
        started_time: timestamp(2, row.get(2)?)?,
    })
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunHistory> {
    let end_time: Option<i64> = row.get(3)?;
    Ok(RunHistory {
        run_id: row.get(0)?,
        collection_id: row.get(1)?,
        started_time: timestamp(2, row.get(2)?)?,
        end_time: end_time.map(|millis| timestamp(3, millis)).transpose()?,
    })
}

const EXECUTION_PLAN_COLUMNS: &str =
    "plan_id, name, engines, concurrency, rampup, duration, csv_split";

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn put_collection(&self, collection: &Collection) -> Result<(), StoreError> {
        let collection = collection.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO collection (id, name, project_id, data, csv_split)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        collection.id,
                        collection.name,
                        collection.project_id,
                        to_json(&collection.data)?,
                        collection.csv_split
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(sqlite("put collection"))
    }

    async fn get_collection(&self, collection_id: i64) -> Result<Collection, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, name, project_id, data, csv_split FROM collection WHERE id = ?1",
                        [collection_id],
                        collection_from_row,
                    )
                    .optional()?)
            })
            .await
            .map_err(sqlite("get collection"))?
            .ok_or_else(|| StoreError::not_found("collection", collection_id))
    }

    async fn delete_collection(&self, collection_id: i64) -> Result<(), StoreError> {
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let removed = tx.execute("DELETE FROM collection WHERE id = ?1", [collection_id])?;
                tx.execute(
                    "DELETE FROM execution_plan WHERE collection_id = ?1",
                    [collection_id],
                )?;
                tx.commit()?;
                Ok(removed)
            })
            .await
            .map_err(sqlite("delete collection"))?;
        if removed == 0 {
            return Err(StoreError::not_found("collection", collection_id));
        }
        Ok(())
    }

    async fn put_execution_plan(
        &self,
        collection_id: i64,
        plan: &ExecutionPlan,
    ) -> Result<(), StoreError> {
        let plan = plan.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO execution_plan
                     (collection_id, plan_id, name, engines, concurrency, rampup, duration, csv_split)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        collection_id,
                        plan.plan_id,
                        plan.name,
                        clamp_i64(plan.engines as u64),
                        plan.concurrency,
                        plan.rampup,
                        plan.duration,
                        plan.csv_split
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(sqlite("put execution plan"))
    }

    async fn replace_execution_plans(
        &self,
        collection_id: i64,
        plans: &[ExecutionPlan],
    ) -> Result<(), StoreError> {
        let plans = plans.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM execution_plan WHERE collection_id = ?1",
                    [collection_id],
                )?;
                for plan in &plans {
                    tx.execute(
                        "INSERT INTO execution_plan
                         (collection_id, plan_id, name, engines, concurrency, rampup, duration, csv_split)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        rusqlite::params![
                            collection_id,
                            plan.plan_id,
                            plan.name,
                            clamp_i64(plan.engines as u64),
                            plan.concurrency,
                            plan.rampup,
                            plan.duration,
                            plan.csv_split
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(sqlite("replace execution plans"))
    }

    async fn execution_plans(&self, collection_id: i64) -> Result<Vec<ExecutionPlan>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM execution_plan WHERE collection_id = ?1 ORDER BY plan_id",
                    EXECUTION_PLAN_COLUMNS
                ))?;
                let plans = stmt
                    .query_map([collection_id], execution_plan_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(plans)
            })
            .await
            .map_err(sqlite("list execution plans"))
    }

    async fn execution_plan(
        &self,
        collection_id: i64,
        plan_id: i64,
    ) -> Result<ExecutionPlan, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM execution_plan WHERE collection_id = ?1 AND plan_id = ?2",
                            EXECUTION_PLAN_COLUMNS
                        ),
                        [collection_id, plan_id],
                        execution_plan_from_row,
                    )
                    .optional()?)
            })
            .await
            .map_err(sqlite("get execution plan"))?
            .ok_or_else(|| {
                StoreError::not_found("execution plan", format!("{}/{}", collection_id, plan_id))
            })
    }

    async fn put_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        let plan = plan.clone();
        self.conn
            .call(move |conn| {
                let test_file = plan.test_file.as_ref().map(to_json).transpose()?;
                conn.execute(
                    "INSERT OR REPLACE INTO plan (id, name, project_id, test_file, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        plan.id,
                        plan.name,
                        plan.project_id,
                        test_file,
                        to_json(&plan.data)?
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(sqlite("put plan"))
    }

    async fn get_plan(&self, plan_id: i64) -> Result<Plan, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, name, project_id, test_file, data FROM plan WHERE id = ?1",
                        [plan_id],
                        |row| {
                            let test_file: Option<String> = row.get(3)?;
                            let data: String = row.get(4)?;
                            Ok(Plan {
                                id: row.get(0)?,
                                name: row.get(1)?,
                                project_id: row.get(2)?,
                                test_file: test_file
                                    .map(|text| from_json::<DataFile>(3, &text))
                                    .transpose()?,
                                data: from_json(4, &data)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await
            .map_err(sqlite("get plan"))?
            .ok_or_else(|| StoreError::not_found("plan", plan_id))
    }

    async fn add_running_plan(&self, collection_id: i64, plan_id: i64) -> Result<(), StoreError> {
        let started = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO running_plan (collection_id, plan_id, started_time)
                     VALUES (?1, ?2, ?3)",
                    [collection_id, plan_id, started],
                )?;
                Ok(())
            })
            .await
            .map_err(sqlite("add running plan"))
    }

    async fn delete_running_plan(
        &self,
        collection_id: i64,
        plan_id: i64,
    ) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM running_plan WHERE collection_id = ?1 AND plan_id = ?2",
                    [collection_id, plan_id],
                )?;
                Ok(())
            })
            .await
            .map_err(sqlite("delete running plan"))
    }

    async fn running_plans(&self) -> Result<Vec<RunningPlan>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT collection_id, plan_id, started_time FROM running_plan
                     ORDER BY collection_id, plan_id",
                )?;
                let plans = stmt
                    .query_map([], running_plan_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(plans)
            })
            .await
            .map_err(sqlite("list running plans"))
    }

    async fn running_plans_by_collection(
        &self,
        collection_id: i64,
    ) -> Result<Vec<RunningPlan>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT collection_id, plan_id, started_time FROM running_plan
                     WHERE collection_id = ?1 ORDER BY plan_id",
                )?;
                let plans = stmt
                    .query_map([collection_id], running_plan_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(plans)
            })
            .await
            .map_err(sqlite("list running plans by collection"))
    }

    async fn running_plan(
        &self,
        collection_id: i64,
        plan_id: i64,
    ) -> Result<RunningPlan, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT collection_id, plan_id, started_time FROM running_plan
                         WHERE collection_id = ?1 AND plan_id = ?2",
                        [collection_id, plan_id],
                        running_plan_from_row,
                    )
                    .optional()?)
            })
            .await
            .map_err(sqlite("get running plan"))?
            .ok_or_else(|| {
                StoreError::not_found("running plan", format!("{}/{}", collection_id, plan_id))
            })
    }

    async fn has_running_plan(&self, collection_id: i64) -> Result<bool, StoreError> {
        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM running_plan WHERE collection_id = ?1",
                    [collection_id],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(sqlite("check running plans"))
    }

    async fn start_run(&self, collection_id: i64) -> Result<i64, StoreError> {
        let run_id = self
            .conn
            .call(move |conn| {
                match conn.execute(
                    "INSERT INTO collection_run (collection_id) VALUES (?1)",
                    [collection_id],
                ) {
                    Ok(_) => Ok(Some(conn.last_insert_rowid())),
                    Err(err) if is_constraint_violation(&err) => Ok(None),
                    Err(err) => Err(err.into()),
                }
            })
            .await
            .map_err(sqlite("start run"))?;
        run_id.ok_or(StoreError::RunInProgress { collection_id })
    }

    async fn stop_run(&self, collection_id: i64) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM collection_run WHERE collection_id = ?1",
                    [collection_id],
                )?;
                Ok(())
            })
            .await
            .map_err(sqlite("stop run"))
    }

    async fn current_run(&self, collection_id: i64) -> Result<Option<i64>, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id FROM collection_run WHERE collection_id = ?1",
                        [collection_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await
            .map_err(sqlite("get current run"))
    }

    async fn new_run(&self, collection_id: i64, run_id: i64) -> Result<(), StoreError> {
        let started = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO collection_run_history
                     (run_id, collection_id, started_time, end_time) VALUES (?1, ?2, ?3, NULL)",
                    [run_id, collection_id, started],
                )?;
                Ok(())
            })
            .await
            .map_err(sqlite("record run"))
    }

    async fn run_finish(&self, collection_id: i64, run_id: i64) -> Result<(), StoreError> {
        let finished = Utc::now().timestamp_millis();
        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE collection_run_history SET end_time = ?1
                     WHERE run_id = ?2 AND collection_id = ?3",
                    [finished, run_id, collection_id],
                )?)
            })
            .await
            .map_err(sqlite("finish run"))?;
        if updated == 0 {
            return Err(StoreError::not_found("run", run_id));
        }
        Ok(())
    }

    async fn last_run(&self, collection_id: i64) -> Result<Option<RunHistory>, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT run_id, collection_id, started_time, end_time
                         FROM collection_run_history WHERE collection_id = ?1
                         ORDER BY run_id DESC LIMIT 1",
                        [collection_id],
                        run_from_row,
                    )
                    .optional()?)
            })
            .await
            .map_err(sqlite("get last run"))
    }

    async fn get_run(&self, run_id: i64) -> Result<RunHistory, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT run_id, collection_id, started_time, end_time
                         FROM collection_run_history WHERE run_id = ?1",
                        [run_id],
                        run_from_row,
                    )
                    .optional()?)
            })
            .await
            .map_err(sqlite("get run"))?
            .ok_or_else(|| StoreError::not_found("run", run_id))
    }

    async fn new_launch_entry(
        &self,
        collection_id: i64,
        owner: &str,
        context: &str,
        counts: LaunchCounts,
    ) -> Result<(), StoreError> {
        let owner = owner.to_owned();
        let context = context.to_owned();
        let started = Utc::now().timestamp_millis();
        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                match tx.execute(
                    "INSERT INTO collection_launch (collection_id) VALUES (?1)",
                    [collection_id],
                ) {
                    Ok(_) => {}
                    Err(err) if is_constraint_violation(&err) => return Ok(false),
                    Err(err) => return Err(err.into()),
                }
                tx.execute(
                    "INSERT INTO collection_launch_history
                     (collection_id, owner, context, engines, nodes, virtual_users, started_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        collection_id,
                        owner,
                        context,
                        clamp_i64(counts.engines),
                        clamp_i64(counts.nodes),
                        clamp_i64(counts.virtual_users),
                        started
                    ],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await
            .map_err(sqlite("record launch"))?;
        if !inserted {
            return Err(StoreError::LaunchInProgress { collection_id });
        }
        Ok(())
    }

    async fn mark_usage_finished(
        &self,
        collection_id: i64,
        context: &str,
        virtual_users: u64,
    ) -> Result<(), StoreError> {
        let context = context.to_owned();
        let finished = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE collection_launch_history SET end_time = ?1, virtual_users = ?2
                     WHERE collection_id = ?3 AND context = ?4 AND end_time IS NULL",
                    rusqlite::params![finished, clamp_i64(virtual_users), collection_id, context],
                )?;
                tx.execute(
                    "DELETE FROM collection_launch WHERE collection_id = ?1",
                    [collection_id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(sqlite("finish launch"))
    }
}

impl SqliteStore {
    /// Launch rows still open for a collection, with their virtual user counts.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn open_launch_users(&self, collection_id: i64) -> Result<Vec<u64>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT virtual_users FROM collection_launch_history
                     WHERE collection_id = ?1 AND end_time IS NULL",
                )?;
                let rows = stmt
                    .query_map([collection_id], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows.into_iter().map(to_u64).collect())
            })
            .await
            .map_err(sqlite("list open launches"))
    }
}
