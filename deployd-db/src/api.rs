use std::{str::FromStr, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use deployd_common::{
    task::{AppendLogParams, ListFilter, Task, TaskLogEntry, TaskRepository, TaskStatus},
    PrepareParams, PrepareResult,
};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ActiveValue, ColumnTrait, Condition, ConnectionTrait,
    DatabaseBackend, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    Statement, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    entities::{runtime_deploy_task, runtime_deploy_task_log},
    migration::Migrator,
};

const CLAIM_CANDIDATES: u64 = 16;

const POSTGRES_NOW_MICROS: &str =
    "SELECT CAST(EXTRACT(EPOCH FROM clock_timestamp()) * 1000000 AS BIGINT) AS now_micros";
const SQLITE_NOW_MICROS: &str =
    "SELECT CAST((julianday('now') - 2440587.5) * 86400000000 AS INTEGER) AS now_micros";

#[derive(Clone)]
pub struct DbApi {
    pub conn: DatabaseConnection,
    pub pool: Option<PgPool>,
    /// Query returning the database clock as unix microseconds.
    /// Lease deadlines are always computed against it, never the worker's clock.
    now_query: &'static str,
}

async fn connect_db(conn_url: &str) -> Result<sqlx::PgPool> {
    let pool: sqlx::PgPool = sqlx::pool::PoolOptions::new()
        .max_connections(100)
        .connect(conn_url)
        .await?;
    Ok(pool)
}

fn now() -> DateTime<FixedOffset> {
    Utc::now().fixed_offset()
}

fn now_query(backend: DatabaseBackend) -> &'static str {
    match backend {
        DatabaseBackend::Sqlite => SQLITE_NOW_MICROS,
        _ => POSTGRES_NOW_MICROS,
    }
}

fn lease_deadline(now: DateTime<FixedOffset>, ttl: Duration) -> Result<DateTime<FixedOffset>> {
    Ok(now + chrono::Duration::from_std(ttl)?)
}

fn status_value(status: TaskStatus) -> String {
    status.to_string()
}

/// Pending tasks, or running tasks whose lease ran out.
fn claimable(now: DateTime<FixedOffset>) -> Condition {
    Condition::any()
        .add(runtime_deploy_task::Column::Status.eq(status_value(TaskStatus::Pending)))
        .add(
            Condition::all()
                .add(runtime_deploy_task::Column::Status.eq(status_value(TaskStatus::Running)))
                .add(
                    Condition::any()
                        .add(runtime_deploy_task::Column::LeaseUntil.is_null())
                        .add(runtime_deploy_task::Column::LeaseUntil.lt(now)),
                ),
        )
}

/// The caller still holds an unexpired lease on `run_id`.
fn held_lease(run_id: &str, lease_owner: &str, now: DateTime<FixedOffset>) -> Condition {
    Condition::all()
        .add(runtime_deploy_task::Column::RunId.eq(run_id))
        .add(runtime_deploy_task::Column::LeaseOwner.eq(lease_owner))
        .add(runtime_deploy_task::Column::Status.eq(status_value(TaskStatus::Running)))
        .add(runtime_deploy_task::Column::LeaseUntil.gt(now))
}

fn to_task(model: runtime_deploy_task::Model, logs: Vec<TaskLogEntry>) -> Result<Task> {
    let status = TaskStatus::from_str(&model.status).map_err(|_| {
        anyhow!(
            "runtime deploy task {} has unknown status {}",
            model.run_id,
            model.status
        )
    })?;
    Ok(Task {
        run_id: model.run_id,
        runtime_mode: model.runtime_mode,
        namespace: model.namespace,
        target_env: model.target_env,
        slot_no: model.slot_no,
        repository_full_name: model.repository_full_name,
        services_yaml_path: model.services_yaml_path,
        build_ref: model.build_ref,
        deploy_only: model.deploy_only,
        status,
        lease_owner: model.lease_owner,
        lease_until: model.lease_until,
        attempts: model.attempts,
        last_error: model.last_error,
        result_namespace: model.result_namespace,
        result_target_env: model.result_target_env,
        created_at: model.created_at,
        updated_at: model.updated_at,
        started_at: model.started_at,
        finished_at: model.finished_at,
        logs,
    })
}

impl DbApi {
    pub async fn new(conn_url: &str, no_migration: bool) -> Result<Self> {
        let pool = connect_db(conn_url).await?;
        let conn = sea_orm::SqlxPostgresConnector::from_sqlx_postgres_pool(pool.clone());
        let db = DbApi::from_connection(conn, Some(pool));
        if !no_migration {
            db.migrate().await?;
        }
        Ok(db)
    }

    pub fn from_connection(conn: DatabaseConnection, pool: Option<PgPool>) -> Self {
        let now_query = now_query(conn.get_database_backend());
        DbApi {
            conn,
            pool,
            now_query,
        }
    }

    async fn migrate(&self) -> Result<()> {
        Migrator::up(&self.conn, None).await?;
        Ok(())
    }

    /// Current time as seen by the database.
    async fn db_now(&self) -> Result<DateTime<FixedOffset>> {
        let row = self
            .conn
            .query_one(Statement::from_string(
                self.conn.get_database_backend(),
                self.now_query,
            ))
            .await?
            .ok_or_else(|| anyhow!("read database clock: no row returned"))?;
        let micros: i64 = row.try_get("", "now_micros")?;
        let now = DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| anyhow!("read database clock: {micros} is out of range"))?;
        Ok(now.fixed_offset())
    }

    async fn get_task_logs(&self, run_id: &str) -> Result<Vec<TaskLogEntry>> {
        let logs = runtime_deploy_task_log::Entity::find()
            .filter(runtime_deploy_task_log::Column::RunId.eq(run_id))
            .order_by_asc(runtime_deploy_task_log::Column::CreatedAt)
            .all(&self.conn)
            .await?
            .into_iter()
            .map(|log| TaskLogEntry {
                stage: log.stage,
                level: log.level,
                message: log.message,
                created_at: log.created_at,
            })
            .collect();
        Ok(logs)
    }

    async fn task_with_logs(&self, model: runtime_deploy_task::Model) -> Result<Task> {
        let logs = self.get_task_logs(&model.run_id).await?;
        to_task(model, logs)
    }

    async fn trim_task_logs(&self, run_id: &str, max_lines: u64) -> Result<()> {
        let stale: Vec<Uuid> = runtime_deploy_task_log::Entity::find()
            .select_only()
            .column(runtime_deploy_task_log::Column::Id)
            .filter(runtime_deploy_task_log::Column::RunId.eq(run_id))
            .order_by_desc(runtime_deploy_task_log::Column::CreatedAt)
            .offset(max_lines)
            .into_tuple()
            .all(&self.conn)
            .await?;
        if stale.is_empty() {
            return Ok(());
        }
        runtime_deploy_task_log::Entity::delete_many()
            .filter(runtime_deploy_task_log::Column::Id.is_in(stale))
            .exec(&self.conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for DbApi {
    async fn upsert_desired(&self, params: &PrepareParams) -> Result<Task> {
        let params = params.clone().normalized();
        if params.run_id.is_empty() {
            return Err(anyhow!("upsert runtime deploy task: run_id is required"));
        }

        let txn = self.conn.begin().await?;
        let existing = runtime_deploy_task::Entity::find_by_id(params.run_id.clone())
            .lock_exclusive()
            .one(&txn)
            .await?;
        let now = now();

        let model = match existing {
            None => {
                runtime_deploy_task::ActiveModel {
                    run_id: ActiveValue::Set(params.run_id.clone()),
                    runtime_mode: ActiveValue::Set(params.runtime_mode.clone()),
                    namespace: ActiveValue::Set(params.namespace.clone()),
                    target_env: ActiveValue::Set(params.target_env.clone()),
                    slot_no: ActiveValue::Set(params.slot_no),
                    repository_full_name: ActiveValue::Set(params.repository_full_name.clone()),
                    services_yaml_path: ActiveValue::Set(params.services_yaml_path.clone()),
                    build_ref: ActiveValue::Set(params.build_ref.clone()),
                    deploy_only: ActiveValue::Set(params.deploy_only),
                    status: ActiveValue::Set(status_value(TaskStatus::Pending)),
                    lease_owner: ActiveValue::Set(None),
                    lease_until: ActiveValue::Set(None),
                    attempts: ActiveValue::Set(0),
                    last_error: ActiveValue::Set(None),
                    result_namespace: ActiveValue::Set(None),
                    result_target_env: ActiveValue::Set(None),
                    created_at: ActiveValue::Set(now),
                    updated_at: ActiveValue::Set(now),
                    started_at: ActiveValue::Set(None),
                    finished_at: ActiveValue::Set(None),
                }
                .insert(&txn)
                .await?
            }
            Some(existing) => {
                let task = to_task(existing.clone(), vec![])?;
                if !task.should_reset(&params) {
                    txn.commit().await?;
                    return self.task_with_logs(existing).await;
                }
                let mut active: runtime_deploy_task::ActiveModel = existing.into();
                active.runtime_mode = ActiveValue::Set(params.runtime_mode.clone());
                active.namespace = ActiveValue::Set(params.namespace.clone());
                active.target_env = ActiveValue::Set(params.target_env.clone());
                active.slot_no = ActiveValue::Set(params.slot_no);
                active.repository_full_name =
                    ActiveValue::Set(params.repository_full_name.clone());
                active.services_yaml_path = ActiveValue::Set(params.services_yaml_path.clone());
                active.build_ref = ActiveValue::Set(params.build_ref.clone());
                active.deploy_only = ActiveValue::Set(params.deploy_only);
                active.status = ActiveValue::Set(status_value(TaskStatus::Pending));
                active.lease_owner = ActiveValue::Set(None);
                active.lease_until = ActiveValue::Set(None);
                active.last_error = ActiveValue::Set(None);
                active.result_namespace = ActiveValue::Set(None);
                active.result_target_env = ActiveValue::Set(None);
                active.updated_at = ActiveValue::Set(now);
                active.started_at = ActiveValue::Set(None);
                active.finished_at = ActiveValue::Set(None);
                active.update(&txn).await?
            }
        };
        txn.commit().await?;

        self.task_with_logs(model).await
    }

    async fn get_by_run_id(&self, run_id: &str) -> Result<Option<Task>> {
        let run_id = run_id.trim();
        if run_id.is_empty() {
            return Ok(None);
        }
        let Some(model) = runtime_deploy_task::Entity::find_by_id(run_id.to_string())
            .one(&self.conn)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(self.task_with_logs(model).await?))
    }

    async fn claim_next(&self, lease_owner: &str, lease_ttl: Duration) -> Result<Option<Task>> {
        let lease_owner = lease_owner.trim();
        if lease_owner.is_empty() {
            return Err(anyhow!("claim runtime deploy task: lease_owner is required"));
        }
        let now = now();
        let db_now = self.db_now().await?;
        let lease_until = lease_deadline(db_now, lease_ttl)?;

        let candidates = runtime_deploy_task::Entity::find()
            .filter(claimable(db_now))
            .order_by_asc(runtime_deploy_task::Column::CreatedAt)
            .limit(CLAIM_CANDIDATES)
            .all(&self.conn)
            .await?;

        for candidate in candidates {
            // claimable is re-checked by the update, one concurrent claimer wins
            let result = runtime_deploy_task::Entity::update_many()
                .col_expr(
                    runtime_deploy_task::Column::Status,
                    Expr::value(status_value(TaskStatus::Running)),
                )
                .col_expr(
                    runtime_deploy_task::Column::LeaseOwner,
                    Expr::value(lease_owner),
                )
                .col_expr(
                    runtime_deploy_task::Column::LeaseUntil,
                    Expr::value(lease_until),
                )
                .col_expr(
                    runtime_deploy_task::Column::Attempts,
                    Expr::col(runtime_deploy_task::Column::Attempts).add(1),
                )
                .col_expr(runtime_deploy_task::Column::StartedAt, Expr::value(now))
                .col_expr(
                    runtime_deploy_task::Column::FinishedAt,
                    Expr::value(Option::<DateTime<FixedOffset>>::None),
                )
                .col_expr(runtime_deploy_task::Column::UpdatedAt, Expr::value(now))
                .filter(runtime_deploy_task::Column::RunId.eq(candidate.run_id.as_str()))
                .filter(claimable(db_now))
                .exec(&self.conn)
                .await?;
            if result.rows_affected == 1 {
                return self.get_by_run_id(&candidate.run_id).await;
            }
        }

        Ok(None)
    }

    async fn mark_succeeded(
        &self,
        run_id: &str,
        lease_owner: &str,
        result: &PrepareResult,
    ) -> Result<bool> {
        let run_id = run_id.trim();
        let lease_owner = lease_owner.trim();
        if run_id.is_empty() {
            return Err(anyhow!("mark runtime deploy task succeeded: run_id is required"));
        }
        if lease_owner.is_empty() {
            return Err(anyhow!(
                "mark runtime deploy task succeeded: lease_owner is required"
            ));
        }
        let now = now();
        let db_now = self.db_now().await?;
        let updated = runtime_deploy_task::Entity::update_many()
            .col_expr(
                runtime_deploy_task::Column::Status,
                Expr::value(status_value(TaskStatus::Succeeded)),
            )
            .col_expr(
                runtime_deploy_task::Column::ResultNamespace,
                Expr::value(result.namespace.trim()),
            )
            .col_expr(
                runtime_deploy_task::Column::ResultTargetEnv,
                Expr::value(result.target_env.trim()),
            )
            .col_expr(
                runtime_deploy_task::Column::LastError,
                Expr::value(Option::<String>::None),
            )
            .col_expr(
                runtime_deploy_task::Column::LeaseUntil,
                Expr::value(Option::<DateTime<FixedOffset>>::None),
            )
            .col_expr(runtime_deploy_task::Column::FinishedAt, Expr::value(now))
            .col_expr(runtime_deploy_task::Column::UpdatedAt, Expr::value(now))
            .filter(held_lease(run_id, lease_owner, db_now))
            .exec(&self.conn)
            .await?;
        Ok(updated.rows_affected == 1)
    }

    async fn mark_failed(&self, run_id: &str, lease_owner: &str, last_error: &str) -> Result<bool> {
        let run_id = run_id.trim();
        let lease_owner = lease_owner.trim();
        if run_id.is_empty() {
            return Err(anyhow!("mark runtime deploy task failed: run_id is required"));
        }
        if lease_owner.is_empty() {
            return Err(anyhow!("mark runtime deploy task failed: lease_owner is required"));
        }
        let now = now();
        let db_now = self.db_now().await?;
        let updated = runtime_deploy_task::Entity::update_many()
            .col_expr(
                runtime_deploy_task::Column::Status,
                Expr::value(status_value(TaskStatus::Failed)),
            )
            .col_expr(
                runtime_deploy_task::Column::LastError,
                Expr::value(last_error.trim()),
            )
            .col_expr(
                runtime_deploy_task::Column::LeaseUntil,
                Expr::value(Option::<DateTime<FixedOffset>>::None),
            )
            .col_expr(runtime_deploy_task::Column::FinishedAt, Expr::value(now))
            .col_expr(runtime_deploy_task::Column::UpdatedAt, Expr::value(now))
            .filter(held_lease(run_id, lease_owner, db_now))
            .exec(&self.conn)
            .await?;
        Ok(updated.rows_affected == 1)
    }

    async fn renew_lease(&self, run_id: &str, lease_owner: &str, lease_ttl: Duration) -> Result<bool> {
        let run_id = run_id.trim();
        let lease_owner = lease_owner.trim();
        if run_id.is_empty() {
            return Err(anyhow!("renew runtime deploy task lease: run_id is required"));
        }
        if lease_owner.is_empty() {
            return Err(anyhow!("renew runtime deploy task lease: lease_owner is required"));
        }
        let now = now();
        let db_now = self.db_now().await?;
        let lease_until = lease_deadline(db_now, lease_ttl)?;
        let updated = runtime_deploy_task::Entity::update_many()
            .col_expr(
                runtime_deploy_task::Column::LeaseUntil,
                Expr::value(lease_until),
            )
            .col_expr(runtime_deploy_task::Column::UpdatedAt, Expr::value(now))
            .filter(held_lease(run_id, lease_owner, db_now))
            .exec(&self.conn)
            .await?;
        Ok(updated.rows_affected == 1)
    }

    async fn cancel(&self, run_id: &str, reason: &str) -> Result<bool> {
        let run_id = run_id.trim();
        if run_id.is_empty() {
            return Err(anyhow!("cancel runtime deploy task: run_id is required"));
        }
        let now = now();
        let updated = runtime_deploy_task::Entity::update_many()
            .col_expr(
                runtime_deploy_task::Column::Status,
                Expr::value(status_value(TaskStatus::Canceled)),
            )
            .col_expr(
                runtime_deploy_task::Column::LastError,
                Expr::value(reason.trim()),
            )
            .col_expr(
                runtime_deploy_task::Column::LeaseUntil,
                Expr::value(Option::<DateTime<FixedOffset>>::None),
            )
            .col_expr(runtime_deploy_task::Column::FinishedAt, Expr::value(now))
            .col_expr(runtime_deploy_task::Column::UpdatedAt, Expr::value(now))
            .filter(runtime_deploy_task::Column::RunId.eq(run_id))
            .filter(runtime_deploy_task::Column::Status.is_in([
                status_value(TaskStatus::Pending),
                status_value(TaskStatus::Running),
            ]))
            .exec(&self.conn)
            .await?;
        Ok(updated.rows_affected == 1)
    }

    async fn list_recent(&self, filter: ListFilter) -> Result<Vec<Task>> {
        let mut query = runtime_deploy_task::Entity::find();
        if let Some(status) = filter.status {
            query = query.filter(runtime_deploy_task::Column::Status.eq(status_value(status)));
        }
        if let Some(target_env) = filter
            .target_env
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            query = query.filter(runtime_deploy_task::Column::TargetEnv.eq(target_env));
        }
        query
            .order_by_desc(runtime_deploy_task::Column::UpdatedAt)
            .limit(filter.effective_limit())
            .all(&self.conn)
            .await?
            .into_iter()
            .map(|model| to_task(model, vec![]))
            .collect()
    }

    async fn append_log(&self, params: AppendLogParams) -> Result<()> {
        let params = params.normalized();
        if params.run_id.is_empty() {
            return Err(anyhow!("append runtime deploy task log: run_id is required"));
        }
        if params.message.is_empty() {
            return Ok(());
        }
        runtime_deploy_task_log::ActiveModel {
            id: ActiveValue::Set(Uuid::new_v4()),
            run_id: ActiveValue::Set(params.run_id.clone()),
            stage: ActiveValue::Set(params.stage),
            level: ActiveValue::Set(params.level),
            message: ActiveValue::Set(params.message),
            created_at: ActiveValue::Set(now()),
        }
        .insert(&self.conn)
        .await?;
        self.trim_task_logs(&params.run_id, params.max_lines).await
    }
}

#[cfg(test)]
mod tests {
    use deployd_common::task::TaskStatus;

    use super::*;
    use crate::tests::prepare_db;

    fn params(run_id: &str) -> PrepareParams {
        PrepareParams {
            run_id: run_id.to_string(),
            target_env: "ai".to_string(),
            slot_no: 1,
            repository_full_name: "codex-k8s/codex-k8s".to_string(),
            build_ref: "main".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upsert_inserts_pending_then_keeps_it() {
        let db = prepare_db().await.unwrap();
        let task = db.upsert_desired(&params(" run-1 ")).await.unwrap();
        assert_eq!(task.run_id, "run-1");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.runtime_mode, "full-env");

        let again = db.upsert_desired(&params("run-1")).await.unwrap();
        assert_eq!(again.created_at, task.created_at);
        assert_eq!(again.updated_at, task.updated_at);
    }

    #[tokio::test]
    async fn upsert_resets_failed_or_changed_task() {
        let db = prepare_db().await.unwrap();
        db.upsert_desired(&params("run-1")).await.unwrap();
        let claimed = db
            .claim_next("worker-a", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, TaskStatus::Running);
        assert!(db.mark_failed("run-1", "worker-a", "boom").await.unwrap());

        let failed = db.get_by_run_id("run-1").await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));

        let reset = db.upsert_desired(&params("run-1")).await.unwrap();
        assert_eq!(reset.status, TaskStatus::Pending);
        assert_eq!(reset.last_error, None);

        let changed = PrepareParams {
            build_ref: "feature/x".to_string(),
            ..params("run-1")
        };
        let reset = db.upsert_desired(&changed).await.unwrap();
        assert_eq!(reset.build_ref, "feature/x");
        assert_eq!(reset.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn concurrent_claims_hand_out_one_lease() {
        let db = prepare_db().await.unwrap();
        db.upsert_desired(&params("run-1")).await.unwrap();

        let ttl = Duration::from_secs(60);
        let (a, b) = tokio::join!(db.claim_next("worker-a", ttl), db.claim_next("worker-b", ttl));
        let claims = [a.unwrap(), b.unwrap()];
        let claimed: Vec<_> = claims.iter().flatten().collect();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);

        assert!(db.claim_next("worker-c", ttl).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_moves_to_new_owner() {
        let db = prepare_db().await.unwrap();
        db.upsert_desired(&params("run-1")).await.unwrap();

        let first = db
            .claim_next("worker-a", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.lease_owner.as_deref(), Some("worker-a"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!db
            .renew_lease("run-1", "worker-a", Duration::from_secs(60))
            .await
            .unwrap());

        let second = db
            .claim_next("worker-b", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.lease_owner.as_deref(), Some("worker-b"));
        assert_eq!(second.attempts, 2);

        let result = PrepareResult {
            namespace: "codex-k8s-dev-1".to_string(),
            target_env: "ai".to_string(),
        };
        assert!(!db.mark_succeeded("run-1", "worker-a", &result).await.unwrap());
        assert!(db
            .renew_lease("run-1", "worker-b", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(db.mark_succeeded("run-1", "worker-b", &result).await.unwrap());

        let task = db.get_by_run_id("run-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.prepare_result(), result);
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn leases_follow_the_database_clock() {
        let mut db = prepare_db().await.unwrap();
        let drift = (db.db_now().await.unwrap() - now()).num_seconds().abs();
        assert!(drift < 5, "database clock drifted {drift}s");

        // database ten minutes behind the workers
        db.now_query =
            "SELECT CAST((julianday('now', '-10 minutes') - 2440587.5) * 86400000000 AS INTEGER) AS now_micros";
        db.upsert_desired(&params("run-1")).await.unwrap();

        let ttl = Duration::from_secs(60);
        let claimed = db.claim_next("worker-a", ttl).await.unwrap().unwrap();
        let lease_until = claimed.lease_until.unwrap();
        assert!(lease_until < now(), "lease deadline looks expired to the worker");

        assert!(db.claim_next("worker-b", ttl).await.unwrap().is_none());
        assert!(db.renew_lease("run-1", "worker-a", ttl).await.unwrap());

        let result = PrepareResult {
            namespace: "codex-k8s-dev-1".to_string(),
            target_env: "ai".to_string(),
        };
        assert!(db.mark_succeeded("run-1", "worker-a", &result).await.unwrap());
        let task = db.get_by_run_id("run-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.lease_owner.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn cancel_only_touches_live_tasks() {
        let db = prepare_db().await.unwrap();
        db.upsert_desired(&params("run-1")).await.unwrap();
        assert!(db.cancel("run-1", "superseded").await.unwrap());
        assert!(!db.cancel("run-1", "again").await.unwrap());

        let task = db.get_by_run_id("run-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.last_error.as_deref(), Some("superseded"));
        assert!(db
            .claim_next("worker-a", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_recent_filters_and_orders() {
        let db = prepare_db().await.unwrap();
        db.upsert_desired(&params("run-1")).await.unwrap();
        db.upsert_desired(&PrepareParams {
            target_env: "production".to_string(),
            ..params("run-2")
        })
        .await
        .unwrap();
        db.upsert_desired(&params("run-3")).await.unwrap();

        let all = db.list_recent(ListFilter::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|t| t.run_id.as_str()).collect();
        assert_eq!(ids, vec!["run-3", "run-2", "run-1"]);

        let ai = db
            .list_recent(ListFilter {
                target_env: Some("ai".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ai.len(), 2);

        let running = db
            .list_recent(ListFilter {
                status: Some(TaskStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn append_log_keeps_latest_lines() {
        let db = prepare_db().await.unwrap();
        db.upsert_desired(&params("run-1")).await.unwrap();
        for i in 0..5 {
            db.append_log(AppendLogParams {
                run_id: "run-1".to_string(),
                stage: "build".to_string(),
                message: format!("line {i}"),
                max_lines: 3,
                ..Default::default()
            })
            .await
            .unwrap();
        }
        db.append_log(AppendLogParams {
            run_id: "run-1".to_string(),
            message: "   ".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let task = db.get_by_run_id("run-1").await.unwrap().unwrap();
        let messages: Vec<_> = task.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(task.logs[0].stage, "build");
        assert_eq!(task.logs[0].level, "info");
    }
}
