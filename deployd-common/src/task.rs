use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::{PrepareParams, PrepareResult, DEFAULT_TARGET_ENV};

pub const DEFAULT_LOG_STAGE: &str = "deploy";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::EnumString,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskLogEntry {
    pub stage: String,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<FixedOffset>,
}

/// Persisted deploy task: desired params plus reconcile state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub run_id: String,
    pub runtime_mode: String,
    pub namespace: String,
    pub target_env: String,
    pub slot_no: i32,
    pub repository_full_name: String,
    pub services_yaml_path: String,
    pub build_ref: String,
    pub deploy_only: bool,
    pub status: TaskStatus,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<FixedOffset>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub result_namespace: Option<String>,
    pub result_target_env: Option<String>,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
    pub started_at: Option<DateTime<FixedOffset>>,
    pub finished_at: Option<DateTime<FixedOffset>>,
    pub logs: Vec<TaskLogEntry>,
}

impl Task {
    pub fn params(&self) -> PrepareParams {
        PrepareParams {
            run_id: self.run_id.clone(),
            runtime_mode: self.runtime_mode.clone(),
            namespace: self.namespace.clone(),
            target_env: self.target_env.clone(),
            slot_no: self.slot_no,
            repository_full_name: self.repository_full_name.clone(),
            services_yaml_path: self.services_yaml_path.clone(),
            build_ref: self.build_ref.clone(),
            deploy_only: self.deploy_only,
        }
    }

    /// Whether the stored desired fields equal `params`.
    pub fn same_desired(&self, params: &PrepareParams) -> bool {
        self.runtime_mode == params.runtime_mode
            && self.namespace == params.namespace
            && self.target_env == params.target_env
            && self.slot_no == params.slot_no
            && self.repository_full_name == params.repository_full_name
            && self.services_yaml_path == params.services_yaml_path
            && self.build_ref == params.build_ref
            && self.deploy_only == params.deploy_only
    }

    /// A failed task or a changed intent goes back to pending.
    pub fn should_reset(&self, params: &PrepareParams) -> bool {
        self.status == TaskStatus::Failed || !self.same_desired(params)
    }

    pub fn prepare_result(&self) -> PrepareResult {
        let namespace = non_blank(self.result_namespace.as_deref())
            .unwrap_or(self.namespace.trim())
            .to_string();
        let target_env = non_blank(self.result_target_env.as_deref())
            .or_else(|| non_blank(Some(&self.target_env)))
            .unwrap_or(DEFAULT_TARGET_ENV)
            .to_string();
        PrepareResult {
            namespace,
            target_env,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub limit: u64,
    pub status: Option<TaskStatus>,
    pub target_env: Option<String>,
}

impl ListFilter {
    pub fn effective_limit(&self) -> u64 {
        match self.limit {
            0 => 200,
            n => n.min(1000),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendLogParams {
    pub run_id: String,
    pub stage: String,
    pub level: String,
    pub message: String,
    pub max_lines: u64,
}

impl AppendLogParams {
    /// Trims fields and applies stage, level and line-cap defaults.
    pub fn normalized(mut self) -> Self {
        self.run_id = self.run_id.trim().to_string();
        self.stage = self.stage.trim().to_string();
        if self.stage.is_empty() {
            self.stage = DEFAULT_LOG_STAGE.to_string();
        }
        self.level = self.level.trim().to_string();
        if self.level.is_empty() {
            self.level = DEFAULT_LOG_LEVEL.to_string();
        }
        self.message = self.message.trim().to_string();
        self.max_lines = match self.max_lines {
            0 => 200,
            n => n.min(5000),
        };
        self
    }
}

/// Durable store of deploy intents with lease-based claiming.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Creates the task or resets it to pending when it failed or its intent changed.
    async fn upsert_desired(&self, params: &PrepareParams) -> Result<Task>;

    async fn get_by_run_id(&self, run_id: &str) -> Result<Option<Task>>;

    /// Claims one pending task or one running task whose lease expired.
    async fn claim_next(&self, lease_owner: &str, lease_ttl: Duration) -> Result<Option<Task>>;

    async fn mark_succeeded(
        &self,
        run_id: &str,
        lease_owner: &str,
        result: &PrepareResult,
    ) -> Result<bool>;

    async fn mark_failed(&self, run_id: &str, lease_owner: &str, last_error: &str)
        -> Result<bool>;

    async fn renew_lease(&self, run_id: &str, lease_owner: &str, lease_ttl: Duration)
        -> Result<bool>;

    /// Moves a non-terminal task to canceled, keeping `reason` as its last error.
    async fn cancel(&self, run_id: &str, reason: &str) -> Result<bool>;

    async fn list_recent(&self, filter: ListFilter) -> Result<Vec<Task>>;

    async fn append_log(&self, params: AppendLogParams) -> Result<()>;
}
