use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod kube;
pub mod manifest;
pub mod task;
pub mod utils;

pub const DEFAULT_RUNTIME_MODE: &str = "full-env";
pub const DEFAULT_TARGET_ENV: &str = "ai";
pub const DEFAULT_BUILD_REF: &str = "main";

/// Template variables accumulated during one deploy run.
pub type TemplateVars = BTreeMap<String, String>;

/// One deployment intent, keyed by `run_id`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareParams {
    pub run_id: String,
    pub runtime_mode: String,
    pub namespace: String,
    pub target_env: String,
    pub slot_no: i32,
    pub repository_full_name: String,
    pub services_yaml_path: String,
    pub build_ref: String,
    pub deploy_only: bool,
}

impl PrepareParams {
    pub fn normalized(mut self) -> Self {
        self.run_id = self.run_id.trim().to_string();
        self.runtime_mode = self.runtime_mode.trim().to_string();
        if self.runtime_mode.is_empty() {
            self.runtime_mode = DEFAULT_RUNTIME_MODE.to_string();
        }
        self.namespace = self.namespace.trim().to_string();
        self.target_env = self.target_env.trim().to_string();
        if self.target_env.is_empty() {
            self.target_env = DEFAULT_TARGET_ENV.to_string();
        }
        if self.slot_no < 0 {
            self.slot_no = 0;
        }
        self.repository_full_name = self.repository_full_name.trim().to_string();
        self.services_yaml_path = self.services_yaml_path.trim().to_string();
        self.build_ref = self.build_ref.trim().to_string();
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareResult {
    pub namespace: String,
    pub target_env: String,
}
