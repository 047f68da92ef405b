//! Command documents and resource loading.
//!
//! Task and workflow instance commands are authored as YAML files and decoded
//! into the typed documents below before an envelope is built. Deployments carry
//! the process definition untouched.

use crate::error::{ClientError, ClientResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub const TASK_CREATE_STATE: &str = "CREATE";
pub const WORKFLOW_INSTANCE_CREATE_STATE: &str = "CREATE_WORKFLOW_INSTANCE";
pub const DEPLOYMENT_CREATE_STATE: &str = "CREATE_DEPLOYMENT";

fn default_task_state() -> String {
    TASK_CREATE_STATE.to_string()
}

fn default_workflow_instance_state() -> String {
    WORKFLOW_INSTANCE_CREATE_STATE.to_string()
}

fn default_retries() -> u32 {
    3
}

fn latest_version() -> i32 {
    -1
}

/// A task command document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default = "default_task_state")]
    pub state: String,

    #[serde(rename = "type")]
    pub task_type: String,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_time: Option<u64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_headers: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Accepted in documents but never used for routing.
    #[serde(default, skip_serializing)]
    pub topic: Option<String>,
}

impl Task {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            state: default_task_state(),
            task_type: task_type.into(),
            retries: default_retries(),
            lock_owner: None,
            lock_time: None,
            headers: BTreeMap::new(),
            custom_headers: BTreeMap::new(),
            payload: None,
            topic: None,
        }
    }
}

/// A workflow instance command document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    #[serde(default = "default_workflow_instance_state")]
    pub state: String,

    pub bpmn_process_id: String,

    #[serde(default = "latest_version")]
    pub version: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl WorkflowInstance {
    pub fn new(bpmn_process_id: impl Into<String>) -> Self {
        Self {
            state: default_workflow_instance_state(),
            bpmn_process_id: bpmn_process_id.into(),
            version: latest_version(),
            payload: None,
        }
    }
}

/// A deployment of one process definition resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    pub state: &'static str,
    pub resource: Vec<u8>,
}

impl Deployment {
    pub fn new(resource: Vec<u8>) -> Self {
        Self {
            state: DEPLOYMENT_CREATE_STATE,
            resource,
        }
    }

    /// Read the resource at `path` into a create-deployment command.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ClientResult<Self> {
        load_resource(path).map(Self::new)
    }
}

/// Read a resource file. An empty path fails before any filesystem access.
pub fn load_resource<P: AsRef<Path>>(path: P) -> ClientResult<Vec<u8>> {
    let path = path.as_ref();
    info!("Loading resource at {}", path.display());
    if path.as_os_str().is_empty() {
        return Err(ClientError::ResourceNotFound(PathBuf::new()));
    }

    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    std::fs::read(&absolute).map_err(|_| ClientError::ResourceNotFound(absolute))
}

/// Decode a YAML command document.
pub fn parse_document<T: DeserializeOwned>(contents: &[u8]) -> ClientResult<T> {
    Ok(serde_yaml::from_slice(contents)?)
}

/// Load and decode a YAML command document from `path`.
pub fn load_document<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> ClientResult<T> {
    let contents = load_resource(path)?;
    parse_document(&contents)
}
