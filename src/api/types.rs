use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::catalog::ModelEntry;
use crate::events::EventRecord;
use crate::supervisor::InstanceInfo;

/// Envelope around every control API response except `/api/health`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn ok_with_message(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelSummary {
    pub index: usize,
    pub name: String,
    pub path: PathBuf,
    pub filename: String,
    #[serde(default)]
    pub base_name: String,
    #[serde(default)]
    pub shard_count: usize,
    #[serde(default)]
    pub size_bytes: u64,
}

impl From<&ModelEntry> for ModelSummary {
    fn from(entry: &ModelEntry) -> Self {
        Self {
            index: entry.index,
            name: entry.display.clone(),
            path: entry.primary_path.clone(),
            filename: entry.file_name(),
            base_name: entry.base_name.clone(),
            shard_count: entry.shard_count,
            size_bytes: entry.size_bytes,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadedModel {
    pub base_name: String,
    pub path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub loaded: bool,
    pub model: Option<LoadedModel>,
    pub server_port: u16,
    #[serde(default)]
    pub instances: Vec<InstanceInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadData {
    pub path: PathBuf,
    pub base_name: String,
    pub port: u16,
    pub instance: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UnloadData {
    pub stopped: Vec<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReloadData {
    pub count: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EventView {
    pub time: DateTime<Utc>,
    pub kind: String,
    pub title: String,
    pub message: String,
}

impl From<EventRecord> for EventView {
    fn from(record: EventRecord) -> Self {
        Self {
            time: record.time,
            kind: record.kind.to_string(),
            title: record.title,
            message: record.message,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: String,
}
