use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

use crate::core::model::{EntryPointInfo, MethodDefinition};
use crate::error::{FlowscribeError, Result};

/// One analyzed entry point of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub project_id: String,
    pub project_name: String,
    pub analysis_date: String,
    pub entry_point: String,
    pub api_name: String,
    pub api_method: String,
    pub annotation: String,
    pub model: String,
    pub version: String,
    pub temperature: f32,
    pub include_method_text: bool,
    pub exclude_packages: Vec<String>,
    pub custom_annotations: Vec<String>,
    pub summary_title: String,
    pub insight: String,
    pub reasoning: String,
    pub mermaid_code: String,
    pub method_definitions: Vec<MethodDefinition>,
    pub created_at: String,
}

/// Entry-point metadata recorded by the parse stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPointRecord {
    pub project_id: String,
    pub project_name: String,
    pub analysis_date: String,
    #[serde(flatten)]
    pub info: EntryPointInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub project_id: String,
    pub project_name: String,
    pub analysis_date: String,
    pub entry_points: usize,
    pub model: String,
}

pub trait HistoryStore: Send + Sync {
    fn insert_bulk(&self, records: Vec<HistoryRecord>) -> Result<usize>;

    fn delete_by_date_and_project(&self, analysis_date: &str, project_id: &str) -> Result<usize>;

    /// Most recent record for an entry point of a project
    fn find_by_entry_point(&self, project_id: &str, entry_point: &str) -> Result<Option<HistoryRecord>>;

    /// Latest run per project, newest first
    fn recent_projects(&self, limit: usize) -> Result<Vec<ProjectSummary>>;

    /// Replace every entry-point row for (date, project)
    fn replace_entry_points(
        &self,
        analysis_date: &str,
        project_id: &str,
        records: Vec<EntryPointRecord>,
    ) -> Result<usize>;

    fn entry_points_for_project(&self, project_id: &str) -> Result<Vec<EntryPointRecord>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryData {
    records: Vec<HistoryRecord>,
    entry_points: Vec<EntryPointRecord>,
}

/// History kept in a single JSON file, or purely in memory when no path
/// is given
#[derive(Debug)]
pub struct JsonHistoryStore {
    path: Option<PathBuf>,
    data: Mutex<HistoryData>,
}

impl JsonHistoryStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            HistoryData::default()
        };

        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(HistoryData::default()),
        }
    }

    fn with_data<T>(&self, mutate: bool, f: impl FnOnce(&mut HistoryData) -> T) -> Result<T> {
        let mut data = self
            .data
            .lock()
            .map_err(|e| FlowscribeError::Store(format!("History lock poisoned: {}", e)))?;
        let out = f(&mut data);

        if mutate {
            if let Some(path) = &self.path {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, serde_json::to_string_pretty(&*data)?)?;
                debug!("History persisted to {}", path.display());
            }
        }

        Ok(out)
    }
}

impl HistoryStore for JsonHistoryStore {
    fn insert_bulk(&self, records: Vec<HistoryRecord>) -> Result<usize> {
        self.with_data(true, |data| {
            let count = records.len();
            data.records.extend(records);
            count
        })
    }

    fn delete_by_date_and_project(&self, analysis_date: &str, project_id: &str) -> Result<usize> {
        self.with_data(true, |data| {
            let before = data.records.len();
            data.records
                .retain(|r| !(r.analysis_date == analysis_date && r.project_id == project_id));
            before - data.records.len()
        })
    }

    fn find_by_entry_point(&self, project_id: &str, entry_point: &str) -> Result<Option<HistoryRecord>> {
        self.with_data(false, |data| {
            data.records
                .iter()
                .filter(|r| r.project_id == project_id && r.entry_point == entry_point)
                .max_by(|a, b| {
                    (a.analysis_date.as_str(), a.created_at.as_str())
                        .cmp(&(b.analysis_date.as_str(), b.created_at.as_str()))
                })
                .cloned()
        })
    }

    fn recent_projects(&self, limit: usize) -> Result<Vec<ProjectSummary>> {
        self.with_data(false, |data| {
            let mut latest: BTreeMap<&str, ProjectSummary> = BTreeMap::new();

            for record in &data.records {
                let newer = latest
                    .get(record.project_id.as_str())
                    .map(|s| record.analysis_date > s.analysis_date)
                    .unwrap_or(true);
                if newer {
                    latest.insert(
                        record.project_id.as_str(),
                        ProjectSummary {
                            project_id: record.project_id.clone(),
                            project_name: record.project_name.clone(),
                            analysis_date: record.analysis_date.clone(),
                            entry_points: 0,
                            model: record.model.clone(),
                        },
                    );
                }
            }

            for record in &data.records {
                if let Some(summary) = latest.get_mut(record.project_id.as_str()) {
                    if summary.analysis_date == record.analysis_date {
                        summary.entry_points += 1;
                    }
                }
            }

            let mut projects: Vec<ProjectSummary> = latest.into_values().collect();
            projects.sort_by(|a, b| b.analysis_date.cmp(&a.analysis_date));
            projects.truncate(limit);
            projects
        })
    }

    fn replace_entry_points(
        &self,
        analysis_date: &str,
        project_id: &str,
        records: Vec<EntryPointRecord>,
    ) -> Result<usize> {
        self.with_data(true, |data| {
            data.entry_points
                .retain(|r| !(r.analysis_date == analysis_date && r.project_id == project_id));
            let count = records.len();
            data.entry_points.extend(records);
            count
        })
    }

    fn entry_points_for_project(&self, project_id: &str) -> Result<Vec<EntryPointRecord>> {
        self.with_data(false, |data| {
            data.entry_points
                .iter()
                .filter(|r| r.project_id == project_id)
                .cloned()
                .collect()
        })
    }
}
