//! Per-project progress records, overwritten as a run advances.
//!
//! One run per project at a time is a caller precondition; the lock only
//! keeps concurrent runs for different projects from tearing the map.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub const TOTAL_STEPS: i32 = 13;

/// Named milestones of a run with their step numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStatus {
    UploadStarted,
    UploadComplete,
    ParsingStarted,
    ParsingComplete,
    CallTreeStarted,
    CallTreeComplete,
    MethodAnalysisStarted,
    MethodAnalysisComplete,
    FlowSummaryStarted,
    FlowSummaryComplete,
    DiagramStarted,
    DiagramComplete,
    Done,
    Failed,
}

impl AnalysisStatus {
    pub fn step(&self) -> i32 {
        match self {
            AnalysisStatus::UploadStarted => 1,
            AnalysisStatus::UploadComplete => 2,
            AnalysisStatus::ParsingStarted => 3,
            AnalysisStatus::ParsingComplete => 4,
            AnalysisStatus::CallTreeStarted => 5,
            AnalysisStatus::CallTreeComplete => 6,
            AnalysisStatus::MethodAnalysisStarted => 7,
            AnalysisStatus::MethodAnalysisComplete => 8,
            AnalysisStatus::FlowSummaryStarted => 9,
            AnalysisStatus::FlowSummaryComplete => 10,
            AnalysisStatus::DiagramStarted => 11,
            AnalysisStatus::DiagramComplete => 12,
            AnalysisStatus::Done => 13,
            AnalysisStatus::Failed => -1,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AnalysisStatus::UploadStarted | AnalysisStatus::UploadComplete => "UPLOAD",
            AnalysisStatus::ParsingStarted | AnalysisStatus::ParsingComplete => "PARSING",
            AnalysisStatus::CallTreeStarted | AnalysisStatus::CallTreeComplete => "CALLTREE",
            AnalysisStatus::MethodAnalysisStarted | AnalysisStatus::MethodAnalysisComplete => {
                "CODE_ANALYSIS"
            }
            AnalysisStatus::FlowSummaryStarted | AnalysisStatus::FlowSummaryComplete => {
                "FLOW_SUMMARY"
            }
            AnalysisStatus::DiagramStarted | AnalysisStatus::DiagramComplete => "DIAGRAM",
            AnalysisStatus::Done => "DONE",
            AnalysisStatus::Failed => "FAILED",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            AnalysisStatus::UploadStarted => "Uploading source",
            AnalysisStatus::UploadComplete => "Source uploaded",
            AnalysisStatus::ParsingStarted => "Parsing source",
            AnalysisStatus::ParsingComplete => "Source parsed",
            AnalysisStatus::CallTreeStarted => "Building call trees",
            AnalysisStatus::CallTreeComplete => "Call trees built",
            AnalysisStatus::MethodAnalysisStarted => "Analyzing methods",
            AnalysisStatus::MethodAnalysisComplete => "Methods analyzed",
            AnalysisStatus::FlowSummaryStarted => "Summarizing call flows",
            AnalysisStatus::FlowSummaryComplete => "Call flows summarized",
            AnalysisStatus::DiagramStarted => "Generating sequence diagrams",
            AnalysisStatus::DiagramComplete => "Sequence diagrams generated",
            AnalysisStatus::Done => "Analysis complete",
            AnalysisStatus::Failed => "Analysis failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub status: String,
    pub step: i32,
    pub total_steps: i32,
    pub message: String,
    pub updated_at: Option<DateTime<Local>>,
}

impl Default for ProjectStatus {
    fn default() -> Self {
        Self {
            status: String::new(),
            step: 0,
            total_steps: TOTAL_STEPS,
            message: String::new(),
            updated_at: None,
        }
    }
}

/// Shared, cloneable handle to the status map
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    statuses: Arc<RwLock<HashMap<String, ProjectStatus>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the project's status
    pub fn set_status(&self, project_id: &str, step: i32, total_steps: i32, message: impl Into<String>) {
        self.write(project_id, String::new(), step, total_steps, message.into());
    }

    /// Record one of the named milestones
    pub fn record(&self, project_id: &str, status: AnalysisStatus) {
        self.write(
            project_id,
            status.code().to_string(),
            status.step(),
            TOTAL_STEPS,
            status.message().to_string(),
        );
    }

    /// Record a milestone with a custom message
    pub fn record_with_message(&self, project_id: &str, status: AnalysisStatus, message: impl Into<String>) {
        self.write(
            project_id,
            status.code().to_string(),
            status.step(),
            TOTAL_STEPS,
            message.into(),
        );
    }

    /// Record failure, appending the cause to the message
    pub fn record_failure(&self, project_id: &str, cause: &str) {
        let message = format!("{}({})", AnalysisStatus::Failed.message(), cause);
        self.record_with_message(project_id, AnalysisStatus::Failed, message);
    }

    /// Current status, or `{step: 0, total: 13, message: ""}` if unknown
    pub fn get_status(&self, project_id: &str) -> ProjectStatus {
        match self.statuses.read() {
            Ok(map) => map.get(project_id).cloned().unwrap_or_default(),
            Err(poisoned) => poisoned
                .into_inner()
                .get(project_id)
                .cloned()
                .unwrap_or_default(),
        }
    }

    fn write(&self, project_id: &str, status: String, step: i32, total_steps: i32, message: String) {
        let entry = ProjectStatus {
            status,
            step,
            total_steps,
            message,
            updated_at: Some(Local::now()),
        };
        let mut map = match self.statuses.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(project_id.to_string(), entry);
    }
}
