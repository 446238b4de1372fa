//! Execution recording
//!
//! The registry hands every execution that reaches a terminal state to an
//! optional [`ExecutionRecorder`]. The engine itself keeps everything in
//! memory and does not depend on a recorder being present.

use super::execution::ExecutionSnapshot;
use super::WorkflowError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Persistence hook for finished executions
#[cfg_attr(test, mockall::automock)]
pub trait ExecutionRecorder: Send + Sync {
    /// Record one terminal snapshot
    fn record(&self, snapshot: &ExecutionSnapshot) -> Result<(), WorkflowError>;
}

/// Appends one JSON object per execution to a file
pub struct JsonLinesRecorder {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl JsonLinesRecorder {
    /// Open (or create) `path` for appending
    pub fn open(path: &Path) -> Result<Self, WorkflowError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Output file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ExecutionRecorder for JsonLinesRecorder {
    fn record(&self, snapshot: &ExecutionSnapshot) -> Result<(), WorkflowError> {
        let line = serde_json::to_string(snapshot).map_err(|e| WorkflowError::Recorder(e.to_string()))?;
        let mut file = self.file.lock();
        writeln!(file, "{line}")?;
        // One line per finished execution, so flush every time
        file.flush()?;
        debug!("Recorded execution {} to {}", snapshot.id, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workflow::execution::ExecutionStatus;
    use chrono::Local;
    use std::collections::BTreeMap;

    fn snapshot(id: &str, status: ExecutionStatus) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id: id.into(),
            workflow_id: "w".into(),
            workflow_name: "Workflow".into(),
            status,
            pause_reason: None,
            current_step: Some("s1".into()),
            failed_step: None,
            error: None,
            variables: BTreeMap::new(),
            steps_completed: 1,
            log: Vec::new(),
            handle: Some(1),
            workstation_id: Some("WS-01".into()),
            operator_id: None,
            created_at: Local::now(),
            started_at: Some(Local::now()),
            completed_at: Some(Local::now()),
        }
    }

    #[test]
    fn test_appends_one_line_per_execution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("executions.jsonl");
        let recorder = JsonLinesRecorder::open(&path).unwrap();

        recorder.record(&snapshot("a", ExecutionStatus::Completed)).unwrap();
        recorder.record(&snapshot("b", ExecutionStatus::Failed)).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<ExecutionSnapshot> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].id, "a");
        assert_eq!(lines[1].status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_reopen_keeps_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executions.jsonl");
        JsonLinesRecorder::open(&path)
            .unwrap()
            .record(&snapshot("a", ExecutionStatus::Cancelled))
            .unwrap();
        JsonLinesRecorder::open(&path)
            .unwrap()
            .record(&snapshot("b", ExecutionStatus::Completed))
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }
}
