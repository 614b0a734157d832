/// Run report: written as JSON once a monitored job has ended.
///
/// Uses atomic write pattern: write to temp file then rename.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// How the job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Aborted,
}

/// The JSON payload written to the report file.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub job_id: String,
    pub command: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    /// Process exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    pub log_bytes: u64,
    /// Final workspace size, if it could be measured.
    pub workspace_bytes: Option<u64>,
    pub abort_cause: Option<String>,
}

impl RunReport {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Atomically write the report to `path`.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, path: &Path) -> Result<(), ReportError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| ReportError::Serialize { source: e })?;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp_path = dir.join(format!(".sizeguard-report.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| ReportError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, path).map_err(|e| ReportError::Rename {
            from: tmp_path,
            to: path.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }
}

/// Errors from writing the report file.
#[derive(Debug)]
pub enum ReportError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::Serialize { source } => write!(f, "failed to serialize report: {source}"),
            ReportError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp report file {}: {source}",
                    path.display()
                )
            }
            ReportError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Serialize { source } => Some(source),
            ReportError::Write { source, .. } => Some(source),
            ReportError::Rename { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(outcome: RunOutcome) -> RunReport {
        let started_at = Utc::now();
        RunReport {
            job_id: "build-7".to_string(),
            command: "make".to_string(),
            pid: 4242,
            started_at,
            finished_at: started_at + chrono::Duration::seconds(12),
            outcome,
            exit_code: None,
            log_bytes: 150,
            workspace_bytes: Some(2048),
            abort_cause: Some("log size 150 bytes exceeded limit of 100 bytes".to_string()),
        }
    }

    #[test]
    fn test_report_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");

        sample(RunOutcome::Aborted).write(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["job_id"], "build-7");
        assert_eq!(parsed["outcome"], "aborted");
        assert_eq!(parsed["pid"], 4242);
        assert_eq!(parsed["log_bytes"], 150);
        assert_eq!(parsed["workspace_bytes"], 2048);
        assert!(parsed["exit_code"].is_null());
        assert_eq!(
            parsed["abort_cause"],
            "log size 150 bytes exceeded limit of 100 bytes"
        );

        let tmp_path = dir
            .path()
            .join(format!(".sizeguard-report.tmp.{}", std::process::id()));
        assert!(
            !tmp_path.exists(),
            "temp file should be cleaned up by rename"
        );
    }

    #[test]
    fn test_report_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");

        sample(RunOutcome::Failed).write(&path).unwrap();
        let mut report = sample(RunOutcome::Completed);
        report.exit_code = Some(0);
        report.abort_cause = None;
        report.write(&path).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["outcome"], "completed");
        assert_eq!(parsed["exit_code"], 0);
        assert!(parsed["abort_cause"].is_null());
    }

    #[test]
    fn test_report_write_to_missing_dir_fails() {
        let err = sample(RunOutcome::Completed)
            .write(Path::new("/nonexistent-dir/impossible/report.json"))
            .unwrap_err();
        assert!(matches!(err, ReportError::Write { .. }));
    }

    #[test]
    fn test_duration() {
        assert_eq!(sample(RunOutcome::Completed).duration().num_seconds(), 12);
    }
}
