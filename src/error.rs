use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Input not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("Failed to spawn worker `{command}` for job {job_id}: {source}")]
    SpawnFailure {
        job_id: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not prepare output directory {}: {source}", path.display())]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No supported images found in {}", .0.display())]
    NoInputs(PathBuf),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Orchestrator is no longer running")]
    CoordinatorClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Classifies why a job ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker exited nonzero (or was killed) without reporting success.
    WorkerRuntime { exit_code: Option<i32> },
    /// The OS refused to start the worker.
    Spawn { reason: String },
    /// The input vanished between enumeration and admission.
    InputMissing,
    /// The watchdog killed a worker that ran too long.
    Timeout { after_secs: u64 },
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::WorkerRuntime {
                exit_code: Some(code),
            } => write!(f, "Worker exited with code {code}"),
            FailureKind::WorkerRuntime { exit_code: None } => {
                write!(f, "Worker terminated by signal")
            }
            FailureKind::Spawn { reason } => write!(f, "Worker could not be started: {reason}"),
            FailureKind::InputMissing => write!(f, "Input file is missing"),
            FailureKind::Timeout { after_secs } => write!(f, "Timed out after {after_secs}s"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_display() {
        let exit = FailureKind::WorkerRuntime { exit_code: Some(2) };
        assert_eq!(exit.to_string(), "Worker exited with code 2");

        let signal = FailureKind::WorkerRuntime { exit_code: None };
        assert_eq!(signal.to_string(), "Worker terminated by signal");

        let timeout = FailureKind::Timeout { after_secs: 30 };
        assert_eq!(timeout.to_string(), "Timed out after 30s");
    }

    #[test]
    fn failure_kind_serializes_tagged() {
        let json = serde_json::to_value(FailureKind::WorkerRuntime { exit_code: Some(1) }).unwrap();
        assert_eq!(json["kind"], "worker_runtime");
        assert_eq!(json["exit_code"], 1);
    }

    #[test]
    fn input_not_found_mentions_path() {
        let err = OrchestratorError::InputNotFound(PathBuf::from("/tmp/missing.jpg"));
        assert_eq!(err.to_string(), "Input not found: /tmp/missing.jpg");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OrchestratorError>();
    }
}
