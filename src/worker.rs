//! Spawning and supervising editing-worker processes.
//!
//! One tokio task per child reads stdout through the [`ProgressParser`],
//! forwards stderr, waits for exit and reports everything to the coordinator
//! as [`WorkerReport`]s tagged with the binding generation.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::config::OrchestratorConfig;
use crate::dispatcher::is_supported_image;
use crate::protocol::{ParsedLine, ProgressParser};
use crate::state_machine::JobId;

/// Name of the directory created next to the input when no output directory
/// is configured.
pub const DEFAULT_OUTPUT_SUBDIR: &str = "edited";

const READ_CHUNK: usize = 8 * 1024;

/// How the worker executable is launched.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub base_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub path_prepend: Vec<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl WorkerCommand {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            program: config.worker_command.clone(),
            base_args: config.worker_args.clone(),
            working_dir: config.working_dir.clone(),
            path_prepend: config.path_prepend.clone(),
            env: config.env.clone(),
        }
    }

    /// `[base args.., mode, input, --output-dir, dir, --json-output, (--instructions, text)]`
    pub fn argv(
        &self,
        mode: &str,
        input: &Path,
        output_dir: &Path,
        instructions: Option<&str>,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.base_args.iter().map(OsString::from).collect();
        args.push(mode.into());
        args.push(input.as_os_str().to_owned());
        args.push("--output-dir".into());
        args.push(output_dir.as_os_str().to_owned());
        args.push("--json-output".into());
        if let Some(text) = instructions.map(str::trim).filter(|t| !t.is_empty()) {
            args.push("--instructions".into());
            args.push(text.into());
        }
        args
    }

    /// Builds the child command: stdin closed, stdout/stderr piped.
    pub fn command(&self, args: &[OsString]) -> Command {
        let mut command = Command::new(&self.program);
        command.args(args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        if let Some(path) = self.search_path() {
            command.env("PATH", path);
        }
        command.envs(&self.env);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    pub fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.base_args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn search_path(&self) -> Option<OsString> {
        if self.path_prepend.is_empty() {
            return None;
        }
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let dirs = self
            .path_prepend
            .iter()
            .cloned()
            .chain(std::env::split_paths(&inherited));
        match std::env::join_paths(dirs) {
            Ok(joined) => Some(joined),
            Err(err) => {
                tracing::warn!(error = %err, "path_prepend contains an invalid entry; using inherited PATH");
                None
            }
        }
    }
}

/// The configured output directory, or `<input parent>/edited`.
pub fn output_dir_for(configured: Option<&Path>, input: &Path) -> PathBuf {
    match configured {
        Some(dir) => dir.to_path_buf(),
        None => input
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(DEFAULT_OUTPUT_SUBDIR),
    }
}

/// Looks for the artifact a worker left in `output_dir`: the newest image
/// whose name starts with the input's stem, else the newest image.
pub async fn find_output_artifact(
    output_dir: &Path,
    input: &Path,
) -> std::io::Result<Option<PathBuf>> {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut best_named: Option<(SystemTime, PathBuf)> = None;
    let mut best_any: Option<(SystemTime, PathBuf)> = None;

    let mut entries = tokio::fs::read_dir(output_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_supported_image(&path) || !entry.file_type().await?.is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .await?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let named = !stem.is_empty()
            && path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(&stem));

        if named && best_named.as_ref().is_none_or(|(t, _)| modified > *t) {
            best_named = Some((modified, path.clone()));
        }
        if best_any.as_ref().is_none_or(|(t, _)| modified > *t) {
            best_any = Some((modified, path));
        }
    }

    Ok(best_named.or(best_any).map(|(_, path)| path))
}

/// Something a supervised worker did.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Line(ParsedLine),
    Stderr(String),
    /// Always the last message of a binding. `None` means killed by signal.
    Exited(Option<i32>),
    /// Sent by the watchdog timer, not by the process.
    DeadlineElapsed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub job_id: JobId,
    pub generation: u64,
    pub message: WorkerMessage,
}

/// Control side of a running worker. Dropping it kills the process.
#[derive(Debug)]
pub struct WorkerHandle {
    pub pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    /// Asks the supervisor to kill the child. Returns false if a kill was
    /// already requested or the supervisor is gone.
    pub fn kill(&mut self) -> bool {
        match self.kill.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Spawns the child and its supervising task. Errors only when the OS refuses
/// to start the process.
pub fn spawn_worker(
    mut command: Command,
    job_id: JobId,
    generation: u64,
    reports: mpsc::UnboundedSender<WorkerReport>,
) -> std::io::Result<WorkerHandle> {
    let child = command.spawn()?;
    let pid = child.id();
    let (kill_tx, kill_rx) = oneshot::channel();

    tokio::spawn(supervise(child, kill_rx, job_id, generation, reports));

    Ok(WorkerHandle {
        pid,
        kill: Some(kill_tx),
    })
}

async fn supervise(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    job_id: JobId,
    generation: u64,
    reports: mpsc::UnboundedSender<WorkerReport>,
) {
    let report = |message: WorkerMessage| {
        let _ = reports.send(WorkerReport {
            job_id: job_id.clone(),
            generation,
            message,
        });
    };

    let stderr_task = child.stderr.take().map(|stderr| {
        let reports = reports.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = reports.send(WorkerReport {
                    job_id: job_id.clone(),
                    generation,
                    message: WorkerMessage::Stderr(line),
                });
            }
        })
    });

    let mut kill_requested = false;

    if let Some(stdout) = child.stdout.take() {
        let pump = pump_stdout(stdout, &report);
        tokio::pin!(pump);
        loop {
            tokio::select! {
                _ = &mut pump => break,
                _ = &mut kill_rx, if !kill_requested => {
                    kill_requested = true;
                    if let Err(err) = child.start_kill() {
                        tracing::debug!(job_id = %job_id, error = %err, "kill after exit");
                    }
                }
            }
        }
    }

    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx, if !kill_requested => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            tracing::warn!(job_id = %job_id, error = %err, "failed to wait for worker");
            None
        }
    };
    report(WorkerMessage::Exited(code));
}

async fn pump_stdout<R>(mut stdout: R, report: &impl Fn(WorkerMessage))
where
    R: AsyncRead + Unpin,
{
    let mut parser = ProgressParser::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for parsed in parser.feed(&buf[..n]) {
                    report(WorkerMessage::Line(parsed));
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "worker stdout read failed");
                break;
            }
        }
    }
    if let Some(parsed) = parser.finish() {
        report(WorkerMessage::Line(parsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> WorkerCommand {
        WorkerCommand::from_config(&OrchestratorConfig::default())
    }

    #[test]
    fn argv_follows_worker_contract() {
        let args = command().argv(
            "process",
            Path::new("/photos/a.jpg"),
            Path::new("/photos/edited"),
            Some("make it warmer"),
        );
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "src/cli_enhanced.py",
                "process",
                "/photos/a.jpg",
                "--output-dir",
                "/photos/edited",
                "--json-output",
                "--instructions",
                "make it warmer",
            ]
        );
    }

    #[test]
    fn blank_instructions_are_omitted() {
        let args = command().argv("process", Path::new("a.jpg"), Path::new("out"), Some("  "));
        assert!(!args.iter().any(|a| a == "--instructions"));
        assert_eq!(args.last().unwrap(), "--json-output");
    }

    #[test]
    fn path_prepend_goes_first() {
        let mut cmd = command();
        assert!(cmd.search_path().is_none());

        cmd.path_prepend = vec![PathBuf::from("/opt/bundled/bin")];
        let path = cmd.search_path().unwrap();
        let first = std::env::split_paths(&path).next().unwrap();
        assert_eq!(first, PathBuf::from("/opt/bundled/bin"));
    }

    #[test]
    fn output_dir_defaults_next_to_input() {
        assert_eq!(
            output_dir_for(None, Path::new("/photos/a.jpg")),
            PathBuf::from("/photos/edited")
        );
        assert_eq!(
            output_dir_for(Some(Path::new("/results")), Path::new("/photos/a.jpg")),
            PathBuf::from("/results")
        );
    }

    #[tokio::test]
    async fn artifact_scan_prefers_matching_stem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("other_edited.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("beach_edited.png"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let found = find_output_artifact(dir.path(), Path::new("/in/beach.jpg"))
            .await
            .unwrap();
        assert_eq!(found, Some(dir.path().join("beach_edited.png")));
    }

    #[tokio::test]
    async fn artifact_scan_falls_back_to_any_image() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("result.webp"), b"x").unwrap();
        let found = find_output_artifact(dir.path(), Path::new("/in/beach.jpg"))
            .await
            .unwrap();
        assert_eq!(found, Some(dir.path().join("result.webp")));

        let empty = tempfile::tempdir().unwrap();
        let none = find_output_artifact(empty.path(), Path::new("a.jpg"))
            .await
            .unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn kill_is_one_shot() {
        let (tx, _rx) = oneshot::channel();
        let mut handle = WorkerHandle {
            pid: None,
            kill: Some(tx),
        };
        assert!(handle.kill());
        assert!(!handle.kill());
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn sh(script: &str) -> Command {
            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg(script)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            command
        }

        async fn collect(mut rx: mpsc::UnboundedReceiver<WorkerReport>) -> Vec<WorkerMessage> {
            let mut messages = Vec::new();
            while let Some(report) = rx.recv().await {
                assert_eq!(report.job_id, "job-1");
                assert_eq!(report.generation, 7);
                let done = matches!(report.message, WorkerMessage::Exited(_));
                messages.push(report.message);
                if done {
                    break;
                }
            }
            messages
        }

        #[tokio::test]
        async fn reports_lines_stderr_then_exit() {
            let (tx, rx) = mpsc::unbounded_channel();
            let script = r#"echo '{"stage":"analysis"}'; echo 'warming up'; echo 'oops' >&2; printf '{"stage":"qc"}'; exit 3"#;
            let _handle = spawn_worker(sh(script), "job-1".into(), 7, tx).unwrap();

            let messages = collect(rx).await;
            assert_eq!(messages.last(), Some(&WorkerMessage::Exited(Some(3))));
            assert!(messages.contains(&WorkerMessage::Stderr("oops".into())));

            let stages: Vec<_> = messages
                .iter()
                .filter_map(|m| match m {
                    WorkerMessage::Line(ParsedLine::Event(e)) => e.stage.clone(),
                    _ => None,
                })
                .collect();
            assert_eq!(stages, vec!["analysis", "qc"]);
            assert!(messages.iter().any(|m| matches!(
                m,
                WorkerMessage::Line(ParsedLine::Diagnostic { text, .. }) if text == "warming up"
            )));
        }

        #[tokio::test]
        async fn kill_stops_a_long_running_worker() {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut handle = spawn_worker(sh("exec sleep 30"), "job-1".into(), 7, tx).unwrap();
            assert!(handle.pid.is_some());
            assert!(handle.kill());

            let messages = tokio::time::timeout(std::time::Duration::from_secs(5), collect(rx))
                .await
                .expect("worker should die promptly");
            assert_eq!(messages, vec![WorkerMessage::Exited(None)]);
        }

        #[tokio::test]
        async fn missing_program_fails_to_spawn() {
            let (tx, _rx) = mpsc::unbounded_channel();
            let result = spawn_worker(
                Command::new("/definitely/not/a/worker"),
                "job-1".into(),
                7,
                tx,
            );
            assert!(result.is_err());
        }
    }
}
