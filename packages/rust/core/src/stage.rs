//! Stage runner: one external transformation step as a supervised subprocess.
//!
//! The processor is launched with stdin closed and both output streams piped.
//! stderr is drained by a spawned task (captured verbatim for failure reports)
//! and stdout by another (logged only), while the caller waits for exit. The
//! result is finalised only after the exit status is observed and both drains
//! have joined, all within the stage's single deadline.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use memforge_shared::{MemforgeError, Result, StageKind, StagesConfig};

/// Grace period for the output drains once a killed child has been reaped.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Success,
    Failure,
}

/// Terminal outcome of one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub status: StageStatus,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Everything the process wrote to stderr.
    pub diagnostics: String,
    /// Output written by the stage; set only on success.
    pub output: Option<PathBuf>,
}

impl StageResult {
    pub fn success(output: impl Into<PathBuf>) -> Self {
        Self {
            status: StageStatus::Success,
            exit_code: Some(0),
            diagnostics: String::new(),
            output: Some(output.into()),
        }
    }

    pub fn failure(exit_code: Option<i32>, diagnostics: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failure,
            exit_code,
            diagnostics: diagnostics.into(),
            output: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Success
    }
}

// ---------------------------------------------------------------------------
// Stage capability
// ---------------------------------------------------------------------------

/// A transformation step `{input path, output path} → StageResult`.
///
/// The orchestrator only sees this trait, so subprocess processors, in-process
/// implementations, and test doubles are interchangeable.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Transform `input` into `output`.
    ///
    /// `Ok` with a failure status means the processor ran and failed;
    /// `Err` means it could not be run or supervised (spawn, timeout, I/O).
    async fn run(&self, input: &Path, output: &Path) -> Result<StageResult>;
}

// ---------------------------------------------------------------------------
// Subprocess runner
// ---------------------------------------------------------------------------

/// Executable, argument list, and working directory of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// Run `invocation` to completion.
///
/// Success iff the exit code is exactly 0. A launch failure is reported
/// immediately as [`MemforgeError::Spawn`]. `timeout` bounds the whole call:
/// waiting for exit and draining both output streams share one deadline, so a
/// background process still holding the pipes cannot keep the stage alive. On
/// expiry the processor's process group is killed and the stderr captured so
/// far is returned in [`MemforgeError::Timeout`].
#[instrument(skip_all, fields(stage = %stage, program = %invocation.program))]
pub async fn run_stage(
    stage: StageKind,
    invocation: &StageInvocation,
    timeout: Option<Duration>,
) -> Result<StageResult> {
    let started = Instant::now();
    let deadline = timeout.map(|limit| tokio::time::Instant::now() + limit);
    debug!(args = ?invocation.args, cwd = %invocation.working_dir.display(), "spawning stage processor");

    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .current_dir(&invocation.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own group, so expiry reaches anything the processor forked.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| MemforgeError::Spawn {
        stage,
        program: invocation.program.clone(),
        source,
    })?;
    let pid = child.id();

    let stderr = child.stderr.take().ok_or_else(|| MemforgeError::Spawn {
        stage,
        program: invocation.program.clone(),
        source: std::io::Error::other("stderr was not captured"),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| MemforgeError::Spawn {
        stage,
        program: invocation.program.clone(),
        source: std::io::Error::other("stdout was not captured"),
    })?;

    let captured = Arc::new(Mutex::new(Vec::new()));
    let drains = vec![
        tokio::spawn(drain(stage, stderr, Some(captured.clone()))),
        tokio::spawn(drain(stage, stdout, None)),
    ];
    let mut supervised = Supervised {
        stage,
        timeout,
        pid,
        child,
        drains,
        captured,
    };

    let waited = within(deadline, supervised.child.wait()).await;
    let status = match waited {
        Some(waited) => waited.map_err(|e| MemforgeError::io(&invocation.working_dir, e))?,
        None => return Err(supervised.expire().await),
    };

    let joined = within(deadline, supervised.join_drains()).await;
    match joined {
        Some(joined) => joined.map_err(|e| MemforgeError::io(&invocation.working_dir, e))?,
        None => {
            warn!(?status, "stage exited but its output streams are still held open");
            return Err(supervised.expire().await);
        }
    }

    let diagnostics = captured_text(&supervised.captured);
    let exit_code = status.code();

    info!(
        ?exit_code,
        diagnostics_bytes = diagnostics.len(),
        elapsed_ms = started.elapsed().as_millis(),
        "stage processor exited"
    );

    Ok(StageResult {
        status: if exit_code == Some(0) {
            StageStatus::Success
        } else {
            StageStatus::Failure
        },
        exit_code,
        diagnostics,
        output: None,
    })
}

/// `fut` bounded by `deadline`; `None` once the deadline has passed.
async fn within<F: Future>(deadline: Option<tokio::time::Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// A running processor together with its output drains.
struct Supervised {
    stage: StageKind,
    timeout: Option<Duration>,
    pid: Option<u32>,
    child: Child,
    /// Drains not yet joined.
    drains: Vec<JoinHandle<std::io::Result<()>>>,
    captured: Arc<Mutex<Vec<u8>>>,
}

impl Supervised {
    /// Join the drains in order. A joined handle is dropped at once, so a
    /// deadline cutting this short leaves only unfinished handles behind.
    async fn join_drains(&mut self) -> std::io::Result<()> {
        while let Some(task) = self.drains.first_mut() {
            let joined = task.await;
            self.drains.remove(0);
            joined.map_err(std::io::Error::other)??;
        }
        Ok(())
    }

    /// Kill everything the stage started and report the timeout.
    async fn expire(mut self) -> MemforgeError {
        let after = self.timeout.unwrap_or_default();
        warn!(timeout_secs = after.as_secs_f64(), "stage exceeded its time budget, killing");

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            kill_process_group(pid).await;
        }
        // Also reaps the direct child; fails harmlessly if it already exited.
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "direct child already gone");
        }

        for task in self.drains {
            let abort = task.abort_handle();
            if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
                abort.abort();
            }
        }

        MemforgeError::Timeout {
            stage: self.stage,
            after,
            diagnostics: captured_text(&self.captured),
        }
    }
}

fn captured_text(captured: &Mutex<Vec<u8>>) -> String {
    let bytes = captured.lock().unwrap_or_else(PoisonError::into_inner);
    String::from_utf8_lossy(&bytes).into_owned()
}

/// SIGKILL the whole process group led by `pgid`.
#[cfg(unix)]
async fn kill_process_group(pgid: u32) {
    let group = format!("-{pgid}");
    let result = Command::new("kill")
        .args(["-9", "--", group.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => debug!(pgid, "killed stage process group"),
        Ok(status) => debug!(pgid, ?status, "process group already gone"),
        Err(e) => warn!(pgid, error = %e, "failed to signal stage process group"),
    }
}

/// Read a child stream to EOF, logging each line. When `capture` is set
/// (stderr), lines are also appended to it as they arrive, so a partial
/// stream survives a kill.
async fn drain<R>(
    stage: StageKind,
    stream: R,
    capture: Option<Arc<Mutex<Vec<u8>>>>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        match &capture {
            Some(captured) => {
                warn!(%stage, line = %text.trim_end(), "stage stderr");
                captured
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&line);
            }
            None => debug!(%stage, line = %text.trim_end(), "stage stdout"),
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Subprocess-backed stage
// ---------------------------------------------------------------------------

/// A stage backed by an external processor invoked as
/// `<program> <leading args…> --input <in> --output <out>`.
#[derive(Debug, Clone)]
pub struct SubprocessStage {
    kind: StageKind,
    program: String,
    leading_args: Vec<String>,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl SubprocessStage {
    pub fn new(
        kind: StageKind,
        program: impl Into<String>,
        leading_args: Vec<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind,
            program: program.into(),
            leading_args,
            working_dir: working_dir.into(),
            timeout: None,
        }
    }

    /// The configured Python script for `kind`.
    pub fn from_config(kind: StageKind, config: &StagesConfig) -> Self {
        let script = match kind {
            StageKind::Smart => &config.smart_script,
            StageKind::Finetune => &config.finetune_script,
        };
        Self::new(
            kind,
            &config.python,
            vec![script.clone()],
            &config.working_dir,
        )
        .with_timeout(config.timeout())
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn invocation(&self, input: &Path, output: &Path) -> StageInvocation {
        let mut args = self.leading_args.clone();
        args.extend([
            "--input".to_string(),
            input.display().to_string(),
            "--output".to_string(),
            output.display().to_string(),
        ]);
        StageInvocation {
            program: self.program.clone(),
            args,
            working_dir: self.working_dir.clone(),
        }
    }
}

#[async_trait]
impl Stage for SubprocessStage {
    fn name(&self) -> &str {
        self.leading_args
            .first()
            .map(String::as_str)
            .unwrap_or(&self.program)
    }

    async fn run(&self, input: &Path, output: &Path) -> Result<StageResult> {
        let invocation = self.invocation(input, output);
        let mut result = run_stage(self.kind, &invocation, self.timeout).await?;
        if result.is_success() {
            result.output = Some(output.to_path_buf());
        }
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sh(script: &str) -> StageInvocation {
        StageInvocation {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn exit_zero_is_success() {
        let result = run_stage(StageKind::Smart, &sh("exit 0"), None).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.exit_code, Some(0));
        assert!(result.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_with_diagnostics() {
        let result = run_stage(
            StageKind::Smart,
            &sh("echo 'bad input' >&2; exit 2"),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.status, StageStatus::Failure);
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.diagnostics, "bad input\n");
        assert!(result.output.is_none());
    }

    #[tokio::test]
    async fn exit_one_without_output_is_failure() {
        let result = run_stage(StageKind::Finetune, &sh("exit 1"), None).await.unwrap();
        assert!(!result.is_success());
        assert!(result.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn stderr_on_success_is_kept() {
        let result = run_stage(StageKind::Smart, &sh("echo warming up >&2"), None)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.diagnostics, "warming up\n");
    }

    #[tokio::test]
    async fn large_output_does_not_deadlock() {
        // Well past any pipe buffer on both streams.
        let script = "i=0; while [ $i -lt 4000 ]; do \
                      echo 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx' >&2; \
                      echo 'yyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyy'; \
                      i=$((i+1)); done; exit 3";
        let result = run_stage(
            StageKind::Smart,
            &sh(script),
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.diagnostics.lines().count(), 4000);
    }

    #[tokio::test]
    async fn signal_termination_is_failure() {
        let result = run_stage(StageKind::Smart, &sh("kill -9 $$"), None).await.unwrap();
        assert_eq!(result.status, StageStatus::Failure);
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_failure() {
        let invocation = StageInvocation {
            program: format!("/nonexistent/memforge-{}", Uuid::now_v7()),
            args: vec![],
            working_dir: std::env::temp_dir(),
        };
        let err = run_stage(StageKind::Finetune, &invocation, None)
            .await
            .unwrap_err();

        match err {
            MemforgeError::Spawn { stage, .. } => assert_eq!(stage, StageKind::Finetune),
            other => panic!("expected Spawn, got {other}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let started = Instant::now();
        let err = run_stage(
            StageKind::Smart,
            &sh("echo 'stuck on record 42' >&2; exec sleep 30"),
            Some(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        match &err {
            MemforgeError::Timeout {
                stage,
                after,
                diagnostics,
            } => {
                assert_eq!(*stage, StageKind::Smart);
                assert_eq!(*after, Duration::from_millis(300));
                assert_eq!(diagnostics, "stuck on record 42\n");
            }
            other => panic!("expected Timeout, got {other}"),
        }
        let msg = err.to_string();
        assert!(msg.contains("300ms"), "{msg}");
        assert!(msg.contains("stuck on record 42"), "{msg}");
    }

    #[tokio::test]
    async fn background_child_holding_pipes_is_bounded() {
        let started = Instant::now();
        let err = run_stage(
            StageKind::Finetune,
            &sh("sleep 8 & exit 0"),
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();

        assert!(
            started.elapsed() < Duration::from_secs(3),
            "stage outlived its budget: {:?}",
            started.elapsed()
        );
        assert!(matches!(err, MemforgeError::Timeout { stage: StageKind::Finetune, .. }));
    }

    #[tokio::test]
    async fn timeout_kills_forked_children() {
        let dir = std::env::temp_dir().join(format!("mf-stage-group-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let marker = dir.join("survived");

        let script = format!("(sleep 2; touch '{}') & sleep 30", marker.display());
        let err = run_stage(StageKind::Smart, &sh(&script), Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(matches!(err, MemforgeError::Timeout { .. }));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "forked child outlived the stage");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invocation_appends_io_flags() {
        let stage = SubprocessStage::new(
            StageKind::Smart,
            "python3",
            vec!["scripts/generate_jsonl_smart.py".into()],
            "/srv/app",
        );
        let inv = stage.invocation(Path::new("/s/data.txt"), Path::new("/s/memories.jsonl"));

        assert_eq!(inv.program, "python3");
        assert_eq!(
            inv.args,
            [
                "scripts/generate_jsonl_smart.py",
                "--input",
                "/s/data.txt",
                "--output",
                "/s/memories.jsonl"
            ]
        );
        assert_eq!(inv.working_dir, PathBuf::from("/srv/app"));
        assert_eq!(stage.name(), "scripts/generate_jsonl_smart.py");
    }

    #[test]
    fn from_config_uses_stage_script_and_timeout() {
        let config = StagesConfig::default();
        let stage = SubprocessStage::from_config(StageKind::Finetune, &config);
        assert_eq!(stage.name(), "scripts/prepare_finetune_dataset.py");
        assert_eq!(stage.timeout, Some(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn subprocess_stage_reports_output_on_success() {
        let dir = std::env::temp_dir().join(format!("mf-stage-test-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("in.txt");
        let output = dir.join("out.jsonl");
        std::fs::write(&input, "A\n\n").unwrap();

        // `sh -c <script> <$0> --input <in> --output <out>`
        let stage = SubprocessStage::new(
            StageKind::Smart,
            "sh",
            vec!["-c".into(), r#"cp "$2" "$4""#.into(), "copy-stage".into()],
            &dir,
        );
        let result = stage.run(&input, &output).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.output.as_deref(), Some(output.as_path()));
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "A\n\n");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
