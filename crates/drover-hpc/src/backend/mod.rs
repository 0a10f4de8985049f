//! Backend adapters implementing the uniform job lifecycle.
//!
//! Each supported batch system (plus plain local execution) gets one adapter
//! variant behind the [`JobLifecycle`] capability trait. The closed
//! [`BackendJob`] enum makes the variant set exhaustive; a factory keyed by
//! detection constructs the right one.

mod cobalt;
mod local;
mod lsf;
mod slurm;

pub use cobalt::CobaltJob;
pub use local::LocalJob;
pub use lsf::LsfJob;
pub use slurm::SlurmJob;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::detect::{self, BatchSystem};
use crate::error::{HpcError, HpcResult};
use crate::job::{Job, PrintCallback};
use crate::launcher;
use crate::tailer;

/// The uniform lifecycle every backend adapter implements.
///
/// `prepare` is the adapter's constructor (script materialized, output files
/// allocated, argument vector assembled); `run` submits and drives the job to
/// completion; `kill` cancels a previously submitted job by its remembered
/// identifier.
#[async_trait]
pub trait JobLifecycle {
    /// Submit the job and drive it to completion, returning its output.
    async fn run(&mut self) -> HpcResult<String>;

    /// Cancel the submitted job via the scheduler's cancellation command.
    async fn kill(&self) -> HpcResult<()>;

    /// A cloneable handle for out-of-band kill requests.
    fn handle(&self) -> JobHandle;
}

/// A prepared job bound to one backend.
pub enum BackendJob {
    Local(LocalJob),
    Lsf(LsfJob),
    Slurm(SlurmJob),
    Cobalt(CobaltJob),
}

impl BackendJob {
    /// Detect the installed batch system and prepare the matching adapter.
    ///
    /// When the job requests local execution, detection is skipped and the
    /// local adapter is used unconditionally.
    pub async fn prepare(job: Arc<Job>) -> HpcResult<Self> {
        if !job.batch_execution {
            return Ok(BackendJob::Local(LocalJob::prepare(job).await?));
        }
        match detect::detect()? {
            BatchSystem::Slurm => Ok(BackendJob::Slurm(SlurmJob::prepare(job).await?)),
            BatchSystem::Lsf => Ok(BackendJob::Lsf(LsfJob::prepare(job).await?)),
            BatchSystem::Cobalt => Ok(BackendJob::Cobalt(CobaltJob::prepare(job).await?)),
        }
    }

    /// Name of the backend this job is bound to.
    pub fn backend_name(&self) -> &'static str {
        match self {
            BackendJob::Local(_) => "local",
            BackendJob::Lsf(_) => "LSF",
            BackendJob::Slurm(_) => "Slurm",
            BackendJob::Cobalt(_) => "Cobalt",
        }
    }

    /// Submit the job and drive it to completion, returning its output.
    pub async fn run(&mut self) -> HpcResult<String> {
        match self {
            BackendJob::Local(j) => j.run().await,
            BackendJob::Lsf(j) => j.run().await,
            BackendJob::Slurm(j) => j.run().await,
            BackendJob::Cobalt(j) => j.run().await,
        }
    }

    /// Run the job and wrap the result in a normalized report.
    pub async fn run_report(&mut self) -> HpcResult<JobReport> {
        let backend = self.backend_name().to_string();
        let output = self.run().await?;
        Ok(JobReport {
            backend,
            job_id: self.handle().job_id(),
            output,
        })
    }

    /// Cancel the submitted job.
    pub async fn kill(&self) -> HpcResult<()> {
        match self {
            BackendJob::Local(j) => j.kill().await,
            BackendJob::Lsf(j) => j.kill().await,
            BackendJob::Slurm(j) => j.kill().await,
            BackendJob::Cobalt(j) => j.kill().await,
        }
    }

    /// A cloneable handle for out-of-band kill requests.
    pub fn handle(&self) -> JobHandle {
        match self {
            BackendJob::Local(j) => j.handle(),
            BackendJob::Lsf(j) => j.handle(),
            BackendJob::Slurm(j) => j.handle(),
            BackendJob::Cobalt(j) => j.handle(),
        }
    }
}

/// Normalized result of a completed run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobReport {
    /// Backend the job ran on.
    pub backend: String,
    /// Scheduler-assigned identifier, if the backend produces one.
    pub job_id: Option<u64>,
    /// Captured or extracted job output.
    pub output: String,
}

/// Handle for cancelling a submitted job out-of-band.
///
/// The handle is cheap to clone and can be retained by the caller while
/// `run` is in flight; the scheduler-assigned identifier becomes visible
/// only once the submission acknowledgement has been parsed. Each job gets
/// its own handle, so multiple jobs can be in flight in one process.
#[derive(Clone, Debug)]
pub struct JobHandle {
    system: Option<BatchSystem>,
    uid: u32,
    gid: u32,
    job_id: Arc<OnceLock<u64>>,
}

impl JobHandle {
    pub(crate) fn new(system: Option<BatchSystem>, uid: u32, gid: u32) -> Self {
        Self {
            system,
            uid,
            gid,
            job_id: Arc::new(OnceLock::new()),
        }
    }

    /// Record the scheduler-assigned identifier. First assignment wins.
    pub(crate) fn assign(&self, id: u64) {
        let _ = self.job_id.set(id);
    }

    /// The scheduler-assigned identifier, once submission is acknowledged.
    pub fn job_id(&self) -> Option<u64> {
        self.job_id.get().copied()
    }

    /// The batch system this handle cancels against; `None` for local runs.
    pub fn backend(&self) -> Option<BatchSystem> {
        self.system
    }

    /// Issue the scheduler's cancellation command against the remembered
    /// identifier.
    pub async fn kill(&self) -> HpcResult<()> {
        let Some(system) = self.system else {
            return Err(HpcError::Cancellation {
                command: "(local)".to_string(),
                message: "local jobs run in the foreground and cannot be cancelled by identifier"
                    .to_string(),
            });
        };
        let id = self.job_id().ok_or(HpcError::NoJobId)?;

        let program = match system {
            BatchSystem::Slurm => "scancel",
            BatchSystem::Lsf => "bkill",
            BatchSystem::Cobalt => "qdel",
        };
        let argv = vec![program.to_string(), id.to_string()];
        let cmd = launcher::command(&argv, self.uid, self.gid)?;
        let captured = run_captured(cmd, program).await?;
        if !captured.success {
            return Err(HpcError::Cancellation {
                command: format!("{program} {id}"),
                message: captured.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Remove reserved flags (and each flag's following value token) from a
/// caller-supplied native-spec list.
///
/// A token following a reserved flag is swallowed only when it does not
/// itself look like a flag, so `["-o", "-p"]` drops `-o` but keeps `-p`.
pub fn strip_reserved(specs: &[String], reserved: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip = false;
    for (i, token) in specs.iter().enumerate() {
        if skip {
            skip = false;
            continue;
        }
        let is_reserved = reserved
            .iter()
            .any(|flag| token == flag || token.starts_with(&format!("{flag}=")));
        if is_reserved {
            if specs.get(i + 1).is_some_and(|next| !next.starts_with('-')) {
                skip = true;
            }
            continue;
        }
        out.push(token.clone());
    }
    out
}

/// Captured result of a finished subprocess.
pub(crate) struct Captured {
    pub success: bool,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command to completion, buffering its output.
pub(crate) async fn run_captured(mut cmd: Command, program: &str) -> HpcResult<Captured> {
    let output = cmd.output().await.map_err(|e| HpcError::Launch {
        command: program.to_string(),
        message: e.to_string(),
    })?;
    Ok(Captured {
        success: output.status.success(),
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command to completion while streaming every stdout/stderr line to
/// the job's callback through pipe tailers, buffering both streams as well.
pub(crate) async fn run_streamed(
    mut cmd: Command,
    program: &str,
    job: &Job,
    token: &CancellationToken,
) -> HpcResult<Captured> {
    let launch_err = |message: String| HpcError::Launch {
        command: program.to_string(),
        message,
    };

    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| launch_err(e.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| launch_err("could not open stdout pipe".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| launch_err("could not open stderr pipe".to_string()))?;

    let out_lines = Arc::new(Mutex::new(Vec::new()));
    let err_lines = Arc::new(Mutex::new(Vec::new()));
    let out_task = tokio::spawn(tailer::tail_pipe(
        BufReader::new(stdout),
        buffering_sink(&out_lines, job.print_callback.clone()),
        token.clone(),
    ));
    let err_task = tokio::spawn(tailer::tail_pipe(
        BufReader::new(stderr),
        buffering_sink(&err_lines, job.print_callback.clone()),
        token.clone(),
    ));

    let status = child.wait().await.map_err(|e| launch_err(e.to_string()))?;
    let _ = out_task.await;
    let _ = err_task.await;

    Ok(Captured {
        success: status.success(),
        code: status.code().unwrap_or(-1),
        stdout: join_lines(&out_lines),
        stderr: join_lines(&err_lines),
    })
}

fn buffering_sink(buffer: &Arc<Mutex<Vec<String>>>, forward: PrintCallback) -> PrintCallback {
    let buffer = Arc::clone(buffer);
    Arc::new(move |line: &str| {
        buffer.lock().unwrap().push(line.to_string());
        forward(line);
    })
}

fn join_lines(lines: &Arc<Mutex<Vec<String>>>) -> String {
    let lines = lines.lock().unwrap();
    if lines.is_empty() {
        String::new()
    } else {
        format!("{}\n", lines.join("\n"))
    }
}

/// Allocate one adapter-owned temporary log file, chowned to the job's
/// target identity before any external command can write into it.
pub(crate) async fn temp_log(job: &Job, prefix: &str) -> HpcResult<PathBuf> {
    let unique = chrono::Utc::now().timestamp_micros();
    let path = job.work_dir.join(format!("{prefix}-{unique}.log"));

    fs::File::create(&path)
        .await
        .map_err(|e| HpcError::ScriptPreparation {
            path: path.clone(),
            message: format!("creating output file failed: {e}"),
        })?;
    nix::unistd::chown(
        &path,
        Some(nix::unistd::Uid::from_raw(job.uid)),
        Some(nix::unistd::Gid::from_raw(job.gid)),
    )
    .map_err(|e| HpcError::ScriptPreparation {
        path: path.clone(),
        message: format!("chown to {}:{} failed: {e}", job.uid, job.gid),
    })?;

    Ok(path)
}

/// Remove adapter-owned temporary files once their content has been
/// consumed, unless the job requested artifact retention.
pub(crate) async fn remove_artifacts(job: &Job, paths: &[&PathBuf]) {
    if job.keep_artifacts {
        return;
    }
    for path in paths {
        if let Err(e) = fs::remove_file(path).await {
            debug!(path = %path.display(), error = %e, "could not remove artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_strip_reserved_swallows_value() {
        let stripped = strip_reserved(
            &specs(&["-o", "/tmp/x", "-p", "myproj"]),
            &["-o", "-e", "--debuglog"],
        );
        assert_eq!(stripped, specs(&["-p", "myproj"]));
    }

    #[test]
    fn test_strip_reserved_never_swallows_flags() {
        let stripped = strip_reserved(&specs(&["-o", "-p", "myproj"]), &["-o"]);
        assert_eq!(stripped, specs(&["-p", "myproj"]));
    }

    #[test]
    fn test_strip_reserved_equals_form() {
        let stripped = strip_reserved(
            &specs(&["--debuglog=/tmp/d.log", "-n", "4"]),
            &["-o", "-e", "--debuglog"],
        );
        assert_eq!(stripped, specs(&["-n", "4"]));
    }

    #[test]
    fn test_strip_reserved_at_end_of_list() {
        let stripped = strip_reserved(&specs(&["-n", "4", "-o"]), &["-o"]);
        assert_eq!(stripped, specs(&["-n", "4"]));
    }

    #[test]
    fn test_strip_reserved_untouched_without_matches() {
        let original = specs(&["-q", "debug", "-t", "30"]);
        assert_eq!(strip_reserved(&original, &["-o"]), original);
    }

    #[test]
    fn test_handle_exposes_no_id_before_ack() {
        let handle = JobHandle::new(Some(BatchSystem::Slurm), 1000, 1000);
        assert_eq!(handle.job_id(), None);

        handle.assign(4821);
        assert_eq!(handle.job_id(), Some(4821));

        // First assignment wins.
        handle.assign(9999);
        assert_eq!(handle.job_id(), Some(4821));
    }

    #[tokio::test]
    async fn test_temp_logs_cleaned_unless_retained() {
        let dir = tempfile::tempdir().unwrap();
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let job = Job::new("echo hi", dir.path(), uid, gid);

        let log = temp_log(&job, "slurm_out").await.unwrap();
        assert!(log.exists());
        remove_artifacts(&job, &[&log]).await;
        assert!(!log.exists());

        let job = job.keep_artifacts();
        let kept = temp_log(&job, "slurm_out").await.unwrap();
        remove_artifacts(&job, &[&kept]).await;
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn test_kill_before_ack_is_an_error() {
        let handle = JobHandle::new(Some(BatchSystem::Slurm), 1000, 1000);
        assert!(matches!(handle.kill().await, Err(HpcError::NoJobId)));
    }

    #[tokio::test]
    async fn test_kill_local_is_an_error() {
        let handle = JobHandle::new(None, 1000, 1000);
        handle.assign(1);
        assert!(matches!(
            handle.kill().await,
            Err(HpcError::Cancellation { .. })
        ));
    }
}
