//! Cobalt adapter.
//!
//! Submits through `qsub` with adapter-controlled output, error and debug
//! log files, reads the bare numeric job id from the acknowledgement, and
//! reruns `qstat` until it stops recognizing the job. The debug log is
//! tailed live; the final report concatenates it with labeled stdout and
//! stderr sections.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::detect::BatchSystem;
use crate::error::{HpcError, HpcResult};
use crate::job::Job;
use crate::launcher;
use crate::output;
use crate::script;
use crate::tailer;

use super::{remove_artifacts, run_captured, strip_reserved, temp_log, JobHandle, JobLifecycle};

/// Flags the adapter itself controls; stripped from caller specs.
const RESERVED_FLAGS: &[&str] = &["-o", "-e", "--debuglog"];

/// Interval between qstat reruns.
const STATUS_POLL: Duration = Duration::from_secs(10);

/// A job prepared for submission through Cobalt.
pub struct CobaltJob {
    job: Arc<Job>,
    args: Vec<String>,
    script: PathBuf,
    out_path: PathBuf,
    err_path: PathBuf,
    debug_path: PathBuf,
    handle: JobHandle,
    submitted: bool,
}

impl CobaltJob {
    /// Materialize the script, allocate the three log files and assemble
    /// the qsub argument vector.
    pub(crate) async fn prepare(job: Arc<Job>) -> HpcResult<Self> {
        let script = script::materialize(&job).await?;
        let out_path = temp_log(&job, "cobalt_out").await?;
        let err_path = match temp_log(&job, "cobalt_err").await {
            Ok(path) => path,
            Err(e) => {
                // Partial preparation must not leak earlier log files.
                let _ = fs::remove_file(&out_path).await;
                return Err(e);
            }
        };
        let debug_path = match temp_log(&job, "cobalt_debug").await {
            Ok(path) => path,
            Err(e) => {
                let _ = fs::remove_file(&out_path).await;
                let _ = fs::remove_file(&err_path).await;
                return Err(e);
            }
        };

        let mut args = vec![
            "-o".to_string(),
            out_path.display().to_string(),
            "-e".to_string(),
            err_path.display().to_string(),
            "--debuglog".to_string(),
            debug_path.display().to_string(),
        ];
        if let Some(bank) = &job.bank {
            args.push("-p".to_string());
            args.push(bank.clone());
        }
        args.extend(strip_reserved(&job.native_specs, RESERVED_FLAGS));

        let handle = JobHandle::new(Some(BatchSystem::Cobalt), job.uid, job.gid);
        Ok(Self {
            job,
            args,
            script,
            out_path,
            err_path,
            debug_path,
            handle,
            submitted: false,
        })
    }

    /// The assembled qsub arguments (before the trailing script path).
    pub fn submit_args(&self) -> &[String] {
        &self.args
    }

    async fn submit(&self) -> HpcResult<u64> {
        let argv = launcher::argv("qsub", &self.args, &self.script);
        let cmd = launcher::command(&argv, self.job.uid, self.job.gid)?;
        let captured = run_captured(cmd, "qsub").await?;

        if !captured.stderr.is_empty() {
            warn!(stderr = %captured.stderr.trim(), "qsub wrote to stderr");
            for line in captured.stderr.lines() {
                self.job.print(line);
            }
        }
        if !captured.success {
            return Err(HpcError::Submission {
                command: format!("qsub {}", self.args.join(" ")),
                status: captured.code,
                stderr: captured.stderr.trim().to_string(),
            });
        }

        let job_id = output::parse_cobalt_job_id(&captured.stdout)?;
        self.handle.assign(job_id);
        self.job.print(&format!("Waiting for job {job_id} to complete."));
        Ok(job_id)
    }

    /// Rerun qstat until it exits non-zero, which Cobalt uses to signal
    /// that the job is no longer queued or running.
    async fn monitor(&self, job_id: u64) -> HpcResult<()> {
        loop {
            let argv = vec!["qstat".to_string(), job_id.to_string()];
            let cmd = launcher::command(&argv, self.job.uid, self.job.gid)?;
            let captured = run_captured(cmd, "qstat")
                .await
                .map_err(|e| HpcError::Monitoring {
                    command: format!("qstat {job_id}"),
                    message: e.to_string(),
                })?;

            if !captured.success {
                return Ok(());
            }
            tokio::time::sleep(STATUS_POLL).await;
        }
    }

    async fn drive(&self, token: &CancellationToken) -> HpcResult<()> {
        let job_id = self.submit().await?;

        let tail = tokio::spawn(tailer::tail_file(
            self.debug_path.clone(),
            self.job.print_callback.clone(),
            token.clone(),
        ));

        let monitored = self.monitor(job_id).await;
        token.cancel();
        let _ = tail.await;
        monitored
    }

    /// Assemble the combined report from the three log files.
    async fn collect_output(&self) -> HpcResult<String> {
        let mut sections = Vec::with_capacity(3);
        for path in [&self.debug_path, &self.out_path, &self.err_path] {
            let text = fs::read_to_string(path)
                .await
                .map_err(|e| HpcError::OutputRetrieval {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
            sections.push(text);
        }
        Ok(output::labeled_report(
            &sections[0],
            &sections[1],
            &sections[2],
        ))
    }
}

#[async_trait]
impl JobLifecycle for CobaltJob {
    async fn run(&mut self) -> HpcResult<String> {
        if self.submitted {
            return Err(HpcError::AlreadySubmitted);
        }
        self.submitted = true;

        let token = CancellationToken::new();
        let outcome = self.drive(&token).await;
        token.cancel();

        let output = match &outcome {
            Ok(()) => self.collect_output().await,
            Err(_) => Ok(String::new()),
        };
        remove_artifacts(
            &self.job,
            &[&self.out_path, &self.err_path, &self.debug_path],
        )
        .await;

        outcome?;
        output
    }

    async fn kill(&self) -> HpcResult<()> {
        self.handle.kill().await
    }

    fn handle(&self) -> JobHandle {
        self.handle.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_identity() -> (u32, u32) {
        (
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        )
    }

    #[tokio::test]
    async fn test_prepare_owns_all_three_logs() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = current_identity();
        let job = Arc::new(Job::new("echo hi", dir.path(), uid, gid));

        let cobalt = CobaltJob::prepare(job).await.unwrap();

        use std::os::unix::fs::MetadataExt;
        for path in [&cobalt.out_path, &cobalt.err_path, &cobalt.debug_path] {
            let meta = std::fs::metadata(path).unwrap();
            assert_eq!(meta.uid(), uid);
            assert_eq!(meta.gid(), gid);
        }
    }

    #[tokio::test]
    async fn test_prepare_strips_reserved_and_appends_bank() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = current_identity();
        let job = Arc::new(
            Job::new("echo hi", dir.path(), uid, gid)
                .with_bank("myproj")
                .with_native_specs(["-o", "/tmp/x", "--debuglog", "/tmp/d", "-t", "30"]),
        );

        let cobalt = CobaltJob::prepare(job).await.unwrap();
        let args = cobalt.submit_args();

        // Adapter-owned file flags come first, then -p <bank>, then what
        // survives of the caller's specs.
        assert_eq!(args[0], "-o");
        assert_eq!(args[2], "-e");
        assert_eq!(args[4], "--debuglog");
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"myproj".to_string()));
        assert!(!args.contains(&"/tmp/x".to_string()));
        assert!(!args.contains(&"/tmp/d".to_string()));
        assert!(args.contains(&"-t".to_string()));
        assert!(args.contains(&"30".to_string()));
    }

    #[tokio::test]
    async fn test_artifact_names_follow_log_convention() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = current_identity();
        let job = Arc::new(Job::new("echo hi", dir.path(), uid, gid));

        let cobalt = CobaltJob::prepare(job).await.unwrap();
        let name = |p: &PathBuf| p.file_name().unwrap().to_str().unwrap().to_string();

        assert!(name(&cobalt.out_path).starts_with("cobalt_out-"));
        assert!(name(&cobalt.err_path).starts_with("cobalt_err-"));
        assert!(name(&cobalt.debug_path).starts_with("cobalt_debug-"));
        for p in [&cobalt.out_path, &cobalt.err_path, &cobalt.debug_path] {
            assert!(name(p).ends_with(".log"));
        }
    }
}
