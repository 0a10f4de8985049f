//! LSF adapter.
//!
//! Submits through `bsub` with adapter-controlled output and error files,
//! takes the job id from the `Job <N>` acknowledgement, and waits for the
//! rendered report file instead of polling a status command. The user
//! output is the banner-framed section of that report.

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

use super::{remove_artifacts, run_streamed, strip_reserved, temp_log, JobHandle, JobLifecycle};

/// Flags the adapter itself controls; stripped from caller specs.
const RESERVED_FLAGS: &[&str] = &["-e", "-o", "-eo"];

/// Poll interval while waiting for the rendered report file.
const REPORT_POLL: Duration = Duration::from_secs(1);

/// A job prepared for submission through LSF.
pub struct LsfJob {
    job: Arc<Job>,
    args: Vec<String>,
    script: PathBuf,
    out_path: PathBuf,
    err_path: PathBuf,
    handle: JobHandle,
    submitted: bool,
}

impl LsfJob {
    /// Materialize the script, allocate the report files and assemble the
    /// bsub argument vector.
    pub(crate) async fn prepare(job: Arc<Job>) -> HpcResult<Self> {
        let script = script::materialize(&job).await?;
        let out_path = temp_log(&job, "lsf_out").await?;
        let err_path = match temp_log(&job, "lsf_err").await {
            Ok(path) => path,
            Err(e) => {
                // Partial preparation must not leak the first log file.
                let _ = fs::remove_file(&out_path).await;
                return Err(e);
            }
        };

        let mut args = Vec::new();
        if let Some(bank) = &job.bank {
            args.push("-G".to_string());
            args.push(bank.clone());
        }
        args.push("-o".to_string());
        args.push(out_path.display().to_string());
        args.push("-e".to_string());
        args.push(err_path.display().to_string());
        args.extend(strip_reserved(&job.native_specs, RESERVED_FLAGS));

        let handle = JobHandle::new(Some(BatchSystem::Lsf), job.uid, job.gid);
        Ok(Self {
            job,
            args,
            script,
            out_path,
            err_path,
            handle,
            submitted: false,
        })
    }

    /// The assembled bsub arguments (before the trailing script path).
    pub fn submit_args(&self) -> &[String] {
        &self.args
    }

    async fn submit_and_wait(&self, token: &CancellationToken) -> HpcResult<String> {
        let argv = launcher::argv("bsub", &self.args, &self.script);
        let cmd = launcher::command(&argv, self.job.uid, self.job.gid)?;
        let captured = run_streamed(cmd, "bsub", &self.job, token).await?;

        if !captured.stderr.is_empty() {
            warn!(stderr = %captured.stderr.trim(), "bsub wrote to stderr");
        }
        if !captured.success {
            return Err(HpcError::Submission {
                command: format!("bsub {}", self.args.join(" ")),
                status: captured.code,
                stderr: captured.stderr.trim().to_string(),
            });
        }

        let job_id = output::parse_lsf_job_id(&captured.stdout)?;
        self.handle.assign(job_id);
        self.job.print(&format!("Waiting for job {job_id} to complete."));

        // The report file is rendered when the job finishes; waiting for its
        // banners is the entire monitoring phase.
        loop {
            if let Ok(text) = fs::read_to_string(&self.out_path).await {
                if let Ok(body) = output::extract_lsf_report(&text, &self.out_path) {
                    return Ok(body);
                }
            }
            tokio::time::sleep(REPORT_POLL).await;
        }
    }
}

#[async_trait]
impl JobLifecycle for LsfJob {
    async fn run(&mut self) -> HpcResult<String> {
        if self.submitted {
            return Err(HpcError::AlreadySubmitted);
        }
        self.submitted = true;

        let token = CancellationToken::new();
        let result = self.submit_and_wait(&token).await;
        token.cancel();
        remove_artifacts(&self.job, &[&self.out_path, &self.err_path]).await;
        result
    }

    async fn kill(&self) -> HpcResult<()> {
        self.handle.kill().await
    }

    fn handle(&self) -> JobHandle {
        self.handle.clone()
    }
}
