//! Slurm adapter.
//!
//! Submits through `sbatch` with an adapter-controlled output file, then
//! polls `squeue` until the job id disappears from the listing and asks
//! `sacct` for the terminal state and exit code. The output file is tailed
//! to the caller while the job runs and returned verbatim at the end.

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
use crate::output::{self, AccountingRecord};
use crate::script;
use crate::tailer;

use super::{remove_artifacts, run_captured, strip_reserved, temp_log, JobHandle, JobLifecycle};

/// Flags the adapter itself controls; stripped from caller specs.
const RESERVED_FLAGS: &[&str] = &["-o"];

/// Interval between squeue polls.
const STATUS_POLL: Duration = Duration::from_secs(5);

/// A job prepared for submission through Slurm.
pub struct SlurmJob {
    job: Arc<Job>,
    args: Vec<String>,
    script: PathBuf,
    out_path: PathBuf,
    handle: JobHandle,
    submitted: bool,
}

impl SlurmJob {
    /// Materialize the script, allocate the output file and assemble the
    /// sbatch argument vector.
    pub(crate) async fn prepare(job: Arc<Job>) -> HpcResult<Self> {
        let script = script::materialize(&job).await?;
        let out_path = temp_log(&job, "slurm_out").await?;

        let mut args = Vec::new();
        if let Some(bank) = &job.bank {
            args.push("-A".to_string());
            args.push(bank.clone());
        }
        args.push("-o".to_string());
        args.push(out_path.display().to_string());
        args.extend(strip_reserved(&job.native_specs, RESERVED_FLAGS));

        let handle = JobHandle::new(Some(BatchSystem::Slurm), job.uid, job.gid);
        Ok(Self {
            job,
            args,
            script,
            out_path,
            handle,
            submitted: false,
        })
    }

    /// The assembled sbatch arguments (before the trailing script path).
    pub fn submit_args(&self) -> &[String] {
        &self.args
    }

    async fn submit(&self) -> HpcResult<u64> {
        let argv = launcher::argv("sbatch", &self.args, &self.script);
        let cmd = launcher::command(&argv, self.job.uid, self.job.gid)?;
        let captured = run_captured(cmd, "sbatch").await?;

        if !captured.stderr.is_empty() {
            // Some sites print informational text on stderr; relay it but
            // only fail on a non-zero exit.
            warn!(stderr = %captured.stderr.trim(), "sbatch wrote to stderr");
            for line in captured.stderr.lines() {
                self.job.print(line);
            }
        }
        if !captured.success {
            return Err(HpcError::Submission {
                command: format!("sbatch {}", self.args.join(" ")),
                status: captured.code,
                stderr: captured.stderr.trim().to_string(),
            });
        }

        let job_id = output::parse_slurm_job_id(&captured.stdout)?;
        self.handle.assign(job_id);
        self.job.print(&format!("Waiting for job {job_id} to complete."));
        Ok(job_id)
    }

    /// Poll squeue until the job id no longer appears in the listing.
    async fn monitor(&self, job_id: u64) -> HpcResult<()> {
        loop {
            let argv = vec![
                "squeue".to_string(),
                "--job".to_string(),
                job_id.to_string(),
            ];
            let cmd = launcher::command(&argv, self.job.uid, self.job.gid)?;
            let captured =
                run_captured(cmd, "squeue")
                    .await
                    .map_err(|e| HpcError::Monitoring {
                        command: format!("squeue --job {job_id}"),
                        message: e.to_string(),
                    })?;

            // A failed or empty listing both mean the scheduler no longer
            // tracks the job as active.
            if !captured.success || !output::squeue_lists_job(&captured.stdout, job_id) {
                return Ok(());
            }
            tokio::time::sleep(STATUS_POLL).await;
        }
    }

    /// Retrieve the terminal state and exit code from accounting.
    async fn account(&self, job_id: u64) -> HpcResult<AccountingRecord> {
        let argv = vec![
            "sacct".to_string(),
            "-p".to_string(),
            "-j".to_string(),
            job_id.to_string(),
            "--format=state,exitcode".to_string(),
        ];
        let cmd = launcher::command(&argv, self.job.uid, self.job.gid)?;
        let captured = run_captured(cmd, "sacct")
            .await
            .map_err(|e| HpcError::Monitoring {
                command: format!("sacct -p -j {job_id}"),
                message: e.to_string(),
            })?;
        if !captured.success {
            return Err(HpcError::Monitoring {
                command: format!("sacct -p -j {job_id}"),
                message: captured.stderr.trim().to_string(),
            });
        }
        output::parse_sacct(&captured.stdout)
    }

    async fn drive(&self, token: &CancellationToken) -> HpcResult<AccountingRecord> {
        let job_id = self.submit().await?;

        // The output file exists and is owned by the target identity, so the
        // tailer can start before sbatch's job begins writing into it.
        let tail = tokio::spawn(tailer::tail_file(
            self.out_path.clone(),
            self.job.print_callback.clone(),
            token.clone(),
        ));

        let monitored = self.monitor(job_id).await;
        token.cancel();
        let _ = tail.await;
        monitored?;

        self.account(job_id).await
    }

    async fn collect_output(&self) -> HpcResult<String> {
        fs::read_to_string(&self.out_path)
            .await
            .map_err(|e| HpcError::OutputRetrieval {
                path: self.out_path.clone(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl JobLifecycle for SlurmJob {
    async fn run(&mut self) -> HpcResult<String> {
        if self.submitted {
            return Err(HpcError::AlreadySubmitted);
        }
        self.submitted = true;

        let token = CancellationToken::new();
        let outcome = self.drive(&token).await;
        token.cancel();

        let output = match &outcome {
            Ok(_) => self.collect_output().await,
            Err(_) => Ok(String::new()),
        };
        remove_artifacts(&self.job, &[&self.out_path]).await;

        let record = outcome?;
        if record.exit_code != 0 {
            return Err(HpcError::JobFailed {
                job_id: self.handle.job_id().unwrap_or_default(),
                state: record.state,
                exit_code: record.exit_code,
            });
        }
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
    async fn test_prepare_assembles_bank_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = current_identity();
        let job = Arc::new(
            Job::new("echo hi", dir.path(), uid, gid)
                .with_bank("acct")
                .with_native_specs(["-o", "/tmp/steal.log", "--partition", "debug"]),
        );

        let slurm = SlurmJob::prepare(job).await.unwrap();
        let args = slurm.submit_args();

        assert_eq!(args[0], "-A");
        assert_eq!(args[1], "acct");
        assert_eq!(args[2], "-o");
        assert!(args[3].contains("slurm_out-"));
        assert!(!args.contains(&"/tmp/steal.log".to_string()));
        assert!(args.contains(&"--partition".to_string()));
    }

    #[tokio::test]
    async fn test_prepare_without_bank() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = current_identity();
        let job = Arc::new(Job::new("echo hi", dir.path(), uid, gid));

        let slurm = SlurmJob::prepare(job).await.unwrap();
        assert_eq!(slurm.submit_args()[0], "-o");
    }

    #[tokio::test]
    async fn test_output_file_owned_by_target() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = current_identity();
        let job = Arc::new(Job::new("echo hi", dir.path(), uid, gid));

        let slurm = SlurmJob::prepare(job).await.unwrap();

        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(&slurm.out_path).unwrap();
        assert_eq!(meta.uid(), uid);
        assert_eq!(meta.gid(), gid);
    }
}
