//! Local (no-batch) adapter.
//!
//! Runs the materialized script in the foreground as the target identity,
//! streaming both pipes to the caller while capturing them. No scheduler,
//! no temporary files, no monitoring phase.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{HpcError, HpcResult};
use crate::job::Job;
use crate::launcher;
use crate::script;

use super::{run_streamed, JobHandle, JobLifecycle};

/// A job prepared for direct local execution.
pub struct LocalJob {
    job: Arc<Job>,
    script: PathBuf,
    handle: JobHandle,
    submitted: bool,
}

impl LocalJob {
    /// Materialize the script and prepare the run.
    pub(crate) async fn prepare(job: Arc<Job>) -> HpcResult<Self> {
        let script = script::materialize(&job).await?;
        let handle = JobHandle::new(None, job.uid, job.gid);
        Ok(Self {
            job,
            script,
            handle,
            submitted: false,
        })
    }

    /// Path of the materialized script.
    pub fn script_path(&self) -> &PathBuf {
        &self.script
    }
}

#[async_trait]
impl JobLifecycle for LocalJob {
    async fn run(&mut self) -> HpcResult<String> {
        if self.submitted {
            return Err(HpcError::AlreadySubmitted);
        }
        self.submitted = true;

        let argv = vec![
            "/bin/bash".to_string(),
            self.script.display().to_string(),
        ];
        let cmd = launcher::command(&argv, self.job.uid, self.job.gid)?;

        let token = CancellationToken::new();
        let captured = run_streamed(cmd, "/bin/bash", &self.job, &token).await;
        token.cancel();
        let captured = captured?;

        if !captured.success {
            return Err(HpcError::JobFailed {
                job_id: 0,
                state: "EXITED".to_string(),
                exit_code: captured.code,
            });
        }

        let mut output = captured.stdout;
        output.push_str(&captured.stderr);
        Ok(output)
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
    use std::sync::Mutex;

    fn local_job(payload: &str, dir: &std::path::Path) -> Arc<Job> {
        Arc::new(
            Job::new(
                payload,
                dir,
                nix::unistd::getuid().as_raw(),
                nix::unistd::getgid().as_raw(),
            )
            .local()
            .without_login_shell(),
        )
    }

    #[tokio::test]
    async fn test_run_echo() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = LocalJob::prepare(local_job("echo hello", dir.path()))
            .await
            .unwrap();

        let output = job.run().await.unwrap();
        assert_eq!(output, "hello\n");
    }

    #[tokio::test]
    async fn test_output_streams_through_callback() {
        let dir = tempfile::tempdir().unwrap();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let job = Arc::new(
            Job::new(
                "echo one\necho two",
                dir.path(),
                nix::unistd::getuid().as_raw(),
                nix::unistd::getgid().as_raw(),
            )
            .local()
            .without_login_shell()
            .with_print_callback(Arc::new(move |line| {
                sink.lock().unwrap().push(line.to_string());
            })),
        );

        let mut backend = LocalJob::prepare(job).await.unwrap();
        backend.run().await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&"one".to_string()));
        assert!(seen.contains(&"two".to_string()));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_job_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = LocalJob::prepare(local_job("exit 3", dir.path()))
            .await
            .unwrap();

        match job.run().await {
            Err(HpcError::JobFailed { exit_code, .. }) => assert_eq!(exit_code, 3),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = LocalJob::prepare(local_job("echo hi", dir.path()))
            .await
            .unwrap();

        job.run().await.unwrap();
        assert!(matches!(
            job.run().await,
            Err(HpcError::AlreadySubmitted)
        ));
    }

    #[tokio::test]
    async fn test_kill_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let job = LocalJob::prepare(local_job("echo hi", dir.path()))
            .await
            .unwrap();

        assert!(matches!(
            job.kill().await,
            Err(HpcError::Cancellation { .. })
        ));
    }
}
