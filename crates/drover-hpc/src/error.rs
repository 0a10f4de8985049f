//! Error handling for the batch-job engine.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for batch-job operations.
pub type HpcResult<T> = Result<T, HpcError>;

/// Errors that can occur while preparing, submitting, monitoring or killing
/// a batch job.
///
/// An `Err` from any lifecycle operation means the accompanying output text
/// must not be trusted as complete.
#[derive(Error, Debug)]
pub enum HpcError {
    /// Script file could not be created, written, made executable or chowned.
    #[error("script preparation failed for {path}: {message}")]
    ScriptPreparation { path: PathBuf, message: String },

    /// No batch system binaries were found on PATH.
    #[error("no batch system found")]
    NoBatchSystem,

    /// Cobalt's submission tool resolved but its status tool did not, so the
    /// scheduler could be submitted to but never monitored.
    #[error("cobalt detected but unusable: found qsub but no qstat")]
    CobaltUnusable,

    /// The submission or status process could not be started at all.
    #[error("failed to launch '{command}': {message}")]
    Launch { command: String, message: String },

    /// The submission command ran but exited non-zero.
    #[error("submission command '{command}' failed with {status}: {stderr}")]
    Submission {
        command: String,
        status: i32,
        stderr: String,
    },

    /// The submission command succeeded but its acknowledgement text did not
    /// contain a parseable job identifier.
    #[error("could not parse a job id from '{command}' output: {output:?}")]
    Acknowledgement { command: String, output: String },

    /// A status or accounting command failed to execute or produced
    /// unusable output.
    #[error("monitoring command '{command}' failed: {message}")]
    Monitoring { command: String, message: String },

    /// The scheduler reported a non-zero terminal exit code for the job.
    #[error("job {job_id} finished in state {state} with exit code {exit_code}")]
    JobFailed {
        job_id: u64,
        state: String,
        exit_code: i32,
    },

    /// An expected output file was missing or unreadable, or its expected
    /// banner markers were not found.
    #[error("could not retrieve job output from {path}: {message}")]
    OutputRetrieval { path: PathBuf, message: String },

    /// The cancellation command failed; the underlying cause is always
    /// carried, never dropped.
    #[error("cancellation command '{command}' failed: {message}")]
    Cancellation { command: String, message: String },

    /// A second submission was attempted on the same backend job instance.
    #[error("job has already been submitted")]
    AlreadySubmitted,

    /// Kill was requested before the scheduler acknowledged the submission.
    #[error("no job identifier has been assigned yet")]
    NoJobId,

    /// IO error outside the script-preparation path.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HpcError::NoBatchSystem;
        assert_eq!(err.to_string(), "no batch system found");

        let err = HpcError::Acknowledgement {
            command: "sbatch".to_string(),
            output: "garbage".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "could not parse a job id from 'sbatch' output: \"garbage\""
        );

        let err = HpcError::JobFailed {
            job_id: 4821,
            state: "FAILED".to_string(),
            exit_code: 2,
        };
        assert_eq!(
            err.to_string(),
            "job 4821 finished in state FAILED with exit code 2"
        );
    }
}
