//! Drover: batch-job lifecycle engine for HPC clusters.
//!
//! Drover runs an arbitrary shell payload either locally or through
//! whichever batch scheduler is installed, behind one uniform lifecycle.
//! Callers never deal with the schedulers' incompatible command-line
//! protocols: detection picks the backend, an adapter drives submission,
//! monitoring and output retrieval, and the payload always executes as a
//! caller-chosen, less-privileged identity with a sanitized environment.
//!
//! # Supported backends
//!
//! | Backend | Submit | Status | Cancel | Accounting |
//! |---------|--------|--------|--------|------------|
//! | Local | /bin/bash | (none) | (none) | (none) |
//! | LSF | bsub | rendered report file | bkill | (none) |
//! | Slurm | sbatch | squeue | scancel | sacct |
//! | Cobalt | qsub | qstat | qdel | (none) |
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use drover_hpc::{BackendJob, Job};
//!
//! #[tokio::main]
//! async fn main() -> drover_hpc::HpcResult<()> {
//!     let job = Arc::new(
//!         Job::new("echo hello", "/var/drover", 4242, 4242)
//!             .with_bank("project42")
//!             .with_print_callback(Arc::new(|line| println!("{line}"))),
//!     );
//!
//!     let mut backend = BackendJob::prepare(job).await?;
//!     let handle = backend.handle();   // retain for out-of-band kill
//!     let output = backend.run().await?;
//!     println!("job {:?} finished:\n{output}", handle.job_id());
//!     Ok(())
//! }
//! ```
//!
//! Every lifecycle operation returns an explicit `Result`; an error means
//! the accompanying output must not be trusted as complete.

pub mod backend;
pub mod detect;
pub mod error;
pub mod job;
pub mod launcher;
pub mod output;
pub mod script;
pub mod tailer;

// Re-exports
pub use backend::{
    strip_reserved, BackendJob, CobaltJob, JobHandle, JobLifecycle, JobReport, LocalJob, LsfJob,
    SlurmJob,
};
pub use detect::{detect, BatchSystem};
pub use error::{HpcError, HpcResult};
pub use job::{Job, PrintCallback};
pub use output::AccountingRecord;
