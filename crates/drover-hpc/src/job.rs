//! Job types for the batch-job engine.

use std::path::PathBuf;
use std::sync::Arc;

/// Callback used to stream output lines back to the caller while a job runs.
pub type PrintCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// An immutable submission request.
///
/// A `Job` is created once by the caller and is read-only for its lifetime;
/// backend adapters share it by reference and never mutate it.
#[derive(Clone)]
pub struct Job {
    /// Raw shell payload to execute.
    pub script_contents: String,

    /// Scheduler-native extra arguments, passed through to the submission
    /// command after reserved-flag filtering.
    pub native_specs: Vec<String>,

    /// Accounting/bank identifier, if the site requires one.
    pub bank: Option<String>,

    /// Target user id the payload runs as.
    pub uid: u32,

    /// Target group id the payload runs as.
    pub gid: u32,

    /// Directory for script and output artifacts.
    pub work_dir: PathBuf,

    /// Submit through a batch scheduler (true) or run locally (false).
    pub batch_execution: bool,

    /// Source the login profile at the top of the materialized script so the
    /// payload inherits the target user's normal shell environment.
    pub login_shell: bool,

    /// Keep temporary output/error/debug files after the run, for debugging.
    pub keep_artifacts: bool,

    /// Line sink for interactive output.
    pub print_callback: PrintCallback,
}

impl Job {
    /// Create a new batch job with the given payload and artifact directory,
    /// running as the given identity.
    pub fn new(
        script_contents: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        uid: u32,
        gid: u32,
    ) -> Self {
        Self {
            script_contents: script_contents.into(),
            native_specs: Vec::new(),
            bank: None,
            uid,
            gid,
            work_dir: work_dir.into(),
            batch_execution: true,
            login_shell: true,
            keep_artifacts: false,
            print_callback: Arc::new(|_| {}),
        }
    }

    /// Pass scheduler-native arguments through to the submission command.
    pub fn with_native_specs(mut self, specs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.native_specs = specs.into_iter().map(Into::into).collect();
        self
    }

    /// Set the accounting/bank identifier.
    pub fn with_bank(mut self, bank: impl Into<String>) -> Self {
        self.bank = Some(bank.into());
        self
    }

    /// Run the payload locally instead of submitting it to a scheduler.
    pub fn local(mut self) -> Self {
        self.batch_execution = false;
        self
    }

    /// Skip the login-profile preamble in the materialized script.
    pub fn without_login_shell(mut self) -> Self {
        self.login_shell = false;
        self
    }

    /// Retain temporary output files after the run.
    pub fn keep_artifacts(mut self) -> Self {
        self.keep_artifacts = true;
        self
    }

    /// Set the callback that receives output lines as they appear.
    pub fn with_print_callback(mut self, callback: PrintCallback) -> Self {
        self.print_callback = callback;
        self
    }

    /// Send one line to the caller's output sink.
    pub fn print(&self, line: &str) {
        (self.print_callback)(line);
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("script_contents", &self.script_contents)
            .field("native_specs", &self.native_specs)
            .field("bank", &self.bank)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("work_dir", &self.work_dir)
            .field("batch_execution", &self.batch_execution)
            .field("login_shell", &self.login_shell)
            .field("keep_artifacts", &self.keep_artifacts)
            .finish_non_exhaustive()
    }
}
