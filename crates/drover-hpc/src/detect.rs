//! Batch-system detection.
//!
//! Decides which backend adapter to instantiate by inspecting PATH and the
//! environment. Detection is deterministic: repeated calls with an unchanged
//! PATH/environment select the same backend.

use std::path::PathBuf;

use tracing::warn;

use crate::error::{HpcError, HpcResult};

/// The batch systems an installation can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSystem {
    /// Slurm (sbatch/squeue/sacct/scancel).
    Slurm,
    /// IBM Spectrum LSF (bsub/bkill).
    Lsf,
    /// Cobalt (qsub/qstat/qdel).
    Cobalt,
}

impl BatchSystem {
    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            BatchSystem::Slurm => "Slurm",
            BatchSystem::Lsf => "LSF",
            BatchSystem::Cobalt => "Cobalt",
        }
    }
}

impl std::fmt::Display for BatchSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Detect the installed batch system.
///
/// Priority order: Slurm (`sbatch` on PATH), LSF (`bsub` on PATH or
/// `LSF_BINDIR` set), Cobalt (`qsub` and `qstat` both on PATH). Finding
/// Cobalt's submission tool without its status tool is an error of its own:
/// a scheduler must never be selected without the means to monitor it.
pub fn detect() -> HpcResult<BatchSystem> {
    detect_from(&|cmd| which(cmd).is_some(), std::env::var_os("LSF_BINDIR").is_some())
}

/// Pure detection core, parameterized over binary resolution for testing.
fn detect_from(resolves: &dyn Fn(&str) -> bool, lsf_env: bool) -> HpcResult<BatchSystem> {
    if resolves("sbatch") {
        return Ok(BatchSystem::Slurm);
    }
    if resolves("bsub") || lsf_env {
        return Ok(BatchSystem::Lsf);
    }
    if resolves("qsub") {
        if resolves("qstat") {
            return Ok(BatchSystem::Cobalt);
        }
        warn!("cobalt detected but can't monitor (found qsub but no qstat)");
        return Err(HpcError::CobaltUnusable);
    }
    Err(HpcError::NoBatchSystem)
}

/// Resolve a command name against PATH, like `command -v`.
fn which(cmd: &str) -> Option<PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let full_path = dir.join(cmd);
            if full_path.is_file() {
                Some(full_path)
            } else {
                None
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slurm_wins_priority() {
        let resolves = |cmd: &str| matches!(cmd, "sbatch" | "bsub" | "qsub" | "qstat");
        assert_eq!(detect_from(&resolves, true).unwrap(), BatchSystem::Slurm);
    }

    #[test]
    fn test_lsf_via_binary_or_env() {
        let resolves = |cmd: &str| cmd == "bsub";
        assert_eq!(detect_from(&resolves, false).unwrap(), BatchSystem::Lsf);

        let resolves = |_: &str| false;
        assert_eq!(detect_from(&resolves, true).unwrap(), BatchSystem::Lsf);
    }

    #[test]
    fn test_cobalt_requires_both_tools() {
        let resolves = |cmd: &str| matches!(cmd, "qsub" | "qstat");
        assert_eq!(detect_from(&resolves, false).unwrap(), BatchSystem::Cobalt);
    }

    #[test]
    fn test_cobalt_without_qstat_is_unusable() {
        let resolves = |cmd: &str| cmd == "qsub";
        assert!(matches!(
            detect_from(&resolves, false),
            Err(HpcError::CobaltUnusable)
        ));
    }

    #[test]
    fn test_nothing_found() {
        let resolves = |_: &str| false;
        assert!(matches!(
            detect_from(&resolves, false),
            Err(HpcError::NoBatchSystem)
        ));
    }

    #[test]
    fn test_detection_is_idempotent() {
        let resolves = |cmd: &str| cmd == "sbatch";
        let first = detect_from(&resolves, false).unwrap();
        let second = detect_from(&resolves, false).unwrap();
        assert_eq!(first, second);
    }
}
