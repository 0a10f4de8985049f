//! Secure process launcher.
//!
//! Builds subprocess descriptors that run as a target uid/gid with a
//! sanitized environment, so the submitted payload never inherits the
//! invoking process's full environment across the uid boundary.

use std::path::Path;

use nix::unistd::{Uid, User};
use tokio::process::Command;
use tracing::warn;

use crate::error::{HpcError, HpcResult};

/// Environment variable prefixes forwarded verbatim to launched commands.
/// Scheduler runtimes depend on these to locate their own installations.
const PASSTHROUGH_PREFIXES: &[&str] = &["LSF_", "LSB_", "SLURM_", "COBALT_"];

/// Build a command from an argument vector that will execute as the target
/// uid/gid with a sanitized environment.
///
/// Only `PATH`, the scheduler passthrough variables, and
/// `LOGNAME`/`USER`/`HOME` rewritten for the resolved target identity are
/// forwarded. Identity lookup failure degrades to omitting the rewritten
/// variables; it never aborts the launch.
pub fn command(argv: &[String], uid: u32, gid: u32) -> HpcResult<Command> {
    let (program, args) = argv.split_first().ok_or_else(|| HpcError::Launch {
        command: String::new(),
        message: "empty argument vector".to_string(),
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.uid(uid);
    cmd.gid(gid);

    cmd.env_clear();
    cmd.envs(sanitized_env_from(std::env::vars(), resolve_identity(uid)));

    Ok(cmd)
}

/// Resolved identity details for a uid: username and home directory.
fn resolve_identity(uid: u32) -> Option<(String, std::path::PathBuf)> {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => Some((user.name, user.dir)),
        Ok(None) => {
            warn!(uid, "no passwd entry for uid, launching without LOGNAME/USER/HOME");
            None
        }
        Err(e) => {
            warn!(uid, error = %e, "identity lookup failed, launching without LOGNAME/USER/HOME");
            None
        }
    }
}

/// Pure core of the environment sanitizer, split out for testing.
fn sanitized_env_from(
    vars: impl IntoIterator<Item = (String, String)>,
    identity: Option<(String, std::path::PathBuf)>,
) -> Vec<(String, String)> {
    let mut env = Vec::new();

    for (key, value) in vars {
        if key == "PATH" || PASSTHROUGH_PREFIXES.iter().any(|p| key.starts_with(p)) {
            env.push((key, value));
        }
    }

    if let Some((name, home)) = identity {
        env.push(("LOGNAME".to_string(), name.clone()));
        env.push(("USER".to_string(), name));
        env.push(("HOME".to_string(), home.display().to_string()));
    }

    env
}

/// Convenience for assembling an argv from a command name, its arguments and
/// a trailing script path.
pub fn argv(program: &str, args: &[String], script: &Path) -> Vec<String> {
    let mut v = Vec::with_capacity(args.len() + 2);
    v.push(program.to_string());
    v.extend(args.iter().cloned());
    v.push(script.display().to_string());
    v
}
