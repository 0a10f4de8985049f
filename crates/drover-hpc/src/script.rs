//! Script materialization.
//!
//! Writes the caller's shell payload to a uniquely named, owned, executable
//! file under `<work_dir>/scripts/`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::{Gid, Uid};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{HpcError, HpcResult};
use crate::job::Job;

/// Delay after taking the millisecond timestamp, so two back-to-back
/// materializations can never collide on a name.
const SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Materialize the job's payload as an executable script and return its
/// absolute path.
///
/// The file is named `batch_script<millis>.bash`, prefixed with a shebang,
/// an optional login-profile preamble and strict shell options, then the
/// payload verbatim. Order is create, write, chmod 0750, chown to the target
/// identity, keeping the window where a wrongly-owned executable exists as
/// small as possible.
pub async fn materialize(job: &Job) -> HpcResult<PathBuf> {
    let scripts_dir = job.work_dir.join("scripts");

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o740);
    builder
        .create(&scripts_dir)
        .await
        .map_err(|e| prep_err(&scripts_dir, e))?;
    chown(&scripts_dir, job.uid, job.gid)?;

    let unique = chrono::Utc::now().timestamp_millis();
    tokio::time::sleep(SETTLE_DELAY).await;

    let path = scripts_dir.join(format!("batch_script{unique}.bash"));

    let mut file = fs::File::create(&path)
        .await
        .map_err(|e| prep_err(&path, e))?;
    file.write_all(render(job).as_bytes())
        .await
        .map_err(|e| prep_err(&path, e))?;
    file.flush().await.map_err(|e| prep_err(&path, e))?;
    drop(file);

    fs::set_permissions(&path, std::fs::Permissions::from_mode(0o750))
        .await
        .map_err(|e| prep_err(&path, e))?;
    chown(&path, job.uid, job.gid)?;

    Ok(path)
}

/// Render the full script text: shebang, preamble, payload.
fn render(job: &Job) -> String {
    let mut text = String::from("#!/bin/bash\n");
    if job.login_shell {
        text.push_str("[ -f /etc/profile ] && . /etc/profile\n");
    }
    text.push_str("set -eo pipefail\n");
    text.push_str("set +o noclobber\n");
    text.push_str(&job.script_contents);
    if !job.script_contents.ends_with('\n') {
        text.push('\n');
    }
    text
}

fn chown(path: &Path, uid: u32, gid: u32) -> HpcResult<()> {
    nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|e| {
        HpcError::ScriptPreparation {
            path: path.to_path_buf(),
            message: format!("chown to {uid}:{gid} failed: {e}"),
        }
    })
}

fn prep_err(path: &Path, e: std::io::Error) -> HpcError {
    HpcError::ScriptPreparation {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}
