//! Subprocess invocation and name validation shared by every backend.

use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Result, TargetdError};

/// Basic name regex: alphanumeric, `_` and `-`. Individual backends
/// (ZFS) extend this with `.`.
const NAME_REGEX: &str = "^[A-Za-z0-9_-]+$";
const ZFS_NAME_REGEX: &str = "^[A-Za-z0-9][A-Za-z0-9_.-]*$";

/// Validate a user-supplied volume/access-group/pool name.
pub fn name_check(name: &str) -> Result<()> {
    check_against(name, NAME_REGEX)
}

/// Validate a ZFS dataset/pool component name (additionally allows `.`).
pub fn zfs_name_check(name: &str) -> Result<()> {
    check_against(name, ZFS_NAME_REGEX)
}

fn check_against(name: &str, pattern: &str) -> Result<()> {
    let re = Regex::new(pattern).expect("static regex is valid");
    if re.is_match(name) {
        Ok(())
    } else {
        Err(TargetdError::InvalidArgument(format!(
            "name '{name}' does not match {pattern}"
        )))
    }
}

/// Output of a completed external command.
pub struct Invocation {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run `argv[0] argv[1..]`, capturing both streams. On nonzero exit,
/// fails with `UnexpectedExitCode` carrying both streams.
pub async fn invoke(argv: &[&str]) -> Result<Invocation> {
    invoke_raw(argv).await.and_then(|inv| {
        if inv.code == 0 {
            Ok(inv)
        } else {
            Err(TargetdError::UnexpectedExitCode {
                cmd: argv.iter().map(|s| s.to_string()).collect(),
                code: inv.code,
                output: format!("{}{}", inv.stdout, inv.stderr),
            })
        }
    })
}

/// Run `argv`, returning the raw result regardless of exit code. Used
/// by callers that need to inspect stderr themselves (e.g. ZFS's
/// "volume has dependent clones" detection).
pub async fn invoke_raw(argv: &[&str]) -> Result<Invocation> {
    debug!(cmd = ?argv, "invoking external command");
    let (program, args) = argv.split_first().expect("argv must be non-empty");
    let output = Command::new(program).args(args).output().await?;
    Ok(Invocation {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run `argv`, retrying up to `attempts` times with `backoff` between
/// tries when the process exits with `retry_code`. Used by the btrfs
/// backend, which occasionally sees a transient exit 19 from
/// `btrfs subvolume list`.
pub async fn invoke_retrying(
    argv: &[&str],
    retry_code: i32,
    attempts: u32,
    backoff: Duration,
) -> Result<Invocation> {
    let mut last_err = None;
    for attempt in 1..=attempts {
        match invoke_raw(argv).await? {
            inv if inv.code == 0 => return Ok(inv),
            inv if inv.code == retry_code && attempt < attempts => {
                warn!(
                    cmd = ?argv,
                    attempt,
                    "transient exit {retry_code}, retrying after {backoff:?}"
                );
                last_err = Some(inv);
                sleep(backoff).await;
            }
            inv => {
                return Err(TargetdError::UnexpectedExitCode {
                    cmd: argv.iter().map(|s| s.to_string()).collect(),
                    code: inv.code,
                    output: format!("{}{}", inv.stdout, inv.stderr),
                });
            }
        }
    }
    let inv = last_err.expect("loop always sets last_err before exhausting attempts");
    Err(TargetdError::UnexpectedExitCode {
        cmd: argv.iter().map(|s| s.to_string()).collect(),
        code: inv.code,
        output: format!("{}{}", inv.stdout, inv.stderr),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(name_check("vg-targetd").is_ok());
        assert!(name_check("vol_1").is_ok());
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(name_check("../etc").is_err());
        assert!(name_check("a/b").is_err());
    }

    #[test]
    fn zfs_names_allow_dots() {
        assert!(zfs_name_check("tank.data").is_ok());
        assert!(name_check("tank.data").is_err());
    }

    #[tokio::test]
    async fn invoke_captures_exit_code_and_streams() {
        let result = invoke(&["false"]).await;
        assert!(result.is_err());
        let result = invoke(&["true"]).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn invoke_retrying_gives_up_after_exhausting_attempts() {
        let result = invoke_retrying(&["false"], 1, 2, Duration::from_millis(1)).await;
        assert!(result.is_err());
    }
}
