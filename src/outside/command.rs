use std::{
    ffi::OsStr,
    process::{Output, Stdio},
    time::Duration,
};

use bitflags::bitflags;
use tokio::process::{Child, Command};
use tracing::{debug, trace};

use crate::result::{Error, Result};

pub const YT_DL: &str = "youtube-dl";
pub const YT_DLP: &str = "yt-dlp";
pub const FFMPEG: &str = "ffmpeg";
pub const FFXXX_DEFAULT_ARGS: [&str; 1] = ["-hide_banner"];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capture: u8 {
        const STDIN = 0b0000001;
        const STDOUT = 0b0000010;
        const STDERR = 0b0000100;
    }
}

/// Build a command whose IO handles are piped only where the caller asked for it.
///
/// The child is killed with SIGKILL if its handle is dropped, so a job that
/// goes away never leaves a tool running behind it.
pub fn build_command<P, F>(program: P, f: F, capture: Capture) -> Command
where
    P: AsRef<OsStr>,
    F: FnOnce(&mut Command) -> &mut Command,
{
    let get_io = |capture| {
        if capture {
            Stdio::piped()
        } else {
            Stdio::null()
        }
    };

    let mut cmd = Command::new(program);
    f(&mut cmd)
        .stdin(get_io(capture.contains(Capture::STDIN)))
        .stdout(get_io(capture.contains(Capture::STDOUT)))
        .stderr(get_io(capture.contains(Capture::STDERR)))
        .kill_on_drop(true);
    cmd
}

/// Spawn a command, turning a launch failure into [`Error::SpawnFailed`].
pub fn spawn_command(mut cmd: Command) -> Result<Child> {
    debug!("Spawning command: {cmd:?}");
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.spawn().map_err(|err| Error::SpawnFailed {
        program,
        reason: err.to_string(),
    })
}

/// Run a command to completion within a time budget, returning its raw output.
///
/// The function returns an error only if the command failed to execute or ran
/// out of time. If the program runs but returns a non-0 status code, it will
/// not trigger an error.
pub async fn run_command<P, F>(
    program: P,
    f: F,
    capture: Capture,
    phase: &'static str,
    budget: Duration,
) -> Result<Output>
where
    P: AsRef<OsStr>,
    F: FnOnce(&mut Command) -> &mut Command,
{
    let child = spawn_command(build_command(program, f, capture))?;

    // Dropping the pending future drops the child, which kills it
    let res = tokio::time::timeout(budget, child.wait_with_output())
        .await
        .map_err(|_| Error::Timeout {
            phase,
            after: budget,
        })??;

    debug!("status: {}", res.status);
    debug!("stdout: {} bytes long", res.stdout.len());
    trace!("stdout: {:?}", String::from_utf8_lossy(&res.stdout));
    debug!("stderr: {} bytes long", res.stderr.len());
    trace!("stderr: {:?}", String::from_utf8_lossy(&res.stderr));

    Ok(res)
}

/// Run the command and verify that it has returned a success status code.
pub async fn assert_success_command<P, F>(program: P, f: F) -> Result<()>
where
    P: AsRef<OsStr>,
    F: FnOnce(&mut Command) -> &mut Command,
{
    const PROBE_BUDGET: Duration = Duration::from_secs(15);

    let res = run_command(program, f, Capture::empty(), "probe", PROBE_BUDGET).await?;
    if res.status.success() {
        Ok(())
    } else {
        crate::result::bail("Command did run but was not successful")
    }
}

/// Kill a child right away and reap it. Errors are ignored: the process may
/// already be gone.
pub async fn hard_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        debug!("Killing process {pid}");
    }
    let _ = child.kill().await;
}
