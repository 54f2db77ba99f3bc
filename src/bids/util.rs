use anyhow::Result;
use std::io::Read;
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Return the current Unix epoch in seconds.
pub fn now_epoch_secs() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

#[derive(Debug)]
pub enum CommandRunError {
    Io(std::io::Error),
    TimedOut(Duration),
}

impl From<std::io::Error> for CommandRunError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Run `cmd` to completion, killing it once `timeout` elapses. Output is
/// always captured.
pub fn run_command_with_optional_timeout(
    cmd: &mut Command,
    timeout: Option<Duration>,
) -> Result<Output, CommandRunError> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let Some(timeout) = timeout else {
        return Ok(cmd.output()?);
    };
    // Own process group, so a timeout also takes down anything the
    // converter forked.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let mut child = cmd.spawn()?;
    // Pipes are drained concurrently so a chatty child cannot stall on a
    // full pipe buffer while we poll.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);
    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            kill_tree(&mut child);
            let _ = child.wait();
            // The group is gone, so both pipes are closed and the drains end.
            collect(stdout);
            collect(stderr);
            return Err(CommandRunError::TimedOut(timeout));
        }
        thread::sleep(Duration::from_millis(50));
    };
    Ok(Output {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pid = child.id();
    if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::debug!("killpg {pid} failed: {err}");
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// ASCII alphanumerics only; the subset usable as a dataset label.
pub fn is_label(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric())
}
