// ABOUTME: Background process management for the sync daemon
// ABOUTME: PID and log files under ~/.project-sync/, detach via daemonize, stop via SIGTERM

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const DAEMON_DIR: &str = ".project-sync";

/// Directory holding the daemon's PID and log files, created on demand.
pub fn get_daemon_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to determine home directory")?;
    let daemon_dir = home.join(DAEMON_DIR);

    if !daemon_dir.exists() {
        fs::create_dir_all(&daemon_dir)
            .with_context(|| format!("Failed to create daemon directory: {:?}", daemon_dir))?;
    }

    Ok(daemon_dir)
}

pub fn get_pid_file_path() -> Result<PathBuf> {
    Ok(get_daemon_dir()?.join("daemon.pid"))
}

pub fn get_log_file_path() -> Result<PathBuf> {
    Ok(get_daemon_dir()?.join("daemon.log"))
}

/// Check if a process with the given PID is running.
#[cfg(unix)]
pub fn is_process_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks that the process exists
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: i32) -> bool {
    false
}

/// Read the PID from the PID file.
pub fn read_pid() -> Result<Option<i32>> {
    let pid_file = get_pid_file_path()?;

    if !pid_file.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&pid_file)
        .with_context(|| format!("Failed to read PID file: {:?}", pid_file))?;

    let pid: i32 = content
        .trim()
        .parse()
        .with_context(|| format!("Invalid PID in file: {}", content.trim()))?;

    Ok(Some(pid))
}

pub fn remove_pid_file() -> Result<()> {
    let pid_file = get_pid_file_path()?;

    if pid_file.exists() {
        fs::remove_file(&pid_file)
            .with_context(|| format!("Failed to remove PID file: {:?}", pid_file))?;
    }

    Ok(())
}

/// Liveness of the background daemon according to its PID file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<i32>,
    pub pid_file_exists: bool,
}

pub fn check_status() -> Result<DaemonStatus> {
    let pid_file = get_pid_file_path()?;
    let pid_file_exists = pid_file.exists();

    let pid = read_pid()?;
    let running = pid.map_or(false, is_process_running);

    Ok(DaemonStatus {
        running,
        pid,
        pid_file_exists,
    })
}

/// Stop the running daemon. Returns false when none was running.
#[cfg(unix)]
pub fn stop_daemon() -> Result<bool> {
    let status = check_status()?;

    let pid = match status.pid {
        Some(pid) if status.running => pid,
        _ => {
            if status.pid_file_exists {
                remove_pid_file()?;
                tracing::info!("Removed stale PID file (process was not running)");
            }
            return Ok(false);
        }
    };

    tracing::info!("Sending SIGTERM to daemon (PID: {})", pid);
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!(
            "Failed to send SIGTERM to process {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }

    // The daemon finishes its current batch before exiting.
    let start = Instant::now();
    let timeout = Duration::from_secs(30);
    while is_process_running(pid) {
        if start.elapsed() > timeout {
            tracing::warn!("Daemon did not exit within {:?}, sending SIGKILL", timeout);
            unsafe { libc::kill(pid, libc::SIGKILL) };
            std::thread::sleep(Duration::from_millis(500));
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    remove_pid_file()?;
    Ok(true)
}

#[cfg(not(unix))]
pub fn stop_daemon() -> Result<bool> {
    bail!("Stopping a background daemon is only supported on Unix")
}

/// Fork into the background, writing the PID file and redirecting output
/// to the log file. Must run before the tokio runtime starts.
#[cfg(unix)]
pub fn daemonize() -> Result<()> {
    use daemonize::Daemonize;
    use std::fs::OpenOptions;

    let pid_file = get_pid_file_path()?;
    let log_file = get_log_file_path()?;

    let status = check_status()?;
    if let (true, Some(pid)) = (status.running, status.pid) {
        bail!(
            "Daemon is already running (PID: {}). Use --stop to stop it first.",
            pid
        );
    }
    if status.pid_file_exists {
        remove_pid_file()?;
    }

    let open_log = || {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .with_context(|| format!("Failed to open log file: {:?}", log_file))
    };
    let stdout = open_log()?;
    let stderr = open_log()?;

    println!("Starting daemon...");
    println!("PID file: {:?}", pid_file);
    println!("Log file: {:?}", log_file);

    Daemonize::new()
        .pid_file(&pid_file)
        .chown_pid_file(true)
        .working_directory(".")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize process")?;

    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize() -> Result<()> {
    bail!("Running as a background daemon is only supported on Unix; run `daemon` in the foreground")
}

/// Remove the PID file if it belongs to this process.
pub fn cleanup() -> Result<()> {
    match read_pid()? {
        Some(pid) if pid == std::process::id() as i32 => remove_pid_file(),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_live_under_daemon_dir() {
        let pid = get_pid_file_path().unwrap();
        let log = get_log_file_path().unwrap();
        assert!(pid.to_string_lossy().contains(".project-sync"));
        assert!(pid.to_string_lossy().ends_with("daemon.pid"));
        assert!(log.to_string_lossy().ends_with("daemon.log"));
    }

    #[cfg(unix)]
    #[test]
    fn test_own_process_is_running() {
        assert!(is_process_running(std::process::id() as i32));
        assert!(!is_process_running(0));
        assert!(!is_process_running(-1));
    }

    #[test]
    fn test_check_status_does_not_fail() {
        assert!(check_status().is_ok());
    }
}
