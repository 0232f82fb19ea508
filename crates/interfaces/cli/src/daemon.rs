//! Daemon lifecycle: pid file, advisory lock, detach, graceful shutdown.
//!
//! One daemon per calm directory. The fs2 lock on `runtime/daemon.lock`
//! guards against a second server writing the same journal; the pid file is
//! bookkeeping for `stop` and `status`.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use fs2::FileExt;
use tracing::info;

use calm_config::CalmConfig;
use calm_runtime::{run_server, Services};

struct DaemonPaths {
    runtime_dir: PathBuf,
    pid_file: PathBuf,
    log_file: PathBuf,
    lock_file: PathBuf,
}

fn daemon_paths(config: &CalmConfig) -> DaemonPaths {
    let runtime_dir = config.calm_dir.join("runtime");
    DaemonPaths {
        pid_file: runtime_dir.join("daemon.pid"),
        log_file: runtime_dir.join("daemon.log"),
        lock_file: runtime_dir.join("daemon.lock"),
        runtime_dir,
    }
}

/// Run the server in this process until ctrl-c / SIGTERM.
pub async fn run_foreground(config: CalmConfig) -> Result<()> {
    let paths = daemon_paths(&config);
    fs::create_dir_all(&paths.runtime_dir)?;

    // Hold the advisory lock for the whole server lifetime: two daemons on
    // one journal directory is unsupported.
    let lock = File::create(&paths.lock_file)?;
    if lock.try_lock_exclusive().is_err() {
        bail!(
            "another daemon already owns {}; stop it first",
            config.calm_dir.display()
        );
    }

    let services = Arc::new(Services::initialize(config.clone()).await?);
    let socket_path = config.socket_path.clone();

    tokio::select! {
        result = run_server(services, &socket_path) => result?,
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }
    let _ = fs::remove_file(&socket_path);
    let _ = fs2::FileExt::unlock(&lock);
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

/// Detach a child `calm start --foreground` and wait for the socket.
pub fn start(config: &CalmConfig, force: bool) -> Result<()> {
    let paths = daemon_paths(config);
    fs::create_dir_all(&paths.runtime_dir)?;
    let socket_path = PathBuf::from(&config.socket_path);

    if is_socket_live(&socket_path) && !force {
        bail!(
            "daemon already running on socket {}; use `calm stop` first",
            socket_path.display()
        );
    }
    if let Some(pid) = read_pid(&paths.pid_file)? {
        if is_pid_running(pid) {
            if !force {
                bail!("daemon already running with pid {pid}; use `calm start --force`");
            }
            terminate_pid(pid)?;
            wait_for_pid_exit(pid, Duration::from_secs(4));
        }
        let _ = fs::remove_file(&paths.pid_file);
    }
    if socket_path.exists() {
        let _ = fs::remove_file(&socket_path);
    }

    let exe = std::env::current_exe()?;
    let out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)?;
    let err = out.try_clone()?;
    let mut child = Command::new(exe)
        .args(["start", "--foreground"])
        .env("CALM_DIR", &config.calm_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .spawn()?;
    fs::write(&paths.pid_file, child.id().to_string())?;

    for _ in 0..40 {
        if is_socket_live(&socket_path) {
            println!("daemon started");
            println!("- pid: {}", child.id());
            println!("- socket: {}", socket_path.display());
            println!("- log: {}", paths.log_file.display());
            return Ok(());
        }
        if let Some(status) = child.try_wait()? {
            let _ = fs::remove_file(&paths.pid_file);
            bail!(
                "daemon exited during startup with status {status}; check {}",
                paths.log_file.display()
            );
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    let _ = fs::remove_file(&paths.pid_file);
    bail!(
        "daemon did not become ready on socket {}; check {}",
        socket_path.display(),
        paths.log_file.display()
    )
}

pub async fn stop(config: &CalmConfig) -> Result<()> {
    let paths = daemon_paths(config);
    let Some(pid) = read_pid(&paths.pid_file)? else {
        println!("daemon is not running");
        return Ok(());
    };
    if !is_pid_running(pid) {
        let _ = fs::remove_file(&paths.pid_file);
        println!("daemon was not running (stale pid file cleaned)");
        return Ok(());
    }

    terminate_pid(pid)?;
    wait_for_pid_exit(pid, Duration::from_secs(4));
    let _ = fs::remove_file(&paths.pid_file);
    let _ = fs::remove_file(&paths.lock_file);
    println!("daemon stopped (pid {pid})");
    Ok(())
}

pub fn status(config: &CalmConfig) -> Result<()> {
    let paths = daemon_paths(config);
    let socket_path = PathBuf::from(&config.socket_path);
    let socket_live = is_socket_live(&socket_path);

    match read_pid(&paths.pid_file)? {
        Some(pid) if is_pid_running(pid) || socket_live => {
            println!("daemon status: running");
            println!("- pid: {pid}");
        }
        _ => println!("daemon status: stopped"),
    }
    println!("- socket: {}", socket_path.display());
    println!("- log: {}", paths.log_file.display());
    Ok(())
}

fn is_socket_live(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(raw.trim().parse::<u32>().ok())
}

fn is_pid_running(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn terminate_pid(pid: u32) -> Result<()> {
    let status = Command::new("kill").arg(pid.to_string()).status()?;
    if !status.success() {
        bail!("failed to signal pid {pid}");
    }
    Ok(())
}

fn wait_for_pid_exit(pid: u32, timeout: Duration) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < timeout {
        if !is_pid_running(pid) {
            return;
        }
        std::thread::sleep(step);
        waited += step;
    }
}
