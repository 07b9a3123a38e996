use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use std::sync::{Arc, LazyLock};
use tokio::fs as async_fs;
use tracing::{debug, info, warn};

use crate::config::FfmpegConfig;
use crate::error::{FfwatchError, Result};
use crate::process::PidRegistry;

/// Process-wide async locks keyed by name.
static NAMED_LOCKS: LazyLock<parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> =
    LazyLock::new(|| parking_lot::Mutex::new(HashMap::new()));

/// The async lock registered under `name`, created on first use.
pub fn named_lock(name: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = NAMED_LOCKS.lock();
    Arc::clone(locks.entry(name.to_string()).or_default())
}

pub struct SetupManager {
    work_dir: PathBuf,
}

impl SetupManager {
    pub fn new<P: AsRef<Path>>(work_dir: P) -> Result<Self> {
        let work_dir = work_dir.as_ref().to_path_buf();

        // Create the work directory structure if it doesn't exist
        fs::create_dir_all(work_dir.join("bin"))?;
        fs::create_dir_all(work_dir.join("run"))?;
        fs::create_dir_all(work_dir.join("log"))?;

        Ok(Self { work_dir })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.work_dir.join("bin")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.work_dir.join("run")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.work_dir.join("log")
    }

    pub fn pid_tracker(&self) -> PidTracker {
        PidTracker::new(self.run_dir())
    }

    /// Kill strays of earlier runs, then resolve the binary and rewrite `binary_path`.
    ///
    /// Runs under a named lock so concurrent initialisations never race on the work directory.
    pub async fn initialize(&self, config: &mut FfmpegConfig) -> Result<()> {
        let lock = named_lock(&executable_name(&config.binary_path));
        let _guard = lock.lock().await;

        let killed = self.kill_strays().await?;
        if killed > 0 {
            warn!("Killed {} stray process(es) left by an earlier run", killed);
        }

        let binary = self.ensure_binary(config).await?;
        config.binary_path = binary.to_string_lossy().to_string();
        info!("Using media processor at {}", config.binary_path);
        Ok(())
    }

    /// Resolve the binary: explicit path, unpacked copy, bundled binary, then `PATH`.
    pub async fn ensure_binary(&self, config: &FfmpegConfig) -> Result<PathBuf> {
        let configured = Path::new(&config.binary_path);
        if configured.components().count() > 1 {
            if configured.is_file() {
                return Ok(configured.to_path_buf());
            }
            warn!("Configured binary {} does not exist", configured.display());
        }

        let name = executable_name(&config.binary_path);
        let unpacked = self.bin_dir().join(&name);
        if unpacked.is_file() {
            debug!("Found unpacked binary at {}", unpacked.display());
            return Ok(unpacked);
        }

        if let Some(bundled) = &config.bundled_path {
            if bundled.is_file() {
                self.unpack(bundled, &unpacked).await?;
                return Ok(unpacked);
            }
            warn!("Bundled binary {} does not exist", bundled.display());
        }

        find_in_path(&name, std::env::var_os("PATH"))
            .ok_or_else(|| FfwatchError::BinaryNotFound(name))
    }

    async fn unpack(&self, bundled: &Path, target: &Path) -> Result<()> {
        info!("Unpacking {} to {}", bundled.display(), target.display());

        let temp_path = target.with_extension("tmp");
        async_fs::copy(bundled, &temp_path)
            .await
            .map_err(|e| FfwatchError::Provision(format!("failed to copy {}: {}", bundled.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            async_fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o755)).await?;
        }

        async_fs::rename(&temp_path, target).await?;
        Ok(())
    }

    /// Kill processes recorded by earlier runs. Returns how many were still alive.
    pub async fn kill_strays(&self) -> Result<usize> {
        let tracker = self.pid_tracker();
        let mut killed = 0;
        for (pid, program) in tracker.recorded().await? {
            if kill_process(pid, &program).await? {
                killed += 1;
            }
            tracker.unregister(pid).await?;
        }
        Ok(killed)
    }
}

/// File name of the binary, with the platform executable suffix.
fn executable_name(binary_path: &str) -> String {
    let name = Path::new(binary_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| binary_path.to_string());
    let suffix = std::env::consts::EXE_SUFFIX;
    if suffix.is_empty() || name.ends_with(suffix) {
        name
    } else {
        format!("{}{}", name, suffix)
    }
}

fn find_in_path(name: &str, path_var: Option<OsString>) -> Option<PathBuf> {
    let path_var = path_var?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Records the pid of every running child as `<run_dir>/<pid>.pid` holding the program path.
#[derive(Debug, Clone)]
pub struct PidTracker {
    run_dir: PathBuf,
}

impl PidTracker {
    pub fn new<P: AsRef<Path>>(run_dir: P) -> Self {
        Self {
            run_dir: run_dir.as_ref().to_path_buf(),
        }
    }

    fn record_path(&self, pid: u32) -> PathBuf {
        self.run_dir.join(format!("{}.pid", pid))
    }

    pub async fn register(&self, pid: u32, program: &Path) -> Result<()> {
        async_fs::create_dir_all(&self.run_dir).await?;
        async_fs::write(self.record_path(pid), program.to_string_lossy().as_bytes()).await?;
        Ok(())
    }

    pub async fn unregister(&self, pid: u32) -> Result<()> {
        match async_fs::remove_file(self.record_path(pid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every recorded (pid, program) pair. Unparseable entries are skipped.
    pub async fn recorded(&self) -> Result<Vec<(u32, PathBuf)>> {
        let mut records = Vec::new();
        let mut entries = match async_fs::read_dir(&self.run_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            let Some(pid) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            else {
                debug!("Skipping {}", path.display());
                continue;
            };
            let program = async_fs::read_to_string(&path).await?;
            records.push((pid, PathBuf::from(program.trim())));
        }
        records.sort();
        Ok(records)
    }
}

#[async_trait]
impl PidRegistry for PidTracker {
    async fn register(&self, pid: u32, program: &Path) -> Result<()> {
        PidTracker::register(self, pid, program).await
    }

    async fn unregister(&self, pid: u32) -> Result<()> {
        PidTracker::unregister(self, pid).await
    }
}

/// Whether `pid` still runs `program`. Guards against pid reuse.
#[cfg(target_os = "linux")]
fn process_matches(pid: u32, program: &Path) -> bool {
    // The kernel truncates comm to 15 bytes
    let Ok(comm) = fs::read_to_string(format!("/proc/{}/comm", pid)) else {
        return false;
    };
    let expected: String = program
        .file_name()
        .map(|n| n.to_string_lossy().chars().take(15).collect())
        .unwrap_or_default();
    comm.trim() == expected
}

#[cfg(not(target_os = "linux"))]
fn process_matches(_pid: u32, _program: &Path) -> bool {
    true
}

/// SIGKILL `pid` if it still runs `program`. Returns whether a live process was killed.
#[cfg(unix)]
async fn kill_process(pid: u32, program: &Path) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if !process_matches(pid, program) {
        debug!("Process {} is gone or no longer {}", pid, program.display());
        return Ok(false);
    }

    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => {
            info!("Killed stray process {} ({})", pid, program.display());
            Ok(true)
        }
        Err(Errno::ESRCH) => Ok(false),
        Err(Errno::EPERM) => {
            warn!("Not permitted to kill process {}", pid);
            Ok(false)
        }
        Err(e) => Err(FfwatchError::Provision(format!("failed to kill process {}: {}", pid, e))),
    }
}

#[cfg(windows)]
async fn kill_process(pid: u32, program: &Path) -> Result<bool> {
    if !process_matches(pid, program) {
        return Ok(false);
    }
    let status = tokio::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map_err(|e| FfwatchError::Provision(format!("failed to run taskkill: {}", e)))?;
    Ok(status.success())
}
