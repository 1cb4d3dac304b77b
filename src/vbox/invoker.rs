use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use semver::Version;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::vbox::cache::{ResponseCache, FACT_TTL};
use crate::vbox::repair::{self, ConfigRepair};
use crate::vbox::parse;

/// Wait between attempts to acquire the advisory invocation lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Attempts before giving up on the lock and proceeding anyway. Two minutes
/// in total: long enough for any real invocation, short enough that a holder
/// that crashed without clearing the flag cannot deadlock the process.
const LOCK_MAX_TRIES: u32 = 240;

/// Result of one external-command run. `Err` from [`CommandRunner::run`] is
/// reserved for "could not execute at all"; a started command that exited
/// non-zero comes back as `success: false` with its output intact.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub success: bool,
    /// Combined stdout + stderr.
    pub output: String,
}

/// Executes an external program. The one seam the tests replace.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> Result<RunOutput>;
}

/// Runs commands as real child processes.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &Path, args: &[String]) -> Result<RunOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawning {}", program.display()))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(RunOutput {
            success: output.status.success(),
            output: combined,
        })
    }
}

/// The VBoxManage control plane: owns the binary path, the advisory
/// invocation lock, the response cache and the configuration repair.
/// Constructed once at process start and shared (`Arc`) by every caller;
/// VBoxManage misbehaves when invoked concurrently against the same VM, so
/// all invocations in this process funnel through here.
pub struct VBoxManage {
    binary: PathBuf,
    runner: Arc<dyn CommandRunner>,
    cache: ResponseCache,
    /// Unix timestamp of the invocation currently in flight; 0 when free.
    busy_since: AtomicI64,
    repair: ConfigRepair,
}

impl VBoxManage {
    pub fn new(config: &Config) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    pub fn with_runner(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            binary: config.vboxmanage_path.clone(),
            runner,
            cache: ResponseCache::new(),
            busy_since: AtomicI64::new(0),
            repair: ConfigRepair::new(config.virtualbox_config_path.clone()),
        }
    }

    pub(crate) fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Run `VBoxManage` with the given arguments and return its combined
    /// output. At most one invocation is in flight per process; callers that
    /// arrive while one is outstanding wait in a bounded retry loop.
    ///
    /// The lock is advisory. After [`LOCK_MAX_TRIES`] the caller proceeds
    /// anyway: a holder that crashed without clearing the flag must not
    /// stall the process forever, and an occasional doubled invocation only
    /// costs an access-denied error from VBoxManage itself.
    pub async fn invoke<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|s| s.as_ref().to_string()).collect();

        let _busy = self.acquire_slot().await;
        self.run_with_repair(&args).await
    }

    /// Run a command batch, stopping at the first failure.
    pub async fn run_commands(&self, commands: &[Vec<String>]) -> Result<()> {
        for command in commands {
            self.invoke(command).await?;
        }
        Ok(())
    }

    /// The VBoxManage version, parsed from `--version` output and cached.
    /// Returns `0.0.0` on any failure so version-gated command selection
    /// degrades to the older branch instead of failing the operation.
    pub async fn version(&self) -> Version {
        if let Some(cached) = self.cache.get("version").await {
            if let Ok(version) = Version::parse(&cached) {
                return version;
            }
        }

        let output = match self.invoke(&["--version"]).await {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "could not get VBoxManage version");
                return Version::new(0, 0, 0);
            }
        };

        match parse::version_token(&output) {
            Ok(version) => {
                self.cache.set("version", &version.to_string(), FACT_TTL).await;
                version
            }
            Err(err) => {
                warn!(error = %err, "could not parse VBoxManage version");
                Version::new(0, 0, 0)
            }
        }
    }

    /// Whether the VBoxManage binary is present and answers `--version`.
    pub async fn available(&self) -> bool {
        self.invoke(&["--version"]).await.is_ok()
    }

    async fn acquire_slot(&self) -> BusyGuard<'_> {
        let mut tries = 0u32;
        loop {
            let stamp = unix_now().max(1);
            if self
                .busy_since
                .compare_exchange(0, stamp, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return BusyGuard(&self.busy_since);
            }

            if tries >= LOCK_MAX_TRIES {
                warn!(
                    tries,
                    "proceeding without exclusive VBoxManage access; the busy flag was never cleared"
                );
                self.busy_since.store(stamp, Ordering::SeqCst);
                return BusyGuard(&self.busy_since);
            }

            tries += 1;
            debug!(attempt = tries, "waiting for the in-flight VBoxManage invocation to finish");
            sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn run_with_repair(&self, args: &[String]) -> Result<String> {
        let first = self.run_once(args).await?;
        if first.success {
            return Ok(first.output);
        }

        let command = self.command_line(args);
        error!(command = %command, output = %first.output, "VBoxManage failed");

        let Some(uuid) = repair::detect_duplicate_disk(&first.output) else {
            bail!("{command} failed: {}", first.output.trim());
        };

        self.repair.repair(&uuid).await.with_context(|| {
            format!("{command} failed with a duplicate hard disk registration and automatic repair did not succeed")
        })?;

        debug!(command = %command, "retrying once after duplicate hard disk repair");
        let second = self.run_once(args).await?;
        if second.success {
            return Ok(second.output);
        }

        // Deliberately not repaired again: if the corruption is being
        // reintroduced, looping would never terminate.
        error!(command = %command, output = %second.output, "VBoxManage failed again after repair");
        bail!(
            "{command} failed after duplicate hard disk repair: {}",
            second.output.trim()
        );
    }

    async fn run_once(&self, args: &[String]) -> Result<RunOutput> {
        let command = self.command_line(args);
        debug!(command = %command, "running VBoxManage");

        let result = self
            .runner
            .run(&self.binary, args)
            .await
            .with_context(|| format!("executing {}", self.binary.display()))?;

        trace!(command = %command, output = %result.output, "VBoxManage finished");
        Ok(result)
    }

    fn command_line(&self, args: &[String]) -> String {
        let mut line = self.binary.display().to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    #[cfg(test)]
    pub(crate) fn seize_busy_flag(&self) {
        self.busy_since.store(1, Ordering::SeqCst);
    }
}

/// Clears the busy flag when the invocation ends, success or failure alike.
struct BusyGuard<'a>(&'a AtomicI64);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(1)
}
