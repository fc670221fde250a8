//! Process-wide configuration, read once at startup.
//!
//! Mirrors `Safir::Utilities::Internal::ConfigReader`: a handful of
//! environment variables select the runtime root, the logical instance and
//! the low-level log verbosity. The original reads `.ini`-style files under
//! the runtime root too; that file format belongs to the external
//! `lluf_config` component this crate does not reimplement (see
//! `DESIGN.md`), so only the environment-variable surface is modeled here.

use std::{env, path::PathBuf};

/// Process exit codes, per the specification's external interface (`spec.md`
/// §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Normal = 0,
    ConfigurationError = 1,
    StartupSynchronizationFailed = 2,
    FatalRuntimeError = 3,
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}

/// Configuration assembled from the environment at process start.
#[derive(Debug, Clone)]
pub struct Config {
    /// `SAFIR_RUNTIME`: root of the runtime installation. Used to namespace
    /// shared-memory/lock-file names in [`crate::startup_sync`].
    pub runtime_root: PathBuf,
    /// `SAFIR_INSTANCE`: logical instance selector, also folded into shared
    /// resource names so that several instances can coexist on one host.
    pub instance: String,
    /// `LLL_LOGLEVEL`: 0-9 low-level log verbosity, see [`crate::logging`].
    pub log_level: u8,
}

impl Config {
    /// Reads configuration from the environment. Missing variables fall
    /// back to sane defaults rather than failing, since only a deployment
    /// that actively sets them is making a deliberate choice; an absent
    /// `SAFIR_INSTANCE` just means "the default instance".
    pub fn from_env() -> Self {
        let runtime_root = env::var_os("SAFIR_RUNTIME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp/safir"));
        let instance = env::var("SAFIR_INSTANCE").unwrap_or_default();
        let log_level = env::var("LLL_LOGLEVEL")
            .ok()
            .and_then(|v| v.parse::<u8>().ok())
            .map(|v| v.min(9))
            .unwrap_or(0);

        Config {
            runtime_root,
            instance,
            log_level,
        }
    }

    /// Name a shared resource (lock file, named pipe) so that it is scoped
    /// to this runtime root and instance, matching how the original scopes
    /// its shared-memory segment names.
    pub fn shared_resource_path(&self, key: &str) -> PathBuf {
        let name = if self.instance.is_empty() {
            key.to_string()
        } else {
            format!("{}-{}", self.instance, key)
        };
        self.runtime_root.join(name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_env()
    }
}
