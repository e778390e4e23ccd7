//! Configuration for agentd.
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/agentd/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the Local Transport (HTTP + SSE + `/ws`) binds to.
    pub bind_addr: SocketAddr,

    /// Root directory under which each sub-directory is one project,
    /// decoded from an absolute working-directory path (SPEC_FULL §3).
    pub projects_dir: PathBuf,

    /// Directory holding `auth.json`, `settings.json`, `push/*.json`,
    /// `uploads/*`, and (if file logging is on) `logs/`.
    pub data_dir: PathBuf,

    /// Optional relay rendezvous URL; when set, agentd also dials out and
    /// maintains a Frame Transport connection through it (SPEC_FULL §4.H).
    pub relay_url: Option<String>,

    /// Command used to invoke the underlying AI CLI (Agent Process,
    /// SPEC_FULL §4.C). Defaults to the name the real CLI is installed
    /// under; overridden in tests to point at a `MockAgentCli` script.
    pub agent_command: String,

    /// Extra arguments prepended to every agent invocation, before the
    /// Agent Process appends its own `--output-format`/`--resume` flags.
    pub agent_args: Vec<String>,

    /// Whether `agent_command` is a test/mock fixture rather than the real
    /// AI CLI (spec.md §4.C). A mock producer never writes a transcript
    /// file, so the Agent Process mirrors user-input messages into its
    /// in-memory history instead of relying on disk to surface them.
    pub agent_is_mock: bool,

    /// How long an `Idle` Agent Process may sit unused before the
    /// Supervisor reaps it (spec.md §4.D, default 5 minutes).
    pub idle_timeout: Duration,

    /// How recent a transcript file's mtime must be to count a session as
    /// `external` rather than `idle` when unowned (spec.md §4.E, §9).
    pub external_threshold: Duration,

    /// Debounce window for the Transcript Store's file watcher
    /// (SPEC_FULL §9, default 100ms).
    pub watch_debounce: Duration,

    /// Event Bus per-subscriber bounded queue capacity (spec.md §4.A).
    pub event_queue_capacity: usize,

    /// Largest upload the Frame Transport's upload manager will accept
    /// (spec.md §7 `TooLarge`); a declared `size` above this is rejected at
    /// `upload_start` before any bytes are written to `{dataDir}/uploads/`.
    pub max_upload_bytes: u64,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// `RUST_LOG`-style filter directive used when `RUST_LOG` itself is unset.
    pub level: String,
    /// Whether to also roll a daily log file under `{dataDir}/logs/agentd.log`.
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7417".parse().unwrap(),
            projects_dir: default_projects_dir(),
            data_dir: default_data_dir(),
            relay_url: None,
            agent_command: "claude".to_string(),
            agent_args: Vec::new(),
            agent_is_mock: false,
            idle_timeout: Duration::from_secs(5 * 60),
            external_threshold: Duration::from_secs(60),
            watch_debounce: Duration::from_millis(100),
            event_queue_capacity: 256,
            max_upload_bytes: 200 * 1024 * 1024,
            logging: LoggingConfig::default(),
        }
    }
}

fn default_projects_dir() -> PathBuf {
    dirs::home_dir()
        .map(|p| p.join(".agentd").join("projects"))
        .unwrap_or_else(|| PathBuf::from("./projects"))
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("agentd"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of `Config` that makes sense to persist).
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub projects_dir: Option<String>,
    pub data_dir: Option<String>,
    pub relay_url: Option<String>,
    pub agent_command: Option<String>,
    #[serde(default)]
    pub agent_args: Vec<String>,
    pub agent_is_mock: Option<bool>,
    pub idle_timeout_secs: Option<u64>,
    pub external_threshold_secs: Option<u64>,
    pub watch_debounce_ms: Option<u64>,
    pub event_queue_capacity: Option<usize>,
    pub max_upload_bytes: Option<u64>,
    pub logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileLogging {
    pub level: Option<String>,
    pub file: Option<bool>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// `~/.config/agentd/config.toml`. Uses Unix-style `~/.config` on all
    /// platforms for consistency across install targets.
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("agentd").join("config.toml"))
    }

    /// Create the config file with defaults if it doesn't exist. Called at
    /// startup to help operators discover configuration options.
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    /// Load file config if it exists.
    ///
    /// # Panics
    /// If the config file exists but cannot be parsed. This is intentional:
    /// a broken config should fail fast with a clear error rather than
    /// silently falling back to defaults while the operator debugs the
    /// wrong thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!(
                        "\n╔══════════════════════════════════════════════════════════════╗"
                    );
                    eprintln!(
                        "║  CONFIG ERROR - Failed to parse configuration file          ║"
                    );
                    eprintln!(
                        "╚══════════════════════════════════════════════════════════════╝\n"
                    );
                    eprintln!("  File: {}\n", path.display());
                    eprintln!("  Error: {}\n", e);
                    eprintln!("  Tip: Check for:\n");
                    eprintln!("    - Missing quotes around string values");
                    eprintln!("    - Invalid boolean values (use true/false)");
                    eprintln!("    - Malformed array syntax");
                    eprintln!("    - Typos in section names\n");
                    eprintln!("  To reset, delete the file and restart agentd.\n");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
                eprintln!("║  CONFIG ERROR - Cannot read configuration file              ║");
                eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
                eprintln!("  File: {}\n", path.display());
                eprintln!("  Error: {}\n", e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env > file > defaults.
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        let defaults = Self::default();

        let bind_addr = std::env::var("AGENTD_BIND")
            .ok()
            .or(file.bind_addr)
            .map(|s| s.parse().expect("invalid AGENTD_BIND / bind_addr"))
            .unwrap_or(defaults.bind_addr);

        let projects_dir = std::env::var("AGENTD_PROJECTS_DIR")
            .ok()
            .or(file.projects_dir)
            .map(PathBuf::from)
            .unwrap_or(defaults.projects_dir);

        let data_dir = std::env::var("AGENTD_DATA_DIR")
            .ok()
            .or(file.data_dir)
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let relay_url = std::env::var("AGENTD_RELAY_URL").ok().or(file.relay_url);

        let agent_command = std::env::var("AGENTD_AGENT_COMMAND")
            .ok()
            .or(file.agent_command)
            .unwrap_or(defaults.agent_command);

        let agent_args = if file.agent_args.is_empty() {
            defaults.agent_args
        } else {
            file.agent_args
        };

        let agent_is_mock = std::env::var("AGENTD_AGENT_IS_MOCK")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.agent_is_mock)
            .unwrap_or(defaults.agent_is_mock);

        let idle_timeout = std::env::var("AGENTD_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.idle_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.idle_timeout);

        let external_threshold = std::env::var("AGENTD_EXTERNAL_THRESHOLD_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.external_threshold_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.external_threshold);

        let watch_debounce = std::env::var("AGENTD_WATCH_DEBOUNCE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.watch_debounce_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.watch_debounce);

        let event_queue_capacity = file
            .event_queue_capacity
            .unwrap_or(defaults.event_queue_capacity);

        let max_upload_bytes = std::env::var("AGENTD_MAX_UPLOAD_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.max_upload_bytes)
            .unwrap_or(defaults.max_upload_bytes);

        let logging = LoggingConfig {
            level: std::env::var("AGENTD_LOG_LEVEL")
                .ok()
                .or(file.logging.as_ref().and_then(|l| l.level.clone()))
                .unwrap_or(defaults.logging.level),
            file: file
                .logging
                .as_ref()
                .and_then(|l| l.file)
                .unwrap_or(defaults.logging.file),
        };

        Self {
            bind_addr,
            projects_dir,
            data_dir,
            relay_url,
            agent_command,
            agent_args,
            agent_is_mock,
            idle_timeout,
            external_threshold,
            watch_debounce,
            event_queue_capacity,
            max_upload_bytes,
            logging,
        }
    }

    /// Render this config as the single-source-of-truth TOML template: both
    /// `ensure_config_exists()` and `agentd config --reset` write exactly
    /// this text, so the on-disk file always documents every known key.
    pub fn to_toml(&self) -> String {
        format!(
            r#"# agentd configuration
# Precedence: environment variables > this file > built-in defaults.

# Address the local HTTP/SSE/WebSocket surface binds to.
bind_addr = "{bind_addr}"

# Root directory under which each sub-directory is one project.
projects_dir = "{projects_dir}"

# Directory for auth.json, settings.json, push/*.json, uploads/*, logs/.
data_dir = "{data_dir}"

# Relay rendezvous URL for remote access. Leave unset to disable the relay.
# relay_url = "wss://relay.example.com/agentd"

# Command used to invoke the underlying AI CLI.
agent_command = "{agent_command}"

# Extra arguments prepended to every agent invocation.
agent_args = []

# Set true when agent_command points at a test/mock fixture rather than the
# real AI CLI; mirrors user-input messages into in-memory history since a
# mock never writes a transcript file to disk.
agent_is_mock = {agent_is_mock}

# Seconds an idle Agent Process may sit unused before being reaped.
idle_timeout_secs = {idle_timeout_secs}

# Seconds since last mtime change before an unowned session is "idle"
# rather than "external".
external_threshold_secs = {external_threshold_secs}

# Transcript file-watch debounce, in milliseconds.
watch_debounce_ms = {watch_debounce_ms}

# Per-subscriber Event Bus queue capacity before drop-oldest kicks in.
event_queue_capacity = {event_queue_capacity}

# Largest upload (bytes) the frame transport's upload manager accepts.
max_upload_bytes = {max_upload_bytes}

[logging]
# Used when the RUST_LOG environment variable is unset.
level = "{log_level}"
# Also roll a daily log file under {{data_dir}}/logs/agentd.log.
file = {log_file}
"#,
            bind_addr = self.bind_addr,
            projects_dir = self.projects_dir.display(),
            data_dir = self.data_dir.display(),
            agent_command = self.agent_command,
            agent_is_mock = self.agent_is_mock,
            idle_timeout_secs = self.idle_timeout.as_secs(),
            external_threshold_secs = self.external_threshold.as_secs(),
            watch_debounce_ms = self.watch_debounce.as_millis(),
            event_queue_capacity = self.event_queue_capacity,
            max_upload_bytes = self.max_upload_bytes,
            log_level = self.logging.level,
            log_file = self.logging.file,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let rendered = config.to_toml();
        let parsed: FileConfig = toml::from_str(&rendered).expect("default template must parse");
        assert_eq!(parsed.bind_addr.as_deref(), Some("127.0.0.1:7417"));
        assert_eq!(parsed.agent_command.as_deref(), Some("claude"));
        assert_eq!(
            parsed.idle_timeout_secs,
            Some(config.idle_timeout.as_secs())
        );
    }

    #[test]
    fn file_logging_defaults_to_info_and_no_file() {
        let logging = LoggingConfig::default();
        assert_eq!(logging.level, "info");
        assert!(!logging.file);
    }
}
