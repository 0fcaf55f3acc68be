use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::WorkType;

/// Main configuration structure for the coordination bridge
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Mapping & assignment registry settings
    pub registry: RegistryConfig,
    /// Handoff router settings
    pub router: RouterConfig,
    /// Saga execution settings
    pub saga: SagaConfig,
    /// Startup recovery settings
    pub recovery: RecoveryConfig,
    /// `bd` CLI settings
    pub ticketing: TicketingConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Database settings, used by the sqlite registry backend
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: StoreBackend,
    /// JSON snapshot path for the file backend
    pub state_file_path: PathBuf,
    /// How long `Assign` waits for the active owner when asked to wait
    pub assign_wait_timeout_ms: u64,
    /// Work types whose failed/cancelled assignments also end the mapping
    pub terminal_failure_work_types: Vec<WorkType>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    pub backend: StoreBackend,
    /// JSON snapshot path for the file backend
    pub signal_log_path: PathBuf,
    /// Handler attempts before a signal is dead-lettered
    pub max_delivery_attempts: u32,
    /// Delay between attempts, multiplied by the attempt number
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Per-step deadline; a step exceeding it fails and triggers compensation
    pub step_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub run_on_startup: bool,
    /// Execution definition passed to the engine for new workflows
    pub default_definition: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TicketingConfig {
    /// Path to the `bd` binary
    pub bd_path: String,
    /// Actor recorded on every ticket change
    pub actor: String,
    /// Labels added to every issue the bridge creates
    pub labels: Vec<String>,
    /// Directory holding the `.beads` database; the process cwd when unset
    pub workspace_dir: Option<String>,
    /// Deadline for a single `bd` invocation
    pub command_timeout_secs: u64,
}

impl TicketingConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is unset
    pub log_level: String,
    /// JSON (`json`) or human readable (`pretty`) log output
    pub log_format: String,
    /// Enable counters
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            state_file_path: PathBuf::from(".beads-bridge/registry.json"),
            assign_wait_timeout_ms: 30_000,
            terminal_failure_work_types: WorkType::ALL.to_vec(),
        }
    }
}

impl RegistryConfig {
    pub fn assign_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.assign_wait_timeout_ms)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            signal_log_path: PathBuf::from(".beads-bridge/signals.json"),
            max_delivery_attempts: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            step_timeout_seconds: None,
        }
    }
}

impl SagaConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_seconds.map(Duration::from_secs)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            run_on_startup: true,
            default_definition: "beads-workflow".to_string(),
        }
    }
}

impl Default for TicketingConfig {
    fn default() -> Self {
        Self {
            bd_path: "bd".to_string(),
            actor: "workflow-system".to_string(),
            labels: Vec::new(),
            workspace_dir: None,
            command_timeout_secs: 30,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            metrics_enabled: true,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            router: RouterConfig::default(),
            saga: SagaConfig::default(),
            recovery: RecoveryConfig::default(),
            ticketing: TicketingConfig::default(),
            observability: ObservabilityConfig::default(),
            database: Some(DatabaseConfig {
                url: "sqlite://.beads-bridge/coordination.db".to_string(),
                max_connections: 10,
                auto_migrate: true,
            }),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (beads-bridge.toml, .beads-bridge-rc)
    /// 3. Environment variables (prefixed with BEADS_BRIDGE__)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&BridgeConfig::default())?);

        if Path::new("beads-bridge.toml").exists() {
            builder = builder.add_source(File::with_name("beads-bridge"));
        }

        if Path::new(".beads-bridge-rc").exists() {
            builder = builder.add_source(
                File::with_name(".beads-bridge-rc").format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("BEADS_BRIDGE")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("registry.terminal_failure_work_types")
                .with_list_parse_key("ticketing.labels")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load defaults overlaid with one explicit file
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&BridgeConfig::default())?)
            .add_source(File::from(path.as_ref()))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<BridgeConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = BridgeConfig::load_env_file();
        BridgeConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static BridgeConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}
