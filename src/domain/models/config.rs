use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for taskwire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Worker poll loop configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Execution engines available to this machine
    #[serde(default = "default_engines")]
    pub engines: Vec<EngineConfig>,

    /// Topic routing and outbound batching
    #[serde(default)]
    pub router: RouterConfig,

    /// Duplicate automated reply suppression
    #[serde(default)]
    pub suppression: SuppressionConfig,

    /// Engine failover policy
    #[serde(default)]
    pub failover: FailoverConfig,

    /// Stale machine and task recovery
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Reconnect policy for dropped session transports
    #[serde(default)]
    pub transport: TransportConfig,

    /// Outbound chat delivery
    #[serde(default)]
    pub chat: ChatConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            engines: default_engines(),
            router: RouterConfig::default(),
            suppression: SuppressionConfig::default(),
            failover: FailoverConfig::default(),
            recovery: RecoveryConfig::default(),
            transport: TransportConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

impl Config {
    /// Look up an engine definition by name.
    pub fn engine(&self, name: &str) -> Option<&EngineConfig> {
        self.engines.iter().find(|e| e.name == name)
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Machine id; defaults to the host name
    #[serde(default)]
    pub machine_id: Option<String>,

    /// Only claim tasks for this project
    #[serde(default)]
    pub project_filter: Option<String>,

    /// Delay between claim attempts when idle
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Interval between heartbeats
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Maximum concurrent sessions on this worker
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,

    /// Engines in order of preference
    #[serde(default = "default_engine_priority")]
    pub engine_priority: Vec<String>,

    /// Permission mode passed to the engine
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,

    /// Directory that holds one checkout per project
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
}

const fn default_poll_interval_ms() -> u64 {
    2000
}

const fn default_heartbeat_interval_secs() -> u64 {
    30
}

const fn default_max_concurrency() -> u32 {
    2
}

fn default_engine_priority() -> Vec<String> {
    vec!["claude".to_string(), "codex".to_string(), "gemini".to_string()]
}

fn default_permission_mode() -> String {
    "acceptEdits".to_string()
}

fn default_workspace_root() -> String {
    ".taskwire/workspaces".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            machine_id: None,
            project_filter: None,
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_concurrency: default_max_concurrency(),
            engine_priority: default_engine_priority(),
            permission_mode: default_permission_mode(),
            workspace_root: default_workspace_root(),
        }
    }
}

impl WorkerConfig {
    /// Configured machine id, else the host name, else `localhost`.
    pub fn resolved_machine_id(&self) -> String {
        self.machine_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| {
                nix::unistd::gethostname()
                    .ok()
                    .and_then(|name| name.into_string().ok())
                    .filter(|name| !name.is_empty())
            })
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".taskwire/taskwire.db".to_string()
}

const fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!("sqlite:{}", self.path)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files
    #[serde(default)]
    pub log_dir: Option<String>,

    /// File rotation: daily, hourly or never
    #[serde(default = "default_log_rotation")]
    pub rotation: String,

    /// Number of days to retain logs
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_rotation() -> String {
    "daily".to_string()
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_log_rotation(),
            retention_days: default_retention_days(),
        }
    }
}

/// How to launch one execution engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Name referenced by engine priority lists
    pub name: String,

    /// Executable to run
    pub binary: String,

    /// Arguments placed before the prompt
    #[serde(default)]
    pub args: Vec<String>,

    /// Flag that introduces the permission mode, if the engine takes one
    #[serde(default)]
    pub permission_flag: Option<String>,

    /// Flag that introduces the prompt; the prompt is positional when absent
    #[serde(default)]
    pub prompt_flag: Option<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl EngineConfig {
    /// Claude-code compatible layout with bidirectional stream-json.
    pub fn stream_json(name: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            args: vec![
                "--print".to_string(),
                "--verbose".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--input-format".to_string(),
                "stream-json".to_string(),
            ],
            permission_flag: Some("--permission-mode".to_string()),
            prompt_flag: None,
            env: vec![],
        }
    }
}

impl EngineConfig {
    /// Whether the prompt and replies are written to stdin as stream-json frames.
    pub fn streams_input(&self) -> bool {
        self.args
            .windows(2)
            .any(|w| w[0] == "--input-format" && w[1] == "stream-json")
    }
}

fn default_engines() -> Vec<EngineConfig> {
    vec![
        EngineConfig::stream_json("claude", "claude"),
        EngineConfig::stream_json("codex", "codex"),
        EngineConfig::stream_json("gemini", "gemini"),
    ]
}

/// Topic routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RouterConfig {
    /// Outbound text is batched and flushed at this interval
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Maximum size of one outbound chat message, in bytes
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,

    /// How long residual output is dropped after a close
    #[serde(default = "default_closed_grace_secs")]
    pub closed_grace_secs: u64,

    /// A spawn that never attaches is abandoned after this long
    #[serde(default = "default_spawn_guard_secs")]
    pub spawn_guard_secs: u64,

    /// Transcript entries kept per session for handoff context
    #[serde(default = "default_transcript_entries")]
    pub transcript_entries: usize,
}

const fn default_flush_interval_ms() -> u64 {
    1500
}

const fn default_max_message_len() -> usize {
    4000
}

const fn default_closed_grace_secs() -> u64 {
    10
}

const fn default_spawn_guard_secs() -> u64 {
    120
}

const fn default_transcript_entries() -> usize {
    50
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            max_message_len: default_max_message_len(),
            closed_grace_secs: default_closed_grace_secs(),
            spawn_guard_secs: default_spawn_guard_secs(),
            transcript_entries: default_transcript_entries(),
        }
    }
}

impl RouterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn closed_grace(&self) -> Duration {
        Duration::from_secs(self.closed_grace_secs)
    }

    pub fn spawn_guard(&self) -> Duration {
        Duration::from_secs(self.spawn_guard_secs)
    }
}

/// Suppression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SuppressionConfig {
    /// Lifetime of a suppression entry; must outlast the host's auto-reply latency
    #[serde(default = "default_suppression_ttl_secs")]
    pub ttl_secs: u64,
}

const fn default_suppression_ttl_secs() -> u64 {
    60
}

impl Default for SuppressionConfig {
    fn default() -> Self {
        Self { ttl_secs: default_suppression_ttl_secs() }
    }
}

impl SuppressionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Engine failover policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FailoverConfig {
    /// Window over which rate-limit signals are counted
    #[serde(default = "default_failover_window_secs")]
    pub window_secs: u64,

    /// Signals within the window that trigger a handoff
    #[serde(default = "default_signal_threshold")]
    pub signal_threshold: u32,

    /// A single signal asking to wait longer than this triggers a handoff
    #[serde(default = "default_retry_delay_threshold_secs")]
    pub retry_delay_threshold_secs: u64,

    /// Maximum engines tried in one handoff chain
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,

    /// A replacement that is rate limited within this window escalates
    #[serde(default = "default_immediate_window_secs")]
    pub immediate_window_secs: u64,

    /// Maximum characters of transcript carried into a handoff
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
}

const fn default_failover_window_secs() -> u64 {
    60
}

const fn default_signal_threshold() -> u32 {
    3
}

const fn default_retry_delay_threshold_secs() -> u64 {
    300
}

const fn default_max_hops() -> usize {
    3
}

const fn default_immediate_window_secs() -> u64 {
    30
}

const fn default_excerpt_chars() -> usize {
    4000
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            window_secs: default_failover_window_secs(),
            signal_threshold: default_signal_threshold(),
            retry_delay_threshold_secs: default_retry_delay_threshold_secs(),
            max_hops: default_max_hops(),
            immediate_window_secs: default_immediate_window_secs(),
            excerpt_chars: default_excerpt_chars(),
        }
    }
}

/// Recovery sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryConfig {
    /// Interval between sweeps
    #[serde(default = "default_recovery_interval_secs")]
    pub interval_secs: u64,

    /// Machines silent for longer than this are marked offline
    #[serde(default = "default_heartbeat_threshold_secs")]
    pub heartbeat_threshold_secs: u64,

    /// Running tasks older than this fail with `stale_recovery`
    #[serde(default = "default_stale_task_timeout_secs")]
    pub stale_task_timeout_secs: u64,

    /// Claimed tasks that never start are re-queued after this long
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
}

const fn default_recovery_interval_secs() -> u64 {
    30
}

const fn default_heartbeat_threshold_secs() -> u64 {
    120
}

const fn default_stale_task_timeout_secs() -> u64 {
    4 * 60 * 60
}

const fn default_claim_timeout_secs() -> u64 {
    300
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_recovery_interval_secs(),
            heartbeat_threshold_secs: default_heartbeat_threshold_secs(),
            stale_task_timeout_secs: default_stale_task_timeout_secs(),
            claim_timeout_secs: default_claim_timeout_secs(),
        }
    }
}

impl RecoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn heartbeat_threshold(&self) -> Duration {
        Duration::from_secs(self.heartbeat_threshold_secs)
    }

    pub fn stale_task_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_task_timeout_secs)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }
}

/// Transport reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TransportConfig {
    /// Replacement sessions spawned after a transport drop
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_reconnects() -> u32 {
    1
}

const fn default_initial_backoff_ms() -> u64 {
    1000
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_reconnects: default_max_reconnects(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Outbound chat delivery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ChatConfig {
    /// POST outbound messages to this URL; console output when unset
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Upper bound on webhook sends per second
    #[serde(default)]
    pub max_sends_per_second: Option<u32>,
}
