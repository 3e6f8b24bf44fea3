//! Configuration for the Conclave kernel

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::Duration;
use conclave_ceremony::{ApprovalRole, CeremonyConfig};
use conclave_context::ContextConfig;
use conclave_halt::HaltConfig;
use conclave_ledger::{AnomalyConfig, ReplicaConfig, SyncMode, WalConfig};
use conclave_watchdog::WatchdogConfig;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Main kernel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Root directory for WAL segments, the halt flag, the audit log and bundles
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Writer signing key
    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub halt: HaltConfig,

    #[serde(default)]
    pub ceremony: CeremonyConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub replica: ReplicaConfig,

    #[serde(default)]
    pub anomaly: AnomalySettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Ceremony approvers and external witnesses
    #[serde(default)]
    pub approvers: Vec<ApproverEntry>,

    /// Keys trusted out of band, typically the genesis writer key
    #[serde(default)]
    pub trust_anchors: Vec<TrustAnchor>,

    /// Shown to operators whenever the system is paused for integrity
    #[serde(default = "default_escalation_contact")]
    pub escalation_contact: String,

    /// Interval of the key-rotation and expiry maintenance loop
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            storage: StorageConfig::default(),
            signing: SigningConfig::default(),
            ledger: LedgerConfig::default(),
            halt: HaltConfig::default(),
            ceremony: CeremonyConfig::default(),
            context: ContextConfig::default(),
            watchdog: WatchdogConfig::default(),
            replica: ReplicaConfig::default(),
            anomaly: AnomalySettings::default(),
            logging: LoggingConfig::default(),
            approvers: Vec::new(),
            trust_anchors: Vec::new(),
            escalation_contact: default_escalation_contact(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Everything in memory (for development/testing)
    #[default]
    Memory,

    /// Segmented write-ahead log under `data_dir`
    Wal {
        /// Segment size before rotation
        #[serde(default = "default_segment_bytes")]
        max_segment_bytes: u64,

        /// fsync every append before acknowledging it
        #[serde(default = "default_true")]
        fsync: bool,
    },
}

impl StorageConfig {
    pub fn is_durable(&self) -> bool {
        matches!(self, StorageConfig::Wal { .. })
    }

    pub(crate) fn wal(&self) -> Option<WalConfig> {
        match self {
            StorageConfig::Memory => None,
            StorageConfig::Wal {
                max_segment_bytes,
                fsync,
            } => Some(WalConfig {
                max_segment_size: *max_segment_bytes,
                sync_mode: if *fsync { SyncMode::Immediate } else { SyncMode::OsManaged },
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Key the writer signs with on a fresh ledger
    #[serde(default = "default_key_id")]
    pub key_id: String,

    /// Directory of `<key_id>.key` files; defaults to `<data_dir>/keys`
    #[serde(default)]
    pub key_dir: Option<PathBuf>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_id: default_key_id(),
            key_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// How long a rotated-out key keeps verifying
    #[serde(default = "default_key_overlap")]
    pub key_overlap_secs: i64,

    /// Re-sign attempts when an internal append loses a head race
    #[serde(default = "default_max_resubmits")]
    pub max_resubmits: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            key_overlap_secs: default_key_overlap(),
            max_resubmits: default_max_resubmits(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalySettings {
    #[serde(default = "default_anomaly_window")]
    pub window_secs: i64,

    /// Rejections from one source within the window that raise a fault
    #[serde(default = "default_anomaly_threshold")]
    pub threshold: usize,
}

impl Default for AnomalySettings {
    fn default() -> Self {
        Self {
            window_secs: default_anomaly_window(),
            threshold: default_anomaly_threshold(),
        }
    }
}

impl AnomalySettings {
    pub(crate) fn tracker_config(&self) -> AnomalyConfig {
        AnomalyConfig {
            window: Duration::seconds(self.window_secs),
            threshold: self.threshold,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, or any `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverEntry {
    pub id: String,
    /// Hex Ed25519 public key
    pub public_key: String,
    #[serde(default = "default_role")]
    pub role: ApprovalRole,
    /// Witnesses only; two witnesses from one organisation never both count
    #[serde(default)]
    pub organisation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustAnchor {
    pub key_id: String,
    pub public_key: String,
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./conclave-data")
}

fn default_segment_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_key_id() -> String {
    "writer-1".to_string()
}

fn default_key_overlap() -> i64 {
    3600
}

fn default_max_resubmits() -> u32 {
    3
}

fn default_anomaly_window() -> i64 {
    300
}

fn default_anomaly_threshold() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_role() -> ApprovalRole {
    ApprovalRole::Approver
}

fn default_escalation_contact() -> String {
    "governance-oncall@localhost".to_string()
}

fn default_maintenance_interval() -> u64 {
    30
}

impl KernelConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `CONCLAVE__`-prefixed environment variables (`CONCLAVE__HALT__POLL_INTERVAL_MS`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&KernelConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CONCLAVE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// In-memory configuration rooted at `data_dir`, for development.
    pub fn development(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn key_dir(&self) -> PathBuf {
        self.signing
            .key_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("keys"))
    }

    /// Reject settings the components would misbehave under.
    pub fn validate(&self) -> KernelResult<()> {
        if self.signing.key_id.trim().is_empty() {
            return Err(KernelError::Config("signing.key_id is empty".into()));
        }
        if self.ledger.key_overlap_secs < 0 {
            return Err(KernelError::Config("ledger.key_overlap_secs is negative".into()));
        }
        if self.watchdog.dead_after_rounds == 0 {
            return Err(KernelError::Config("watchdog.dead_after_rounds must be at least 1".into()));
        }
        if self.context.read_batch == 0 || self.replica.batch_size == 0 {
            return Err(KernelError::Config("read batch sizes must be positive".into()));
        }
        if self.halt.degraded_poll_interval_ms > self.halt.poll_interval_ms {
            return Err(KernelError::Config(
                "halt.degraded_poll_interval_ms exceeds halt.poll_interval_ms".into(),
            ));
        }
        let mut seen = HashSet::new();
        for approver in &self.approvers {
            if !seen.insert(approver.id.as_str()) {
                return Err(KernelError::Config(format!("approver {} listed twice", approver.id)));
            }
        }
        let mut anchors = HashSet::new();
        for anchor in &self.trust_anchors {
            if !anchors.insert(anchor.key_id.as_str()) {
                return Err(KernelError::Config(format!("trust anchor {} listed twice", anchor.key_id)));
            }
        }
        Ok(())
    }
}
