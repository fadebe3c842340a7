//! Relay settings.
//!
//! Settings are read with [`load_settings_object`] from, in increasing
//! priority:
//!
//! 1. every `*.json` file in `./config`,
//! 2. the files listed in the comma separated `CONFIG_FILES` env var,
//! 3. environment variables prefixed `RELAYD_`, nested with `__`, e.g.
//!    `RELAYD_RETRY__PENDING_THRESHOLD=120`.
//!
//! Durations are given in seconds.

use std::{env, path::PathBuf, time::Duration};

use eyre::{ensure, Result};
use serde::Deserialize;

pub use loader::*;
pub use trace::*;

mod loader;
/// Tracing subscriber configuration
pub mod trace;

/// Environment variable prefix for relay settings
pub const ENV_PREFIX: &str = "RELAYD";

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

fn valid_secs(name: &str, value: f64) -> Result<()> {
    ensure!(
        value.is_finite() && value >= 0.0,
        "{name} must be a non-negative number of seconds, got {value}"
    );
    Ok(())
}

/// Top level relay settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Node connection
    pub chain: ChainConf,
    /// Key used to re-sign replacements. Without it the retrier is off.
    pub signer: Option<SignerConf>,
    /// rocksdb directory
    pub db: DbConf,
    /// Socket and dispatch loop timing
    pub session: SessionConf,
    /// Dispatch limits
    pub dispatch: DispatchConf,
    /// Resubmission of failed and stuck transactions
    pub retry: RetryConf,
    /// Block syncer
    pub sync: SyncConf,
    /// Logging
    pub tracing: TracingConfig,
    /// Port for the `/metrics` endpoint, disabled if unset
    pub metrics_port: Option<u16>,
}

/// Node connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConf {
    /// JSON-RPC endpoint
    pub rpc_url: String,
    /// EIP-155 chain id used when re-signing
    pub chain_id: u64,
}

impl Default for ChainConf {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_owned(),
            chain_id: 1,
        }
    }
}

/// Signer settings
#[derive(Clone, Deserialize)]
pub struct SignerConf {
    /// hex encoded secp256k1 private key
    pub key: String,
}

impl std::fmt::Debug for SignerConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerConf").field("key", &"<redacted>").finish()
    }
}

/// Database location
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct DbConf(pub PathBuf);

impl Default for DbConf {
    fn default() -> Self {
        Self(PathBuf::from("./relayd_db"))
    }
}

/// Session controller settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConf {
    /// Base directory for session sockets
    pub runtime_dir: PathBuf,
    /// Name of this queue instance
    pub session_id: String,
    /// Explicit socket path, overrides `runtime_dir`/`session_id`
    pub socket_path: Option<PathBuf>,
    /// First wait for a client before running a dispatch pass
    pub dispatch_delay: f64,
    /// Wait after a pass that dispatched something
    pub busy_delay: f64,
    /// Upper bound for the wait after idle passes
    pub max_dispatch_delay: f64,
    /// Time a connected client has to send a request
    pub client_timeout: f64,
    /// Largest accepted request in bytes
    pub max_message_size: usize,
}

impl Default for SessionConf {
    fn default() -> Self {
        Self {
            runtime_dir: env::temp_dir().join("relayd"),
            session_id: "default".to_owned(),
            socket_path: None,
            dispatch_delay: 4.0,
            busy_delay: 0.1,
            max_dispatch_delay: 4.0,
            client_timeout: 1.0,
            max_message_size: 128 * 1024,
        }
    }
}

impl SessionConf {
    /// The socket the controller listens on
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(|| {
            self.runtime_dir
                .join(&self.session_id)
                .join("relayd.sock")
        })
    }

    /// See [`SessionConf::dispatch_delay`]
    pub fn dispatch_delay(&self) -> Duration {
        secs(self.dispatch_delay)
    }

    /// See [`SessionConf::busy_delay`]
    pub fn busy_delay(&self) -> Duration {
        secs(self.busy_delay)
    }

    /// See [`SessionConf::max_dispatch_delay`]
    pub fn max_dispatch_delay(&self) -> Duration {
        secs(self.max_dispatch_delay)
    }

    /// See [`SessionConf::client_timeout`]
    pub fn client_timeout(&self) -> Duration {
        secs(self.client_timeout)
    }
}

/// Dispatcher settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConf {
    /// Maximum in-flight transactions per sender
    pub inflight_limit: usize,
    /// Maximum candidates considered per pass, unlimited if unset
    pub batch_limit: Option<usize>,
}

impl Default for DispatchConf {
    fn default() -> Self {
        Self {
            inflight_limit: 100,
            batch_limit: None,
        }
    }
}

/// Retrier settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConf {
    /// Run the retrier in every pass
    pub enabled: bool,
    /// Age after which an unconfirmed submission gets a fee bump
    pub pending_threshold: f64,
    /// Age after which a failed submission is queued again
    pub error_threshold: f64,
    /// Multiplier applied to the old fee
    pub fee_escalation_factor: f64,
}

impl Default for RetryConf {
    fn default() -> Self {
        Self {
            enabled: true,
            pending_threshold: 300.0,
            error_threshold: 60.0,
            fee_escalation_factor: 1.1,
        }
    }
}

impl RetryConf {
    /// See [`RetryConf::pending_threshold`]
    pub fn pending_threshold(&self) -> Duration {
        secs(self.pending_threshold)
    }

    /// See [`RetryConf::error_threshold`]
    pub fn error_threshold(&self) -> Duration {
        secs(self.error_threshold)
    }
}

/// Syncer settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConf {
    /// Run the syncer
    pub enabled: bool,
    /// First height of the initial history scan
    pub history_start: u64,
    /// Start at the head without a history scan
    pub skip_history: bool,
    /// Poll interval once caught up with the head
    pub interval: f64,
}

impl Default for SyncConf {
    fn default() -> Self {
        Self {
            enabled: true,
            history_start: 0,
            skip_history: false,
            interval: 5.0,
        }
    }
}

impl SyncConf {
    /// See [`SyncConf::interval`]
    pub fn interval(&self) -> Duration {
        secs(self.interval)
    }
}

impl RelaySettings {
    /// Load from the standard config locations and validate.
    pub fn load() -> Result<Self> {
        let settings: Self = load_settings_object(ENV_PREFIX)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.retry.fee_escalation_factor.is_finite() && self.retry.fee_escalation_factor > 1.0,
            "retry.fee_escalation_factor must be greater than 1, got {}",
            self.retry.fee_escalation_factor
        );
        ensure!(
            self.dispatch.inflight_limit > 0,
            "dispatch.inflight_limit must be positive"
        );
        ensure!(
            self.session.max_message_size > 0,
            "session.max_message_size must be positive"
        );
        valid_secs("session.dispatch_delay", self.session.dispatch_delay)?;
        valid_secs("session.busy_delay", self.session.busy_delay)?;
        valid_secs("session.max_dispatch_delay", self.session.max_dispatch_delay)?;
        valid_secs("session.client_timeout", self.session.client_timeout)?;
        valid_secs("retry.pending_threshold", self.retry.pending_threshold)?;
        valid_secs("retry.error_threshold", self.retry.error_threshold)?;
        valid_secs("sync.interval", self.sync.interval)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = RelaySettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.dispatch.inflight_limit, 100);
        assert_eq!(settings.retry.error_threshold(), Duration::from_secs(60));
        assert_eq!(settings.retry.pending_threshold(), Duration::from_secs(300));
        assert_eq!(settings.session.busy_delay(), Duration::from_millis(100));
    }

    #[test]
    fn socket_path_derives_from_session() {
        let mut session = SessionConf {
            runtime_dir: PathBuf::from("/run/relay"),
            session_id: "main".to_owned(),
            ..Default::default()
        };
        assert_eq!(
            session.socket_path(),
            PathBuf::from("/run/relay/main/relayd.sock")
        );
        session.socket_path = Some(PathBuf::from("/tmp/x.sock"));
        assert_eq!(session.socket_path(), PathBuf::from("/tmp/x.sock"));
    }

    #[test]
    fn rejects_non_escalating_factor() {
        let mut settings = RelaySettings::default();
        settings.retry.fee_escalation_factor = 1.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_negative_durations() {
        let mut settings = RelaySettings::default();
        settings.sync.interval = -1.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn signer_key_is_not_printed() {
        let conf = SignerConf {
            key: "deadbeef".to_owned(),
        };
        assert!(!format!("{conf:?}").contains("deadbeef"));
    }
}
