//! Configuration loading and typed config structures for the proxy.
//!
//! Configuration comes from an optional `paddock.yaml`, then environment
//! variables override individual fields. Every field has a default, so an
//! empty file (or no file at all) yields a runnable configuration that
//! relays nothing and falls back to replay.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::mode::Mode;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value is present but unusable.
    #[error("invalid {key}: {reason}")]
    Invalid {
        /// Config field or environment variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

fn invalid(key: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_owned(),
        reason: reason.to_string(),
    }
}

/// Top-level proxy configuration. Mirrors the structure of `paddock.yaml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProxyConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerSection,

    /// `auto`, or the name of a single mode to force.
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Priority chain walked in automatic mode before falling back to replay.
    #[serde(default = "default_chain")]
    pub chain: Vec<String>,

    /// Primary-feed relay.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Native timing hub.
    #[serde(default)]
    pub signalr: SignalRConfig,

    /// `OpenF1` REST, auth and MQTT endpoints.
    #[serde(default)]
    pub openf1: OpenF1Config,

    /// Historical replay.
    #[serde(default)]
    pub replay: ReplayConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            mode: default_mode(),
            chain: default_chain(),
            relay: RelayConfig::default(),
            signalr: SignalRConfig::default(),
            openf1: OpenF1Config::default(),
            replay: ReplayConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// An empty document yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Load from `path` when it exists, then apply process environment
    /// overrides and validate.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from reading, parsing, overriding or validating.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from a key lookup (normally the process environment).
    ///
    /// Recognised keys:
    /// - `PADDOCK_HOST`, `PADDOCK_PORT`, `PADDOCK_HEARTBEAT_SECS`
    /// - `PADDOCK_MODE`, `PADDOCK_CHAIN` (comma separated)
    /// - `RELAY_SCHEME`, `RELAY_HOST`, `RELAY_PATH`, `RELAY_MAX_ATTEMPTS`, `RELAY_BACKOFF_STEP_MS`
    /// - `SIGNALR_BASE_URL`
    /// - `OPENF1_API_BASE`, `OPENF1_TOKEN_URL`, `OPENF1_MQTT_HOST`, `OPENF1_MQTT_PORT`, `OPENF1_MQTT_TLS`,
    ///   `OPENF1_USERNAME`, `OPENF1_PASSWORD`, `OPENF1_POLL_INTERVAL_MS`
    /// - `REPLAY_API_BASE`, `REPLAY_SESSION_KEY`, `REPLAY_SPEED`, `REPLAY_LOOP`
    ///
    /// Empty values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a numeric or boolean value does
    /// not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("PADDOCK_HOST") {
            self.server.host = v;
        }
        override_parsed(&get, "PADDOCK_PORT", &mut self.server.port)?;
        override_parsed(&get, "PADDOCK_HEARTBEAT_SECS", &mut self.server.heartbeat_secs)?;
        if let Some(v) = get("PADDOCK_MODE") {
            self.mode = v;
        }
        if let Some(v) = get("PADDOCK_CHAIN") {
            self.chain = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect();
        }

        if let Some(v) = get("RELAY_SCHEME") {
            self.relay.scheme = v;
        }
        if let Some(v) = get("RELAY_HOST") {
            self.relay.host = v;
        }
        if let Some(v) = get("RELAY_PATH") {
            self.relay.path = v;
        }
        override_parsed(&get, "RELAY_MAX_ATTEMPTS", &mut self.relay.max_attempts)?;
        override_parsed(&get, "RELAY_BACKOFF_STEP_MS", &mut self.relay.backoff_step_ms)?;

        if let Some(v) = get("SIGNALR_BASE_URL") {
            self.signalr.base_url = v;
        }

        if let Some(v) = get("OPENF1_API_BASE") {
            self.openf1.api_base = v;
        }
        if let Some(v) = get("OPENF1_TOKEN_URL") {
            self.openf1.token_url = v;
        }
        if let Some(v) = get("OPENF1_MQTT_HOST") {
            self.openf1.mqtt_host = v;
        }
        override_parsed(&get, "OPENF1_MQTT_PORT", &mut self.openf1.mqtt_port)?;
        override_parsed(&get, "OPENF1_MQTT_TLS", &mut self.openf1.mqtt_tls)?;
        if let Some(v) = get("OPENF1_USERNAME") {
            self.openf1.username = Some(v);
        }
        if let Some(v) = get("OPENF1_PASSWORD") {
            self.openf1.password = Some(v);
        }
        override_parsed(&get, "OPENF1_POLL_INTERVAL_MS", &mut self.openf1.poll_interval_ms)?;

        if let Some(v) = get("REPLAY_API_BASE") {
            self.replay.api_base = v;
        }
        if let Some(v) = get("REPLAY_SESSION_KEY") {
            self.replay.session_key = v;
        }
        override_parsed(&get, "REPLAY_SPEED", &mut self.replay.speed)?;
        override_parsed(&get, "REPLAY_LOOP", &mut self.replay.loop_at_end)?;
        Ok(())
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown mode name, a
    /// non-positive replay speed or zero intervals.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.forced_mode()?;
        self.chain_modes()?;
        if !self.replay.speed.is_finite() || self.replay.speed <= 0.0 {
            return Err(invalid("replay.speed", "must be a positive number"));
        }
        if self.replay.tick_interval_ms == 0 {
            return Err(invalid("replay.tick_interval_ms", "must be at least 1"));
        }
        if self.openf1.poll_interval_ms == 0 {
            return Err(invalid("openf1.poll_interval_ms", "must be at least 1"));
        }
        if self.server.heartbeat_secs == 0 {
            return Err(invalid("server.heartbeat_secs", "must be at least 1"));
        }
        Ok(())
    }

    /// Mode forced by configuration, `None` for automatic selection.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown mode name.
    pub fn forced_mode(&self) -> Result<Option<Mode>, ConfigError> {
        Mode::parse_forced(&self.mode).map_err(|e| invalid("mode", e))
    }

    /// The automatic-mode priority chain.
    ///
    /// Replay and Stopped entries are skipped since replay always comes last.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown mode name.
    pub fn chain_modes(&self) -> Result<Vec<Mode>, ConfigError> {
        let mut modes = Vec::with_capacity(self.chain.len());
        for name in &self.chain {
            let mode: Mode = name.parse().map_err(|e| invalid("chain", e))?;
            if matches!(mode, Mode::Replay | Mode::Stopped) || modes.contains(&mode) {
                continue;
            }
            modes.push(mode);
        }
        Ok(modes)
    }
}

fn override_parsed<G, T>(get: &G, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = get(key) {
        *slot = raw.parse().map_err(|e| invalid(key, e))?;
    }
    Ok(())
}

/// HTTP listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSection {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds between stream keepalives.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl ServerSection {
    /// Keepalive period.
    pub const fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// Primary-feed relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelayConfig {
    /// `http` or `https`.
    #[serde(default = "default_relay_scheme")]
    pub scheme: String,

    /// Upstream host (with optional port). Empty disables the relay.
    #[serde(default)]
    pub host: String,

    /// Stream path on the upstream.
    #[serde(default = "default_relay_path")]
    pub path: String,

    /// Connection attempts before giving up.
    #[serde(default = "default_relay_max_attempts")]
    pub max_attempts: u32,

    /// Backoff grows by this many milliseconds per failed attempt.
    #[serde(default = "default_relay_backoff_step_ms")]
    pub backoff_step_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            scheme: default_relay_scheme(),
            host: String::new(),
            path: default_relay_path(),
            max_attempts: default_relay_max_attempts(),
            backoff_step_ms: default_relay_backoff_step_ms(),
        }
    }
}

impl RelayConfig {
    /// Full stream URL, or `None` when no host is configured.
    pub fn url(&self) -> Option<String> {
        if self.host.trim().is_empty() {
            return None;
        }
        Some(format!("{}://{}{}", self.scheme, self.host.trim(), self.path))
    }
}

/// Native timing hub configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SignalRConfig {
    /// Hub base URL; `/negotiate` and `/connect` are appended.
    #[serde(default = "default_signalr_base_url")]
    pub base_url: String,

    /// Topics named in the subscribe frame.
    #[serde(default = "default_signalr_topics")]
    pub topics: Vec<String>,

    /// Delay before reconnecting after a dropped socket.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Longest the socket stays open after reporting no live session.
    #[serde(default = "default_handoff_grace_ms")]
    pub handoff_grace_ms: u64,

    /// Consecutive connections without a snapshot before giving up.
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
}

impl Default for SignalRConfig {
    fn default() -> Self {
        Self {
            base_url: default_signalr_base_url(),
            topics: default_signalr_topics(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            handoff_grace_ms: default_handoff_grace_ms(),
            max_reconnects: default_max_reconnects(),
        }
    }
}

/// `OpenF1` endpoints and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenF1Config {
    /// REST base URL.
    #[serde(default = "default_openf1_api_base")]
    pub api_base: String,

    /// OAuth password-grant token endpoint.
    #[serde(default = "default_openf1_token_url")]
    pub token_url: String,

    /// MQTT broker host.
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,

    /// MQTT broker port.
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,

    /// Connect to the broker over TLS. Plain TCP only for local brokers.
    #[serde(default = "default_true")]
    pub mqtt_tls: bool,

    /// Account username. Pub/sub is disabled without it.
    #[serde(default)]
    pub username: Option<String>,

    /// Account password.
    #[serde(default)]
    pub password: Option<String>,

    /// REST polling cadence.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Each poll looks back this far to catch late-arriving records.
    #[serde(default = "default_overlap_secs")]
    pub overlap_secs: u64,

    /// Delay before reconnecting to the broker.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Consecutive failures (broker reconnects or poll discoveries) before giving up.
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
}

impl Default for OpenF1Config {
    fn default() -> Self {
        Self {
            api_base: default_openf1_api_base(),
            token_url: default_openf1_token_url(),
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            mqtt_tls: true,
            username: None,
            password: None,
            poll_interval_ms: default_poll_interval_ms(),
            overlap_secs: default_overlap_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnects: default_max_reconnects(),
        }
    }
}

impl OpenF1Config {
    /// Username and password, when both are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

/// Historical replay configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplayConfig {
    /// Archival REST base URL.
    #[serde(default = "default_openf1_api_base")]
    pub api_base: String,

    /// Session to replay.
    #[serde(default = "default_replay_session_key")]
    pub session_key: String,

    /// Race seconds per real second.
    #[serde(default = "default_replay_speed")]
    pub speed: f64,

    /// Real milliseconds between ticks.
    #[serde(default = "default_replay_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Race seconds skipped after the first position report.
    #[serde(default = "default_formation_skip_secs")]
    pub formation_skip_secs: u64,

    /// Start over after the session ends.
    #[serde(default = "default_true")]
    pub loop_at_end: bool,

    /// Pause between the end of a session and the restart.
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,

    /// Metadata fetch attempts before replay is declared unusable.
    #[serde(default = "default_setup_attempts")]
    pub setup_attempts: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            api_base: default_openf1_api_base(),
            session_key: default_replay_session_key(),
            speed: default_replay_speed(),
            tick_interval_ms: default_replay_tick_interval_ms(),
            formation_skip_secs: default_formation_skip_secs(),
            loop_at_end: true,
            restart_delay_secs: default_restart_delay_secs(),
            setup_attempts: default_setup_attempts(),
        }
    }
}

fn default_mode() -> String {
    "auto".to_owned()
}

fn default_chain() -> Vec<String> {
    vec!["relay".to_owned()]
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

const fn default_port() -> u16 {
    4000
}

const fn default_heartbeat_secs() -> u64 {
    15
}

fn default_relay_scheme() -> String {
    "https".to_owned()
}

fn default_relay_path() -> String {
    "/api/sse".to_owned()
}

const fn default_relay_max_attempts() -> u32 {
    5
}

const fn default_relay_backoff_step_ms() -> u64 {
    2000
}

fn default_signalr_base_url() -> String {
    "https://livetiming.formula1.com/signalr".to_owned()
}

fn default_signalr_topics() -> Vec<String> {
    [
        "Heartbeat",
        "SessionInfo",
        "SessionStatus",
        "TrackStatus",
        "DriverList",
        "TimingData",
        "TimingAppData",
        "TimingStats",
        "LapCount",
        "WeatherData",
        "RaceControlMessages",
        "TeamRadio",
        "ExtrapolatedClock",
        "SessionData",
    ]
    .into_iter()
    .map(ToOwned::to_owned)
    .collect()
}

const fn default_reconnect_delay_ms() -> u64 {
    5000
}

const fn default_handoff_grace_ms() -> u64 {
    3000
}

fn default_openf1_api_base() -> String {
    "https://api.openf1.org/v1".to_owned()
}

fn default_openf1_token_url() -> String {
    "https://api.openf1.org/token".to_owned()
}

fn default_mqtt_host() -> String {
    "mqtt.openf1.org".to_owned()
}

const fn default_mqtt_port() -> u16 {
    8883
}

const fn default_poll_interval_ms() -> u64 {
    4000
}

const fn default_overlap_secs() -> u64 {
    10
}

const fn default_max_reconnects() -> u32 {
    5
}

fn default_replay_session_key() -> String {
    "9472".to_owned()
}

const fn default_replay_speed() -> f64 {
    1.0
}

const fn default_replay_tick_interval_ms() -> u64 {
    1000
}

const fn default_formation_skip_secs() -> u64 {
    240
}

const fn default_true() -> bool {
    true
}

const fn default_restart_delay_secs() -> u64 {
    30
}

const fn default_setup_attempts() -> u32 {
    3
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_document_gives_defaults() {
        let config = ProxyConfig::parse("").unwrap();
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.heartbeat(), Duration::from_secs(15));
        assert_eq!(config.chain_modes().unwrap(), vec![Mode::Relay]);
        assert_eq!(config.forced_mode().unwrap(), None);
        assert!(config.relay.url().is_none());
        assert!(config.openf1.credentials().is_none());
    }

    #[test]
    fn yaml_sections_override_defaults() {
        let yaml = r"
server:
  port: 8080
mode: poller
chain: [relay, signalr, pubsub]
relay:
  host: timing.example.org
  max_attempts: 2
replay:
  session_key: '9158'
  speed: 8
";
        let config = ProxyConfig::parse(yaml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.forced_mode().unwrap(), Some(Mode::Poller));
        assert_eq!(
            config.chain_modes().unwrap(),
            vec![Mode::Relay, Mode::Native, Mode::PubSub]
        );
        assert_eq!(
            config.relay.url().as_deref(),
            Some("https://timing.example.org/api/sse")
        );
        assert_eq!(config.replay.session_key, "9158");
        assert!((config.replay.speed - 8.0).abs() < f64::EPSILON);
        assert!(config.replay.loop_at_end);
    }

    #[test]
    fn environment_overrides_yaml() {
        let mut config = ProxyConfig::parse("relay:\n  host: a.example\n").unwrap();
        config
            .apply_overrides(env(&[
                ("RELAY_HOST", "b.example:8443"),
                ("RELAY_SCHEME", "http"),
                ("PADDOCK_PORT", "9000"),
                ("PADDOCK_CHAIN", "pubsub, poller"),
                ("OPENF1_USERNAME", "fan"),
                ("OPENF1_PASSWORD", "secret"),
                ("OPENF1_MQTT_TLS", "false"),
                ("REPLAY_SPEED", "2.5"),
                ("PADDOCK_MODE", ""),
            ]))
            .unwrap();
        assert_eq!(config.relay.url().as_deref(), Some("http://b.example:8443/api/sse"));
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.chain_modes().unwrap(), vec![Mode::PubSub, Mode::Poller]);
        assert_eq!(config.openf1.credentials(), Some(("fan", "secret")));
        assert!(!config.openf1.mqtt_tls);
        assert_eq!(config.mode, "auto");
        config.validate().unwrap();
    }

    #[test]
    fn bad_numeric_override_is_invalid() {
        let mut config = ProxyConfig::default();
        let err = config
            .apply_overrides(env(&[("PADDOCK_PORT", "eighty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "PADDOCK_PORT"));
    }

    #[test]
    fn validation_rejects_unknown_mode_and_zero_speed() {
        let config = ProxyConfig::parse("mode: teleport\n").unwrap();
        assert!(config.validate().is_err());
        let config = ProxyConfig::parse("replay:\n  speed: 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn chain_skips_replay_and_duplicates() {
        let config = ProxyConfig::parse("chain: [relay, replay, relay, poller]\n").unwrap();
        assert_eq!(config.chain_modes().unwrap(), vec![Mode::Relay, Mode::Poller]);
    }
}
