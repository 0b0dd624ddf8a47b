//! Server Configuration
//!
//! Everything is read from environment variables, each with a default.
//! Parsing goes through a lookup function so tests never touch the process
//! environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::core::multiplier::Multiplier;
use crate::fairness::{CrashPointConfig, SecretError, ServerSecret};
use crate::game::curve::GrowthCurve;
use crate::game::machine::RoundConfig;
use crate::network::auth::AuthConfig;
use crate::network::driver::DriverConfig;
use crate::network::server::ServerConfig;
use crate::settlement::RetryPolicy;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("{var}: cannot parse {value:?}")]
    Unparsable {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },

    /// A variable parsed but is out of range.
    #[error("{var}: {reason}")]
    OutOfRange {
        /// Variable name.
        var: &'static str,
        /// What is wrong.
        reason: String,
    },

    /// The server secret is malformed.
    #[error("CRASH_SERVER_SECRET: {0}")]
    Secret(#[from] SecretError),
}

/// Complete server configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Listener settings.
    pub server: ServerConfig,
    /// Round timing, curve and stakes.
    pub round: RoundConfig,
    /// Driver cadence.
    pub driver: DriverConfig,
    /// Ledger retry policy.
    pub retry: RetryPolicy,
    /// Token validation.
    pub auth: AuthConfig,
    /// Master secret. `None` means generate one at startup.
    pub server_secret: Option<ServerSecret>,
    /// Balance given to unknown players by the in-memory ledger.
    pub dev_starting_balance: Option<i64>,
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let mut server = ServerConfig::default();
        server.bind_addr = env.parse("CRASH_BIND_ADDR", server.bind_addr)?;
        server.max_connections = env.parse("CRASH_MAX_CONNECTIONS", server.max_connections)?;
        server.idle_timeout = env.secs("CRASH_IDLE_TIMEOUT_SECS", server.idle_timeout)?;

        let defaults = RoundConfig::default();
        let wait_duration = env.secs("CRASH_WAIT_SECS", defaults.wait_duration)?;
        if wait_duration < Duration::from_secs(1) {
            return Err(ConfigError::OutOfRange {
                var: "CRASH_WAIT_SECS",
                reason: "must be at least 1".into(),
            });
        }

        let curve_defaults = GrowthCurve::default();
        let k: f64 = env.parse("CRASH_GROWTH_K", curve_defaults.k)?;
        let d: f64 = env.parse("CRASH_GROWTH_D", curve_defaults.d)?;
        if !(k.is_finite() && k > 0.0 && d.is_finite() && d > 0.0) {
            return Err(ConfigError::OutOfRange {
                var: "CRASH_GROWTH_K",
                reason: "growth parameters must be positive".into(),
            });
        }

        let house_edge_bps: u32 =
            env.parse("CRASH_HOUSE_EDGE_BPS", defaults.crash.house_edge_bps)?;
        if house_edge_bps >= 10_000 {
            return Err(ConfigError::OutOfRange {
                var: "CRASH_HOUSE_EDGE_BPS",
                reason: "must be below 10000".into(),
            });
        }
        let max_multiplier: f64 =
            env.parse("CRASH_MAX_MULTIPLIER", defaults.crash.max_multiplier.as_f64())?;
        if !(max_multiplier.is_finite() && max_multiplier >= 1.0) {
            return Err(ConfigError::OutOfRange {
                var: "CRASH_MAX_MULTIPLIER",
                reason: "must be at least 1.00".into(),
            });
        }

        let min_stake: u64 = env.parse("CRASH_MIN_STAKE", defaults.min_stake)?;
        let max_stake: u64 = env.parse("CRASH_MAX_STAKE", defaults.max_stake)?;
        if min_stake == 0 || min_stake > max_stake {
            return Err(ConfigError::OutOfRange {
                var: "CRASH_MIN_STAKE",
                reason: format!("need 1 <= min ({}) <= max ({})", min_stake, max_stake),
            });
        }

        let round = RoundConfig {
            wait_duration,
            cooldown: env.secs("CRASH_COOLDOWN_SECS", defaults.cooldown)?,
            join_grace: env.millis("CRASH_JOIN_GRACE_MS", defaults.join_grace)?,
            curve: GrowthCurve::new(k, d),
            history_len: defaults.history_len,
            min_stake,
            max_stake,
            crash: CrashPointConfig {
                house_edge_bps,
                max_multiplier: Multiplier::from_f64_floor(max_multiplier),
            },
        };

        let mut driver = DriverConfig::default();
        driver.tick_interval = env.millis("CRASH_TICK_MS", driver.tick_interval)?;
        if driver.tick_interval < Duration::from_millis(10) {
            return Err(ConfigError::OutOfRange {
                var: "CRASH_TICK_MS",
                reason: "must be at least 10".into(),
            });
        }

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: env
                .parse("CRASH_SETTLE_MAX_ATTEMPTS", retry_defaults.max_attempts)?
                .max(1),
            initial_backoff: env.millis("CRASH_SETTLE_BACKOFF_MS", retry_defaults.initial_backoff)?,
            max_backoff: env.millis("CRASH_SETTLE_MAX_BACKOFF_MS", retry_defaults.max_backoff)?,
        };

        let server_secret = match env.raw("CRASH_SERVER_SECRET") {
            Some(hex) => Some(ServerSecret::from_hex(&hex)?),
            None => None,
        };

        let dev_starting_balance = match env.raw("CRASH_DEV_STARTING_BALANCE") {
            Some(value) => Some(value.parse().map_err(|_| ConfigError::Unparsable {
                var: "CRASH_DEV_STARTING_BALANCE",
                value,
            })?),
            None => None,
        };

        Ok(Self {
            server,
            round,
            driver,
            retry,
            auth: AuthConfig::from_lookup(&lookup),
            server_secret,
            dev_starting_balance,
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn raw(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        match self.raw(var) {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Unparsable { var, value }),
            None => Ok(default),
        }
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_millis() as u64).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.round, RoundConfig::default());
        assert_eq!(config.driver.tick_interval, Duration::from_millis(100));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.server.bind_addr.port(), 8080);
        assert!(config.server_secret.is_none());
        assert!(config.dev_starting_balance.is_none());
        assert!(!config.auth.is_configured());
    }

    #[test]
    fn test_overrides() {
        let secret = "ab".repeat(32);
        let config = load(&[
            ("CRASH_BIND_ADDR", "127.0.0.1:9000"),
            ("CRASH_WAIT_SECS", "5"),
            ("CRASH_JOIN_GRACE_MS", "250"),
            ("CRASH_HOUSE_EDGE_BPS", "300"),
            ("CRASH_MAX_MULTIPLIER", "50"),
            ("CRASH_SERVER_SECRET", secret.as_str()),
            ("CRASH_DEV_STARTING_BALANCE", "1000"),
            ("AUTH_SECRET", "jwt-secret"),
        ])
        .unwrap();

        assert_eq!(config.server.bind_addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.round.wait_duration, Duration::from_secs(5));
        assert_eq!(config.round.join_grace, Duration::from_millis(250));
        assert_eq!(config.round.crash.house_edge_bps, 300);
        assert_eq!(config.round.crash.max_multiplier.hundredths(), 5_000);
        assert!(config.server_secret.is_some());
        assert_eq!(config.dev_starting_balance, Some(1_000));
        assert!(config.auth.is_configured());
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            load(&[("CRASH_MAX_CONNECTIONS", "lots")]),
            Err(ConfigError::Unparsable { var: "CRASH_MAX_CONNECTIONS", .. })
        ));
        assert!(matches!(
            load(&[("CRASH_WAIT_SECS", "0")]),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            load(&[("CRASH_HOUSE_EDGE_BPS", "10000")]),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            load(&[("CRASH_MIN_STAKE", "10"), ("CRASH_MAX_STAKE", "5")]),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            load(&[("CRASH_SERVER_SECRET", "00")]),
            Err(ConfigError::Secret(_))
        ));
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = load(&[("CRASH_WAIT_SECS", "  ")]).unwrap();
        assert_eq!(config.round.wait_duration, Duration::from_secs(7));
    }
}
