use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the Aureli backend.
///
/// Every knob has a default and an `AURELI_*` environment override; CLI flags
/// (port, db path, interval, dev mode) win over both.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    /// Fixed wait between dispatch cycles.
    pub dispatch_interval: Duration,
    /// Attempt ceiling enforced by the dispatcher itself.
    pub dispatch_max_attempts: u32,
    /// Higher ceiling enforced by the manual retry endpoint. A Failed event
    /// past the dispatcher ceiling can still be re-queued by an operator
    /// until this one is reached.
    pub retry_max_attempts: u32,
    /// Events selected per dispatch cycle.
    pub dispatch_batch_size: u32,
    /// Client-level timeout on outbound webhook POSTs.
    pub delivery_timeout: Duration,
    /// Permissive CORS for a local frontend dev server.
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5080,
            db_path: PathBuf::from(".aureli/aureli.db"),
            dispatch_interval: Duration::from_secs(30),
            dispatch_max_attempts: 5,
            retry_max_attempts: 10,
            dispatch_batch_size: 25,
            delivery_timeout: Duration::from_secs(10),
            dev_mode: false,
        }
    }
}

impl Config {
    /// Build a config from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parse(&lookup, "AURELI_PORT", defaults.port),
            db_path: lookup("AURELI_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            dispatch_interval: Duration::from_secs(parse(
                &lookup,
                "AURELI_DISPATCH_INTERVAL_SECS",
                defaults.dispatch_interval.as_secs(),
            )),
            dispatch_max_attempts: parse(
                &lookup,
                "AURELI_DISPATCH_MAX_ATTEMPTS",
                defaults.dispatch_max_attempts,
            ),
            retry_max_attempts: parse(
                &lookup,
                "AURELI_RETRY_MAX_ATTEMPTS",
                defaults.retry_max_attempts,
            ),
            dispatch_batch_size: parse(
                &lookup,
                "AURELI_DISPATCH_BATCH_SIZE",
                defaults.dispatch_batch_size,
            ),
            delivery_timeout: Duration::from_secs(parse(
                &lookup,
                "AURELI_DELIVERY_TIMEOUT_SECS",
                defaults.delivery_timeout.as_secs(),
            )),
            dev_mode: lookup("AURELI_DEV_MODE")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.dev_mode),
        }
    }
}

fn parse<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(map: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 5080);
        assert_eq!(config.dispatch_interval, Duration::from_secs(30));
        assert_eq!(config.dispatch_max_attempts, 5);
        assert_eq!(config.retry_max_attempts, 10);
        assert_eq!(config.dispatch_batch_size, 25);
        assert_eq!(config.delivery_timeout, Duration::from_secs(10));
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup_from(HashMap::from([
            ("AURELI_PORT", "8080"),
            ("AURELI_DISPATCH_INTERVAL_SECS", "5"),
            ("AURELI_DISPATCH_MAX_ATTEMPTS", "3"),
            ("AURELI_DEV_MODE", "true"),
        ])));
        assert_eq!(config.port, 8080);
        assert_eq!(config.dispatch_interval, Duration::from_secs(5));
        assert_eq!(config.dispatch_max_attempts, 3);
        assert!(config.dev_mode);
    }

    #[test]
    fn test_unparseable_value_falls_back_to_default() {
        let config = Config::from_lookup(lookup_from(HashMap::from([(
            "AURELI_PORT",
            "not-a-port",
        )])));
        assert_eq!(config.port, 5080);
    }
}
