use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read from `COHORT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// Records appended since the last snapshot before the WAL is compacted.
    pub compact_threshold: u64,
    /// Prometheus exporter port; `None` leaves metrics disabled.
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7878,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "COHORT_PORT").unwrap_or(defaults.port),
            bind: lookup("COHORT_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("COHORT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parsed(&lookup, "COHORT_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "COHORT_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "COHORT_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:7878");
    }

    #[test]
    fn values_are_read() {
        let config = Config::from_lookup(lookup(&[
            ("COHORT_PORT", "9000"),
            ("COHORT_BIND", "127.0.0.1"),
            ("COHORT_DATA_DIR", "/var/lib/cohort"),
            ("COHORT_MAX_CONNECTIONS", "16"),
            ("COHORT_COMPACT_THRESHOLD", "50"),
            ("COHORT_METRICS_PORT", "9100"),
        ]));
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/cohort"));
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn garbage_falls_back() {
        let config = Config::from_lookup(lookup(&[
            ("COHORT_PORT", "not-a-port"),
            ("COHORT_METRICS_PORT", "99999"),
        ]));
        assert_eq!(config.port, 7878);
        assert_eq!(config.metrics_port, None);
    }
}
