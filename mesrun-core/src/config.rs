//! Keyed configuration lookup.
//!
//! Tunables are read by dotted key (`Engine.Sleep`) from a [`ConfigSet`],
//! each with a default that is used when the key is absent or cannot be
//! parsed.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Prefix of environment variables read by [`EnvConfigSet`].
pub const ENV_PREFIX: &str = "MESRUN_";

/// A source of raw configuration values.
pub trait ConfigSet: Send + Sync {
    fn value(&self, key: &str) -> Option<String>;
}

/// A type that can be parsed from a raw configuration value.
pub trait ConfigValue: Sized {
    fn parse_value(raw: &str) -> Result<Self, String>;
}

/// Typed lookups over any [`ConfigSet`].
pub trait ConfigSetExt: ConfigSet {
    /// Returns the parsed value of `key`, or `default` when missing or
    /// unparsable.
    fn load_and_get<T: ConfigValue>(&self, key: &str, default: T) -> T {
        match self.value(key) {
            None => default,
            Some(raw) => match T::parse_value(raw.trim()) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("Invalid value '{}' for {}: {}, using default", raw, key, e);
                    default
                }
            },
        }
    }
}

impl<S: ConfigSet + ?Sized> ConfigSetExt for S {}

macro_rules! impl_config_value_from_str {
    ($($t:ty),*) => {
        $(
            impl ConfigValue for $t {
                fn parse_value(raw: &str) -> Result<Self, String> {
                    raw.parse::<$t>().map_err(|e| e.to_string())
                }
            }
        )*
    };
}

impl_config_value_from_str!(u8, u16, u32, u64, usize, i32, i64, f64);

impl ConfigValue for bool {
    fn parse_value(raw: &str) -> Result<Self, String> {
        match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            other => Err(format!("not a boolean: {}", other)),
        }
    }
}

impl ConfigValue for String {
    fn parse_value(raw: &str) -> Result<Self, String> {
        Ok(raw.to_string())
    }
}

impl ConfigValue for Duration {
    fn parse_value(raw: &str) -> Result<Self, String> {
        parse_duration(raw)
    }
}

/// Parses a duration.
///
/// Accepted forms: `250ms`, `5s`, `3m`, `1h`, `2d`, `hh:mm:ss[.fff]`, or a
/// bare number of seconds (`1.5`).
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }

    if raw.contains(':') {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 3 {
            return Err(format!("expected hh:mm:ss, got '{}'", raw));
        }
        let hours: u64 = parts[0].parse().map_err(|_| format!("bad hours in '{}'", raw))?;
        let minutes: u64 = parts[1].parse().map_err(|_| format!("bad minutes in '{}'", raw))?;
        let seconds: f64 = parts[2].parse().map_err(|_| format!("bad seconds in '{}'", raw))?;
        if minutes >= 60 || !(0.0..60.0).contains(&seconds) {
            return Err(format!("out of range component in '{}'", raw));
        }
        let whole = hours
            .checked_mul(3600)
            .and_then(|h| h.checked_add(minutes * 60))
            .ok_or_else(|| format!("duration '{}' is too large", raw))?;
        return seconds_to_duration(whole as f64 + seconds, raw);
    }

    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("bad number in '{}'", raw))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("negative or non finite duration '{}'", raw));
    }
    let seconds = match unit.trim() {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86400.0,
        other => return Err(format!("unknown unit '{}'", other)),
    };
    seconds_to_duration(seconds, raw)
}

fn seconds_to_duration(seconds: f64, raw: &str) -> Result<Duration, String> {
    let nanos = (seconds * 1e9).round();
    if nanos >= u64::MAX as f64 {
        return Err(format!("duration '{}' is too large", raw));
    }
    Ok(Duration::from_nanos(nanos as u64))
}

/// In-memory configuration, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryConfigSet {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryConfigSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) {
        self.values.write().remove(key);
    }
}

impl FromIterator<(String, String)> for MemoryConfigSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: RwLock::new(iter.into_iter().collect()),
        }
    }
}

impl ConfigSet for MemoryConfigSet {
    fn value(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }
}

/// Reads keys from the environment: `Engine.Sleep` is looked up as
/// `MESRUN_ENGINE_SLEEP`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfigSet;

impl EnvConfigSet {
    pub fn var_name(key: &str) -> String {
        let mut name = String::with_capacity(ENV_PREFIX.len() + key.len());
        name.push_str(ENV_PREFIX);
        for c in key.chars() {
            if c.is_ascii_alphanumeric() {
                name.push(c.to_ascii_uppercase());
            } else {
                name.push('_');
            }
        }
        name
    }
}

impl ConfigSet for EnvConfigSet {
    fn value(&self, key: &str) -> Option<String> {
        std::env::var(Self::var_name(key)).ok()
    }
}

/// Consults each layer in order and returns the first value found.
#[derive(Default)]
pub struct LayeredConfigSet {
    layers: Vec<Box<dyn ConfigSet>>,
}

impl LayeredConfigSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer(mut self, set: impl ConfigSet + 'static) -> Self {
        self.layers.push(Box::new(set));
        self
    }
}

impl ConfigSet for LayeredConfigSet {
    fn value(&self, key: &str) -> Option<String> {
        self.layers.iter().find_map(|l| l.value(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("7m").unwrap(), Duration::from_secs(420));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_clock_form() {
        assert_eq!(parse_duration("00:03:00").unwrap(), Duration::from_secs(180));
        assert_eq!(
            parse_duration("01:00:00.5").unwrap(),
            Duration::from_millis(3_600_500)
        );
        assert!(parse_duration("00:61:00").is_err());
        assert!(parse_duration("10:00").is_err());
    }

    #[test]
    fn test_parse_duration_clock_form_overflow() {
        assert!(parse_duration("99999999999999999:00:00").is_err());
        assert!(parse_duration("18446744073709551615:59:59").is_err());
        assert!(parse_duration("5124095576:00:00").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("5 weeks").is_err());
    }

    #[test]
    fn test_load_and_get_default_on_missing_or_invalid() {
        let set = MemoryConfigSet::new()
            .with("Engine.Sleep", "3s")
            .with("Engine.MaxThreadsInPool", "many");

        assert_eq!(
            set.load_and_get("Engine.Sleep", Duration::from_secs(2)),
            Duration::from_secs(3)
        );
        assert_eq!(set.load_and_get("Engine.MaxThreadsInPool", 20u32), 20);
        assert_eq!(set.load_and_get("Engine.Missing", 7u32), 7);
    }

    #[test]
    fn test_bool_values() {
        let set = MemoryConfigSet::new().with("a", "Yes").with("b", "0");
        assert!(set.load_and_get("a", false));
        assert!(!set.load_and_get("b", true));
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(EnvConfigSet::var_name("Engine.Sleep"), "MESRUN_ENGINE_SLEEP");
        assert_eq!(
            EnvConfigSet::var_name("Engine.NotResponding.Frequency"),
            "MESRUN_ENGINE_NOTRESPONDING_FREQUENCY"
        );
    }

    proptest::proptest! {
        #[test]
        fn prop_millis_round_trip(ms in 0u64..10_000_000) {
            proptest::prop_assert_eq!(
                parse_duration(&format!("{}ms", ms)).unwrap().as_millis(),
                Duration::from_millis(ms).as_millis()
            );
        }

        #[test]
        fn prop_clock_form(h in 0u64..10_000, m in 0u64..60, s in 0u64..60) {
            proptest::prop_assert_eq!(
                parse_duration(&format!("{:02}:{:02}:{:02}", h, m, s)).unwrap(),
                Duration::from_secs(h * 3600 + m * 60 + s)
            );
        }

        #[test]
        fn prop_clock_form_never_panics(h in proptest::num::u64::ANY, m in 0u64..60) {
            let _ = parse_duration(&format!("{}:{:02}:00", h, m));
        }

        #[test]
        fn prop_whole_seconds(secs in 0u64..1_000_000) {
            proptest::prop_assert_eq!(
                parse_duration(&secs.to_string()).unwrap(),
                Duration::from_secs(secs)
            );
        }
    }

    #[test]
    fn test_layered_first_wins() {
        let set = LayeredConfigSet::new()
            .layer(MemoryConfigSet::new().with("Sleep.Error", "5s"))
            .layer(
                MemoryConfigSet::new()
                    .with("Sleep.Error", "1s")
                    .with("Engine.Sleep", "4s"),
            );
        assert_eq!(set.value("Sleep.Error").as_deref(), Some("5s"));
        assert_eq!(set.value("Engine.Sleep").as_deref(), Some("4s"));
        assert_eq!(set.value("Nope"), None);
    }
}
