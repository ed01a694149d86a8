/*!
Flat `key = value` configuration store.

Parsed from a file or assembled in code; `#` starts a comment, keys are
case-sensitive, later assignments override earlier ones. Typed getters
return `ConfigError` for missing or ill-typed values, which aborts
construction of the component asking for them.
*/

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration key `{0}`")]
    Missing(String),
    #[error("configuration key `{key}`: cannot parse `{value}` as {ty}")]
    BadValue {
        key: String,
        value: String,
        ty: &'static str,
    },
    #[error("unknown {what} name `{name}`")]
    UnknownName { what: &'static str, name: String },
    #[error("configuration key `{key}`: {value} is not a power of two")]
    NotPowerOfTwo { key: String, value: u64 },
    #[error("{0}")]
    Invalid(String),
    #[error("cannot read configuration file `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A value parseable from the store.
pub trait FromConfig: Sized {
    const TYPE_NAME: &'static str;
    fn parse(s: &str) -> Option<Self>;
}

macro_rules! from_config_via_fromstr {
    ($($t:ty => $n:literal),* $(,)?) => {
        $(impl FromConfig for $t {
            const TYPE_NAME: &'static str = $n;
            fn parse(s: &str) -> Option<Self> {
                // Accept 0x-prefixed hex for the integer types.
                if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    return <$t>::from_str_radix(hex, 16).ok();
                }
                <$t>::from_str(s).ok()
            }
        })*
    };
}

from_config_via_fromstr!(u64 => "u64", u32 => "u32", usize => "usize");

impl FromConfig for bool {
    const TYPE_NAME: &'static str = "bool";
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        }
    }
}

impl FromConfig for String {
    const TYPE_NAME: &'static str = "string";
    fn parse(s: &str) -> Option<Self> {
        Some(s.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    values: BTreeMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_str_contents(&text))
    }

    pub fn from_str_contents(text: &str) -> Self {
        let mut cfg = Config::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                cfg.set(key.trim(), value.trim());
            }
        }
        cfg
    }

    pub fn set(&mut self, key: &str, value: impl fmt::Display) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Required typed lookup.
    pub fn get<T: FromConfig>(&self, key: &str) -> Result<T, ConfigError> {
        match self.values.get(key) {
            None => Err(ConfigError::Missing(key.to_string())),
            Some(raw) => T::parse(raw).ok_or_else(|| ConfigError::BadValue {
                key: key.to_string(),
                value: raw.clone(),
                ty: T::TYPE_NAME,
            }),
        }
    }

    /// Optional typed lookup; absent keys yield `None`, ill-typed values
    /// are still an error.
    pub fn get_opt<T: FromConfig>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(raw) => T::parse(raw)
                .map(Some)
                .ok_or_else(|| ConfigError::BadValue {
                    key: key.to_string(),
                    value: raw.clone(),
                    ty: T::TYPE_NAME,
                }),
        }
    }

    /// Typed lookup with a default for absent keys.
    pub fn get_or<T: FromConfig>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.get_opt(key)?.unwrap_or(default))
    }

    /// Required lookup that must also be a power of two.
    pub fn get_power_of_two(&self, key: &str) -> Result<u64, ConfigError> {
        let v: u64 = self.get(key)?;
        if !v.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                key: key.to_string(),
                value: v,
            });
        }
        Ok(v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lines_comments_and_overrides() {
        let cfg = Config::from_str_contents(
            "# memory geometry\n\
             CacheLineSize = 64\n\
             NumBanks = 4   # four banks\n\
             NumBanks = 8\n\
             BankSelector = XORFOLD\n\
             EnableCacheInjection = true\n",
        );
        assert_eq!(cfg.get::<usize>("CacheLineSize").unwrap(), 64);
        assert_eq!(cfg.get::<usize>("NumBanks").unwrap(), 8);
        assert_eq!(cfg.get::<String>("BankSelector").unwrap(), "XORFOLD");
        assert!(cfg.get::<bool>("EnableCacheInjection").unwrap());
    }

    #[test]
    fn hex_values() {
        let mut cfg = Config::new();
        cfg.set("BaseAddress", "0x1000");
        assert_eq!(cfg.get::<u64>("BaseAddress").unwrap(), 0x1000);
    }

    #[test]
    fn missing_and_bad_values() {
        let mut cfg = Config::new();
        cfg.set("BufferSize", "lots");
        assert!(matches!(
            cfg.get::<usize>("NumBanks"),
            Err(ConfigError::Missing(_))
        ));
        assert!(matches!(
            cfg.get::<usize>("BufferSize"),
            Err(ConfigError::BadValue { .. })
        ));
        assert_eq!(cfg.get_or("TimePerLine", 7usize).unwrap(), 7);
    }

    #[test]
    fn loads_from_a_file() {
        let path = std::env::temp_dir().join("comasim-config-test.ini");
        std::fs::write(&path, "CacheLineSize = 64\nBankSelector = DIRECT\n").unwrap();
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.get::<usize>("CacheLineSize").unwrap(), 64);
        std::fs::remove_file(&path).ok();

        assert!(matches!(
            Config::from_file("/nonexistent/comasim.ini"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn power_of_two_check() {
        let mut cfg = Config::new();
        cfg.set("NumRootDirectories", "3");
        assert!(matches!(
            cfg.get_power_of_two("NumRootDirectories"),
            Err(ConfigError::NotPowerOfTwo { .. })
        ));
        cfg.set("NumRootDirectories", "4");
        assert_eq!(cfg.get_power_of_two("NumRootDirectories").unwrap(), 4);
    }
}
