//! Configuration file schema and loading.
//!
//! A config file carries the listening settings of the dev server and the
//! `proxy` mapping from path prefixes to forwarding rules:
//!
//! ```yaml
//! server:
//!   listen: 127.0.0.1:8080
//!   static_root: public
//! proxy:
//!   /tianshu:
//!     target: http://127.0.0.1:51385
//!     changeOrigin: true
//!     secure: false
//!     pathRewrite:
//!       ^/tianshu: ""
//! ```
//!
//! Files ending in `.json` are parsed as JSON, everything else as YAML.

use std::{
    fmt,
    marker::PhantomData,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{MapAccess, Visitor},
    ser::SerializeMap,
};
use tracing::debug;

use crate::error::ConfigError;

/// Top-level configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub proxy: OrderedMap<RuleEntry>,
}

/// Settings of the dev server itself.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub listen: SocketAddr,
    /// Directory served for requests no proxy rule claims
    pub static_root: Option<PathBuf>,
    /// Answer unknown paths with `index.html` instead of 404
    pub history_fallback: bool,
    pub connect_timeout_secs: u64,
    /// Upper bound on waiting for upstream response headers, unbounded when unset
    pub response_timeout_secs: Option<u64>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            static_root: None,
            history_fallback: false,
            connect_timeout_secs: 10,
            response_timeout_secs: None,
        }
    }
}

/// A value of the `proxy` mapping: either a bare target URL or full options.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum RuleEntry {
    Target(String),
    Options(RuleOptions),
}

impl RuleEntry {
    pub fn options(&self) -> RuleOptions {
        match self {
            RuleEntry::Target(target) => RuleOptions {
                target: target.clone(),
                change_origin: false,
                secure: true,
                path_rewrite: OrderedMap::default(),
            },
            RuleEntry::Options(options) => options.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleOptions {
    pub target: String,
    #[serde(default)]
    pub change_origin: bool,
    #[serde(default = "default_secure")]
    pub secure: bool,
    /// regex -> replacement, tried in order
    #[serde(default)]
    pub path_rewrite: OrderedMap<String>,
}

fn default_secure() -> bool {
    true
}

/// String-keyed mapping that keeps file order and duplicate keys.
///
/// Rule prefixes and rewrite patterns are order sensitive, and duplicate
/// prefixes have to reach validation instead of silently replacing each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V> OrderedMap<V> {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V> FromIterator<(K, V)> for OrderedMap<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping with string keys")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

impl ProxyConfig {
    /// Reads and parses a config file, choosing the format by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        debug!(
            "Parsing config {} as {}",
            path.display(),
            if is_json { "JSON" } else { "YAML" }
        );

        if is_json {
            Self::from_json_str(&contents)
        } else {
            Self::from_yaml_str(&contents)
        }
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }
}
