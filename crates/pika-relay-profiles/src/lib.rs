use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Relay URL error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayUrlError {
    #[error("invalid relay url {url:?}: {reason}")]
    Parse { url: String, reason: String },
    #[error("unsupported relay url scheme {scheme:?} (expected ws or wss)")]
    UnsupportedScheme { scheme: String },
    #[error("relay url {0:?} has no host")]
    MissingHost(String),
}

/// A validated `ws://` or `wss://` relay endpoint.
///
/// The trailing slash that `url` adds to bare hosts is dropped so that
/// `wss://relay.example` and `wss://relay.example/` compare equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayUrl(String);

impl RelayUrl {
    pub fn parse(raw: &str) -> Result<Self, RelayUrlError> {
        let trimmed = raw.trim();
        let parsed = url::Url::parse(trimmed).map_err(|e| RelayUrlError::Parse {
            url: trimmed.to_string(),
            reason: e.to_string(),
        })?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(RelayUrlError::UnsupportedScheme {
                    scheme: other.to_string(),
                })
            }
        }
        if parsed.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(RelayUrlError::MissingHost(trimmed.to_string()));
        }
        let mut normalized = parsed.to_string();
        if parsed.path() == "/" && parsed.query().is_none() && normalized.ends_with('/') {
            normalized.pop();
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_secure(&self) -> bool {
        self.0.starts_with("wss://")
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayUrl({})", self.0)
    }
}

impl FromStr for RelayUrl {
    type Err = RelayUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RelayUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelayUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Persisted relay entry. Owned by the caller; the pool only consumes snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    pub endpoint: RelayUrl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub can_read: bool,
    #[serde(default = "default_true")]
    pub can_write: bool,
}

fn default_true() -> bool {
    true
}

impl RelayConfig {
    /// Enabled, readable and writable.
    pub fn new(endpoint: RelayUrl) -> Self {
        Self {
            endpoint,
            display_name: None,
            enabled: true,
            can_read: true,
            can_write: true,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.can_write = false;
        self
    }

    pub fn write_only(mut self) -> Self {
        self.can_read = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Config load error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("relay config is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result of parsing a caller-owned relay list.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedRelayConfigs {
    pub configs: Vec<RelayConfig>,
    /// Entries skipped because their endpoint was malformed.
    pub rejected: Vec<RelayUrlError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRelayConfig {
    endpoint: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_true")]
    can_read: bool,
    #[serde(default = "default_true")]
    can_write: bool,
}

/// Parse a JSON list of relay configs.
///
/// A malformed endpoint only drops its own entry. Duplicate endpoints keep the
/// first occurrence.
pub fn parse_relay_configs(json: &str) -> Result<ParsedRelayConfigs, ConfigError> {
    let raw: Vec<RawRelayConfig> = serde_json::from_str(json)?;
    let mut out = ParsedRelayConfigs::default();
    let mut seen = HashSet::new();
    for entry in raw {
        let endpoint = match RelayUrl::parse(&entry.endpoint) {
            Ok(url) => url,
            Err(e) => {
                out.rejected.push(e);
                continue;
            }
        };
        if !seen.insert(endpoint.clone()) {
            continue;
        }
        out.configs.push(RelayConfig {
            endpoint,
            display_name: entry.display_name,
            enabled: entry.enabled,
            can_read: entry.can_read,
            can_write: entry.can_write,
        });
    }
    Ok(out)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RelayProfileId {
    PikachatProduction,
    PublicNostrApp,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RelayProfile {
    pub id: RelayProfileId,
    pub name: &'static str,
    pub message_relays: &'static [&'static str],
    pub inbox_relays: &'static [&'static str],
}

impl RelayProfile {
    /// Message relays get read/write access; inbox relays are read-only.
    pub fn relay_configs(self) -> Vec<RelayConfig> {
        let mut seen = HashSet::new();
        let messages = self
            .message_relays
            .iter()
            .filter_map(|u| RelayUrl::parse(u).ok())
            .map(RelayConfig::new);
        let inbox = self
            .inbox_relays
            .iter()
            .filter_map(|u| RelayUrl::parse(u).ok())
            .map(|u| RelayConfig::new(u).read_only());
        messages
            .chain(inbox)
            .filter(|c| seen.insert(c.endpoint.clone()))
            .collect()
    }
}

pub const PIKACHAT_PRODUCTION: RelayProfile = RelayProfile {
    id: RelayProfileId::PikachatProduction,
    name: "pikachat-production",
    message_relays: &[
        "wss://us-east.nostr.pikachat.org",
        "wss://eu.nostr.pikachat.org",
    ],
    inbox_relays: &["wss://nostr-pub.wellorder.net"],
};

pub const PUBLIC_NOSTR_APP: RelayProfile = RelayProfile {
    id: RelayProfileId::PublicNostrApp,
    name: "public-nostr-app",
    message_relays: &[
        "wss://relay.primal.net",
        "wss://nos.lol",
        "wss://relay.damus.io",
    ],
    inbox_relays: &["wss://nostr-pub.wellorder.net"],
};

pub fn default_profile() -> RelayProfile {
    PIKACHAT_PRODUCTION
}

pub fn app_profile() -> RelayProfile {
    PUBLIC_NOSTR_APP
}

pub fn default_relay_configs() -> Vec<RelayConfig> {
    default_profile().relay_configs()
}

/// Parse user-provided relay urls, falling back to the given profile when
/// nothing usable remains.
pub fn resolve_relay_urls(values: &[String], fallback: RelayProfile) -> Vec<RelayUrl> {
    let parsed: Vec<RelayUrl> = values
        .iter()
        .filter(|raw| !raw.trim().is_empty())
        .filter_map(|raw| RelayUrl::parse(raw).ok())
        .collect();
    if !parsed.is_empty() {
        return parsed;
    }
    fallback
        .message_relays
        .iter()
        .filter_map(|u| RelayUrl::parse(u).ok())
        .collect()
}
