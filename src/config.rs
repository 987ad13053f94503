//! Configuration parsed from environment variables.
//!
//! All parsing goes through a lookup function so tests can feed a map
//! instead of mutating the process environment.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::guard::{GuardConfig, RouteTable};
use crate::records::ServiceIdentity;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_STORE_URL: &str = "http://127.0.0.1:8090";
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_AUTH_COLLECTION: &str = "users";
pub const DEFAULT_WEBSITE_DIR: &str = "./site";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub auth_collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_STORE_URL.to_owned(),
            timeout_secs: DEFAULT_STORE_TIMEOUT_SECS,
            auth_collection: DEFAULT_AUTH_COLLECTION.to_owned(),
        }
    }
}

impl StoreConfig {
    /// Store settings only; shared by the server and the CLI.
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        Self {
            base_url: lookup("STORE_URL")
                .unwrap_or_else(|| DEFAULT_STORE_URL.to_owned())
                .trim_end_matches('/')
                .to_owned(),
            timeout_secs: parse_or(lookup, "STORE_TIMEOUT_SECS", DEFAULT_STORE_TIMEOUT_SECS),
            auth_collection: lookup("AUTH_COLLECTION").unwrap_or_else(|| DEFAULT_AUTH_COLLECTION.to_owned()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub store: StoreConfig,
    pub guard: GuardConfig,
    pub service: Option<ServiceIdentity>,
    pub cookie_secure: bool,
    pub website_dir: PathBuf,
}

impl AppConfig {
    /// Build from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed.
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = match lookup("PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { var: "PORT", reason: format!("not a port: {raw}") })?,
            None => DEFAULT_PORT,
        };
        let store = StoreConfig::from_lookup(lookup);

        let defaults = GuardConfig::default();
        let routes = RouteTable::new(
            list_or(lookup, "GUARD_PUBLIC_ROUTES", defaults.routes.public()),
            list_or(lookup, "GUARD_PROTECTED_ROUTES", defaults.routes.protected()),
        );
        let role_landings = match lookup("GUARD_ROLE_LANDINGS") {
            Some(raw) => parse_role_landings(&raw)?,
            None => defaults.role_landings,
        };
        let guard = GuardConfig {
            routes,
            login_path: lookup("GUARD_LOGIN_PATH").unwrap_or(defaults.login_path),
            default_landing: lookup("GUARD_DEFAULT_LANDING").unwrap_or(defaults.default_landing),
            role_landings,
        };
        if guard.routes.classify(&guard.login_path) == crate::guard::RouteClass::Protected {
            return Err(ConfigError::Invalid {
                var: "GUARD_LOGIN_PATH",
                reason: format!("{} is covered by a protected route", guard.login_path),
            });
        }

        let service = ServiceIdentity::from_lookup(lookup, &store.auth_collection);

        Ok(Self {
            port,
            store,
            guard,
            service,
            cookie_secure: lookup("COOKIE_SECURE")
                .and_then(|raw| parse_bool(&raw))
                .unwrap_or(false),
            website_dir: lookup("WEBSITE_DIR").map_or_else(|| PathBuf::from(DEFAULT_WEBSITE_DIR), PathBuf::from),
        })
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Comma-separated list; blank entries dropped. Falls back when unset or empty.
fn list_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &[String]) -> Vec<String> {
    let parsed: Vec<String> = lookup(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    if parsed.is_empty() { default.to_vec() } else { parsed }
}

/// Parse `role=/path,role2=/path2`.
///
/// # Errors
///
/// Returns an error for entries without `=` or with a path not starting at `/`.
pub fn parse_role_landings(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut out = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((role, path)) = entry.split_once('=') else {
            return Err(ConfigError::Invalid { var: "GUARD_ROLE_LANDINGS", reason: format!("missing '=' in {entry:?}") });
        };
        let (role, path) = (role.trim(), path.trim());
        if role.is_empty() || !path.starts_with('/') {
            return Err(ConfigError::Invalid { var: "GUARD_ROLE_LANDINGS", reason: format!("bad entry {entry:?}") });
        }
        out.insert(role.to_owned(), path.to_owned());
    }
    Ok(out)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
