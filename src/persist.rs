//! Persistence adapters — durable client storage and the auth cookie.
//!
//! DESIGN
//! ======
//! Two independent stores hold the same exported credential:
//! - `DurableStore`: key/value storage that survives restarts. Only written
//!   when the user asked to be remembered.
//! - `CookieStore`: the `pb_auth` cookie the route guard reads. Always
//!   written on login, re-derived after every session mutation.
//!
//! Cookies are built with `auth_cookie` / `removal_cookie` so the server
//! routes and client-side stores emit identical attributes.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use axum_extra::extract::cookie::{Cookie, SameSite};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Durable-store key holding the remembered credential.
pub const DURABLE_KEY: &str = "pocketbase_auth";
/// Cookie read by the route guard.
pub const COOKIE_NAME: &str = "pb_auth";

pub const REMEMBER_MAX_AGE_SECS: i64 = 30 * 24 * 60 * 60;
pub const SESSION_MAX_AGE_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

// =============================================================================
// COOKIE ATTRIBUTES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieLifetime {
    /// One day.
    Session,
    /// Thirty days.
    Remembered,
}

impl CookieLifetime {
    #[must_use]
    pub fn for_remember(remember: bool) -> Self {
        if remember { Self::Remembered } else { Self::Session }
    }

    #[must_use]
    pub fn max_age(self) -> Duration {
        match self {
            Self::Session => Duration::seconds(SESSION_MAX_AGE_SECS),
            Self::Remembered => Duration::seconds(REMEMBER_MAX_AGE_SECS),
        }
    }
}

/// `pb_auth=<value>; Path=/; SameSite=Strict; Max-Age=<lifetime>`.
#[must_use]
pub fn auth_cookie(value: String, lifetime: CookieLifetime, secure: bool) -> Cookie<'static> {
    Cookie::build((COOKIE_NAME, value))
        .path("/")
        .same_site(SameSite::Strict)
        .secure(secure)
        .max_age(lifetime.max_age())
        .build()
}

/// Expired, empty `pb_auth` cookie that makes clients drop the stored one.
#[must_use]
pub fn removal_cookie(secure: bool) -> Cookie<'static> {
    Cookie::build((COOKIE_NAME, ""))
        .path("/")
        .same_site(SameSite::Strict)
        .secure(secure)
        .max_age(Duration::ZERO)
        .expires(OffsetDateTime::UNIX_EPOCH)
        .build()
}

// =============================================================================
// TRAITS
// =============================================================================

/// Key/value storage that survives process restarts.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, PersistError>;
    fn set(&self, key: &str, value: &str) -> Result<(), PersistError>;
    fn remove(&self, key: &str) -> Result<(), PersistError>;
}

/// Client-side cookie jar. `get` must not return expired cookies.
pub trait CookieStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>, PersistError>;
    fn set(&self, cookie: Cookie<'static>) -> Result<(), PersistError>;
    fn remove(&self, name: &str) -> Result<(), PersistError>;
}

// =============================================================================
// MEMORY ADAPTERS
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryDurableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryDurableStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCookieStore {
    cookies: Mutex<HashMap<String, (Cookie<'static>, Instant)>>,
}

impl MemoryCookieStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored cookie with all its attributes, if still live.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<Cookie<'static>> {
        let cookies = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        let (cookie, set_at) = cookies.get(name)?;
        let expired = cookie
            .max_age()
            .is_some_and(|max_age| set_at.elapsed().as_secs_f64() >= max_age.as_seconds_f64());
        (!expired).then(|| cookie.clone())
    }
}

impl CookieStore for MemoryCookieStore {
    fn get(&self, name: &str) -> Result<Option<String>, PersistError> {
        Ok(self.cookie(name).map(|c| c.value().to_owned()))
    }

    fn set(&self, cookie: Cookie<'static>) -> Result<(), PersistError> {
        let mut cookies = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        if cookie.max_age().is_some_and(Duration::is_zero) {
            cookies.remove(cookie.name());
        } else {
            cookies.insert(cookie.name().to_owned(), (cookie, Instant::now()));
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), PersistError> {
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }
}

// =============================================================================
// FILE ADAPTERS
// =============================================================================

/// One file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileDurableStore {
    dir: PathBuf,
}

impl FileDurableStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl DurableStore for FileDurableStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistError> {
        match fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistError> {
        fs::create_dir_all(&self.dir)?;
        write_atomic(&self.path(key), value.as_bytes())
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        remove_if_present(&self.path(key))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCookie {
    value: String,
    expires_at: Option<i64>,
}

/// Cookie jar persisted as one JSON file, honoring `Max-Age`.
#[derive(Debug)]
pub struct FileCookieStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCookieStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    fn load(&self) -> Result<HashMap<String, StoredCookie>, PersistError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, cookies: &HashMap<String, StoredCookie>) -> Result<(), PersistError> {
        if cookies.is_empty() {
            return remove_if_present(&self.path);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&self.path, &serde_json::to_vec_pretty(cookies)?)
    }
}

impl CookieStore for FileCookieStore {
    fn get(&self, name: &str) -> Result<Option<String>, PersistError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        Ok(self
            .load()?
            .remove(name)
            .filter(|c| c.expires_at.is_none_or(|at| at > now))
            .map(|c| c.value))
    }

    fn set(&self, cookie: Cookie<'static>) -> Result<(), PersistError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cookies = self.load()?;
        match cookie.max_age() {
            Some(max_age) if max_age.is_zero() || max_age.is_negative() => {
                cookies.remove(cookie.name());
            }
            max_age => {
                let expires_at = max_age.map(|d| (OffsetDateTime::now_utc() + d).unix_timestamp());
                cookies.insert(cookie.name().to_owned(), StoredCookie { value: cookie.value().to_owned(), expires_at });
            }
        }
        self.save(&cookies)
    }

    fn remove(&self, name: &str) -> Result<(), PersistError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cookies = self.load()?;
        if cookies.remove(name).is_some() {
            self.save(&cookies)?;
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), PersistError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[path = "persist_test.rs"]
mod tests;
