//! Durable key-value storage and the credential record kept in it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::error::Result;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const EXPIRES_IN_KEY: &str = "expires_in";
pub const EXPIRES_AT_KEY: &str = "expires_at";
pub const VERIFIER_KEY: &str = "code_verifier";

const CREDENTIAL_KEYS: [&str; 4] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, EXPIRES_IN_KEY, EXPIRES_AT_KEY];

/// String key-value storage. Multi-key writes are applied as one unit.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set_all(&mut self, entries: &[(&str, String)]) -> Result<()>;
    fn remove_all(&mut self, keys: &[&str]) -> Result<()>;
}

/// JSON object on disk, rewritten through a temp file + rename on every change.
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Ignoring unreadable store {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        debug!("Opened store {} ({} keys)", path.display(), entries.len());
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set_all(&mut self, entries: &[(&str, String)]) -> Result<()> {
        for (k, v) in entries {
            self.entries.insert(k.to_string(), v.clone());
        }
        self.flush()
    }

    fn remove_all(&mut self, keys: &[&str]) -> Result<()> {
        for k in keys {
            self.entries.remove(*k);
        }
        self.flush()
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

#[cfg(test)]
impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set_all(&mut self, entries: &[(&str, String)]) -> Result<()> {
        for (k, v) in entries {
            self.entries.insert(k.to_string(), v.clone());
        }
        Ok(())
    }

    fn remove_all(&mut self, keys: &[&str]) -> Result<()> {
        for k in keys {
            self.entries.remove(*k);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    /// Millisecond precision, matching what is persisted.
    pub expires_at: OffsetDateTime,
}

impl Credential {
    pub fn issued(
        access_token: String,
        refresh_token: String,
        expires_in: u64,
        issued_at: OffsetDateTime,
    ) -> Self {
        let expires_at_ms = unix_millis(issued_at).saturating_add((expires_in as i64).saturating_mul(1000));
        Self {
            access_token,
            refresh_token,
            expires_in,
            expires_at: from_unix_millis(expires_at_ms).unwrap_or(issued_at),
        }
    }

    /// Time left before expiry, negative once expired.
    pub fn remaining(&self, now: OffsetDateTime) -> Duration {
        self.expires_at - now
    }
}

/// Typed view over a [`KeyValueStore`] under fixed keys.
pub struct CredentialStore {
    kv: Box<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(kv: Box<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::default()))
    }

    pub fn save(&mut self, credential: &Credential) -> Result<()> {
        self.kv.set_all(&[
            (ACCESS_TOKEN_KEY, credential.access_token.clone()),
            (REFRESH_TOKEN_KEY, credential.refresh_token.clone()),
            (EXPIRES_IN_KEY, credential.expires_in.to_string()),
            (EXPIRES_AT_KEY, unix_millis(credential.expires_at).to_string()),
        ])
    }

    /// Absent unless every field is present and well-formed.
    pub fn load(&self) -> Option<Credential> {
        let access_token = self.kv.get(ACCESS_TOKEN_KEY).filter(|s| !s.is_empty())?;
        let refresh_token = self.kv.get(REFRESH_TOKEN_KEY).filter(|s| !s.is_empty())?;
        let expires_in = self.kv.get(EXPIRES_IN_KEY)?.parse::<u64>().ok()?;
        let expires_at_ms = self.kv.get(EXPIRES_AT_KEY)?.parse::<i64>().ok()?;
        let expires_at = from_unix_millis(expires_at_ms)?;
        Some(Credential { access_token, refresh_token, expires_in, expires_at })
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.kv.get(REFRESH_TOKEN_KEY).filter(|s| !s.is_empty())
    }

    pub fn clear(&mut self) -> Result<()> {
        let mut keys = CREDENTIAL_KEYS.to_vec();
        keys.push(VERIFIER_KEY);
        self.kv.remove_all(&keys)
    }

    pub fn save_verifier(&mut self, verifier: &str) -> Result<()> {
        self.kv.set_all(&[(VERIFIER_KEY, verifier.to_string())])
    }

    /// Read and remove the in-flight verifier; it is usable once.
    pub fn take_verifier(&mut self) -> Result<Option<String>> {
        let verifier = self.kv.get(VERIFIER_KEY).filter(|s| !s.is_empty());
        if verifier.is_some() {
            self.kv.remove_all(&[VERIFIER_KEY])?;
        }
        Ok(verifier)
    }
}

pub fn unix_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_unix_millis(ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: OffsetDateTime) -> Credential {
        Credential::issued("access".into(), "refresh".into(), 3600, now)
    }

    #[test]
    fn test_expiry_derived_from_issuance() {
        let issued = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let cred = sample(issued);
        assert_eq!(cred.expires_at - issued, Duration::seconds(3600));
        assert_eq!(cred.remaining(issued + Duration::seconds(3000)), Duration::seconds(600));
    }

    #[test]
    fn test_round_trip_memory() {
        let mut store = CredentialStore::in_memory();
        assert!(store.load().is_none());
        let cred = sample(OffsetDateTime::now_utc());
        store.save(&cred).unwrap();
        assert_eq!(store.load(), Some(cred));
    }

    #[test]
    fn test_round_trip_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.json");
        let cred = sample(OffsetDateTime::now_utc());
        {
            let mut store = CredentialStore::new(Box::new(FileStore::open(&path)));
            store.save(&cred).unwrap();
            store.save_verifier("verifier").unwrap();
        }
        let mut reopened = CredentialStore::new(Box::new(FileStore::open(&path)));
        assert_eq!(reopened.load(), Some(cred));
        assert_eq!(reopened.take_verifier().unwrap().as_deref(), Some("verifier"));
        assert_eq!(reopened.take_verifier().unwrap(), None);
    }

    #[test]
    fn test_partial_or_malformed_record_is_absent() {
        let mut kv = MemoryStore::default();
        kv.set_all(&[
            (ACCESS_TOKEN_KEY, "a".to_string()),
            (REFRESH_TOKEN_KEY, "r".to_string()),
            (EXPIRES_IN_KEY, "3600".to_string()),
        ])
        .unwrap();
        let mut store = CredentialStore::new(Box::new(kv));
        assert!(store.load().is_none());

        store.kv.set_all(&[(EXPIRES_AT_KEY, "soon".to_string())]).unwrap();
        assert!(store.load().is_none());

        store.kv.set_all(&[(EXPIRES_AT_KEY, "1700000000000".to_string())]).unwrap();
        assert!(store.load().is_some());
    }

    #[test]
    fn test_clear_removes_everything() {
        let mut store = CredentialStore::in_memory();
        store.save(&sample(OffsetDateTime::now_utc())).unwrap();
        store.save_verifier("v").unwrap();
        store.clear().unwrap();
        assert!(store.load().is_none());
        assert!(store.refresh_token().is_none());
        assert_eq!(store.take_verifier().unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = FileStore::open(&path);
        assert_eq!(store.get(ACCESS_TOKEN_KEY), None);
        assert_eq!(store.path(), path.as_path());
    }
}
