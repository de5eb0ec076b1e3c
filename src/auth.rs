use crate::error::AuthError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Outcome of validating a request against an [`Authenticator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    /// No or bad credentials: maps to 401
    Unauthenticated,
    /// Valid credentials, insufficient rights: maps to 403
    Forbidden,
}

/// Credentials extracted from a request, if any
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Pluggable request validator.
///
/// The media plane consults this before every path-addressed RTSP method
/// and converts the decision to a status code at the session boundary.
/// Policy (password hashing, roles) lives behind this trait.
pub trait Authenticator: Send + Sync {
    fn validate(&self, path: &str, method: &str, credentials: Option<&Credentials>)
        -> AuthDecision;
}

/// Authenticator that admits everything. Used when no users file is
/// configured and in tests.
#[derive(Debug, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn validate(&self, _: &str, _: &str, _: Option<&Credentials>) -> AuthDecision {
        AuthDecision::Allow
    }
}

/// One stored account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub username: String,
    #[serde(rename = "password")]
    pub password_hash: String,
    #[serde(rename = "isAdmin")]
    pub is_admin: bool,
}

/// File-backed account registry.
///
/// The whole map is rewritten on every mutation, pretty-printed with mode
/// 0600. A single mutex serializes load/store.
pub struct AccountStore {
    path: PathBuf,
    accounts: Mutex<HashMap<String, Account>>,
}

impl AccountStore {
    /// Open the store, creating an empty file if none exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AuthError> {
        let path = path.as_ref().to_path_buf();

        let accounts = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };

        let store = Self {
            path,
            accounts: Mutex::new(accounts),
        };
        if !store.path.exists() {
            store.save(&store.accounts.lock())?;
        }

        info!(path = %store.path.display(), "account store opened");
        Ok(store)
    }

    pub fn get(&self, id: &str) -> Option<Account> {
        self.accounts.lock().get(id).cloned()
    }

    pub fn by_username(&self, username: &str) -> Option<Account> {
        self.accounts
            .lock()
            .values()
            .find(|a| a.username == username)
            .cloned()
    }

    /// Insert or replace an account and persist the file.
    pub fn set(&self, account: Account) -> Result<(), AuthError> {
        let mut accounts = self.accounts.lock();
        debug!(id = %account.id, "storing account");
        accounts.insert(account.id.clone(), account);
        self.save(&accounts)
    }

    pub fn delete(&self, id: &str) -> Result<(), AuthError> {
        let mut accounts = self.accounts.lock();
        if accounts.remove(id).is_none() {
            return Err(AuthError::AccountNotFound(id.to_string()));
        }
        self.save(&accounts)
    }

    pub fn len(&self) -> usize {
        self.accounts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.lock().is_empty()
    }

    fn save(&self, accounts: &HashMap<String, Account>) -> Result<(), AuthError> {
        let raw = serde_json::to_string_pretty(accounts)?;
        std::fs::write(&self.path, raw)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

/// Verifies a stored hash against a presented password. Hash comparison is
/// policy, so it is injected rather than implemented here.
pub type PasswordVerifier = fn(hash: &str, password: &str) -> bool;

/// Authenticator backed by an [`AccountStore`].
pub struct StoreAuthenticator {
    store: AccountStore,
    verify: PasswordVerifier,
}

impl StoreAuthenticator {
    pub fn new(store: AccountStore, verify: PasswordVerifier) -> Self {
        Self { store, verify }
    }
}

impl Authenticator for StoreAuthenticator {
    fn validate(&self, _path: &str, method: &str, credentials: Option<&Credentials>) -> AuthDecision {
        let Some(creds) = credentials else {
            return AuthDecision::Unauthenticated;
        };

        let Some(account) = self.store.by_username(&creds.username) else {
            return AuthDecision::Unauthenticated;
        };

        if !(self.verify)(&account.password_hash, &creds.password) {
            return AuthDecision::Unauthenticated;
        }

        // Publishing is an administrative action; playback is not.
        let publishing = matches!(method, "ANNOUNCE" | "RECORD");
        if publishing && !account.is_admin {
            return AuthDecision::Forbidden;
        }

        AuthDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn account(id: &str, username: &str, admin: bool) -> Account {
        Account {
            id: id.to_string(),
            username: username.to_string(),
            password_hash: format!("hash:{}", username),
            is_admin: admin,
        }
    }

    fn plain_verify(hash: &str, password: &str) -> bool {
        hash == format!("hash:{}", password)
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.json");

        let store = AccountStore::open(&path).unwrap();
        store.set(account("1", "alice", true)).unwrap();
        store.set(account("2", "bob", false)).unwrap();
        assert_eq!(store.len(), 2);

        // Reopen and confirm persistence
        let store = AccountStore::open(&path).unwrap();
        assert_eq!(store.get("1").unwrap().username, "alice");
        assert!(!store.get("2").unwrap().is_admin);
    }

    #[test]
    fn test_delete_missing_account() {
        let dir = tempdir().unwrap();
        let store = AccountStore::open(dir.path().join("users.json")).unwrap();
        assert!(matches!(
            store.delete("nope"),
            Err(AuthError::AccountNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_users_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("users.json");
        let store = AccountStore::open(&path).unwrap();
        store.set(account("1", "alice", true)).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_store_authenticator_decisions() {
        let dir = tempdir().unwrap();
        let store = AccountStore::open(dir.path().join("users.json")).unwrap();
        store.set(account("1", "admin", true)).unwrap();
        store.set(account("2", "viewer", false)).unwrap();

        let auth = StoreAuthenticator::new(store, plain_verify);

        let admin = Credentials {
            username: "admin".to_string(),
            password: "admin".to_string(),
        };
        let viewer = Credentials {
            username: "viewer".to_string(),
            password: "viewer".to_string(),
        };
        let bad = Credentials {
            username: "viewer".to_string(),
            password: "wrong".to_string(),
        };

        assert_eq!(
            auth.validate("p1", "ANNOUNCE", Some(&admin)),
            AuthDecision::Allow
        );
        assert_eq!(
            auth.validate("p1", "ANNOUNCE", Some(&viewer)),
            AuthDecision::Forbidden
        );
        assert_eq!(
            auth.validate("p1", "DESCRIBE", Some(&viewer)),
            AuthDecision::Allow
        );
        assert_eq!(
            auth.validate("p1", "DESCRIBE", Some(&bad)),
            AuthDecision::Unauthenticated
        );
        assert_eq!(
            auth.validate("p1", "DESCRIBE", None),
            AuthDecision::Unauthenticated
        );
    }

    #[test]
    fn test_allow_all() {
        let auth = AllowAll;
        assert_eq!(auth.validate("p", "RECORD", None), AuthDecision::Allow);
    }
}
