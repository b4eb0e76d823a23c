//! Secret storage for IMAP/SMTP credentials: an OS keyring-backed store with
//! a permissions-locked temp-file fallback, adapted from the teacher's
//! Google OAuth token store. The interactive PKCE browser flow and the
//! onboarding wizard it fed are dropped: wrenmail reads credentials from the
//! config file (spec §6) rather than running a setup wizard.

use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::warn;

const SERVICE_NAME: &str = "wrenmail";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSecret {
    value: String,
}

/// Keyring-backed secret store, keyed by account id. Holds whatever secret
/// a configured auth mechanism needs: an IMAP password, an SMTP password,
/// or an OAuth refresh/access token supplied out of band.
pub struct SecretStore {
    account_id: String,
}

impl SecretStore {
    pub fn new(account_id: &str) -> Self {
        SecretStore { account_id: account_id.to_string() }
    }

    pub fn load(&self, label: &str) -> AppResult<Option<String>> {
        match self.load_keyring(label) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(account = %self.account_id, label, error = %e, "keyring unavailable, secret not loaded");
                Ok(None)
            }
        }
    }

    pub fn save(&self, label: &str, value: &str) -> AppResult<()> {
        let serialized = serde_json::to_string(&StoredSecret { value: value.to_string() })
            .map_err(|e| AppError::Unexpected(format!("encoding secret: {e}")))?;
        if let Err(e) = self.save_keyring(label, &serialized) {
            warn!(account = %self.account_id, label, error = %e, "keyring save failed, writing to temp file as fallback");
            self.save_file(label, &serialized)?;
        }
        Ok(())
    }

    pub fn delete(&self, label: &str) {
        if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, &self.entry_key(label)) {
            let _ = entry.delete_password();
        }
    }

    fn entry_key(&self, label: &str) -> String {
        format!("{}:{}", self.account_id, label)
    }

    fn load_keyring(&self, label: &str) -> Result<Option<String>, String> {
        let entry = keyring::Entry::new(SERVICE_NAME, &self.entry_key(label))
            .map_err(|e| format!("keyring entry error: {e}"))?;
        match entry.get_password() {
            Ok(raw) => {
                let secret: StoredSecret =
                    serde_json::from_str(&raw).map_err(|e| format!("keyring secret decode: {e}"))?;
                Ok(Some(secret.value))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(format!("keyring read: {e}")),
        }
    }

    fn save_keyring(&self, label: &str, serialized: &str) -> Result<(), String> {
        let entry = keyring::Entry::new(SERVICE_NAME, &self.entry_key(label))
            .map_err(|e| format!("keyring entry error: {e}"))?;
        entry.set_password(serialized).map_err(|e| format!("keyring write: {e}"))
    }

    fn save_file(&self, label: &str, serialized: &str) -> AppResult<()> {
        let tmp = std::env::temp_dir().join(format!("wrenmail_secret_{}_{}.json", self.account_id, label));
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| AppError::Unexpected(format!("opening temp secret file: {e}")))?;

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
            file.write_all(serialized.as_bytes())
                .map_err(|e| AppError::Unexpected(format!("writing secret file: {e}")))?;
        }
        #[cfg(not(unix))]
        {
            use std::io::Write;
            file.write_all(serialized.as_bytes())
                .map_err(|e| AppError::Unexpected(format!("writing secret file: {e}")))?;
        }

        warn!(path = %tmp.display(), "secret saved to temp file due to keyring issues; move/delete after debugging");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_key_namespaces_by_account_and_label() {
        let store = SecretStore::new("alice@example.test");
        assert_eq!(store.entry_key("imap_password"), "alice@example.test:imap_password");
    }
}
