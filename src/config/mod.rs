//! Configuration (spec §6): a single `key = value` text file, one setting
//! per line, `#` comments supported. Kept intentionally flat rather than
//! TOML/YAML — the spec defines the format literally as key=value pairs,
//! and the teacher's own config layer was env-var-only with no file format
//! to borrow from, so this follows the external interface contract instead.

use crate::errors::{AppError, AppResult};
use crate::types::PrefetchLevel;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Config {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub email: String,
    pub auth_mechanism: AuthMechanism,
    pub inbox: String,
    pub sent_folder: String,
    pub drafts_folder: String,
    pub trash_folder: String,
    pub poll_interval_secs: u64,
    pub cache_dir: PathBuf,
    pub cache_encryption: bool,
    pub save_pass: bool,
    pub prefetch_level: PrefetchLevel,
    pub client_store_sent: bool,
    pub compose_backup_interval_secs: u64,
    pub offline: bool,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
    XOAuth2,
}

impl Config {
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("reading config {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> AppResult<Self> {
        let mut map = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(AppError::Config(format!("line {}: expected key = value", lineno + 1)));
            };
            map.insert(key.trim().to_string(), value.trim().to_string());
        }

        let require = |key: &str| -> AppResult<String> {
            map.get(key).cloned().ok_or_else(|| AppError::Config(format!("missing required key: {key}")))
        };

        let auth_mechanism = match map.get("auth_mechanism").map(String::as_str) {
            Some("plain") | None => AuthMechanism::Plain,
            Some("login") => AuthMechanism::Login,
            Some("xoauth2") => AuthMechanism::XOAuth2,
            Some(other) => return Err(AppError::Config(format!("unknown auth_mechanism: {other}"))),
        };

        let prefetch_level = match map.get("prefetch_level").map(String::as_str) {
            None | Some("0") => PrefetchLevel::None,
            Some("1") => PrefetchLevel::CurrentMessage,
            Some("2") => PrefetchLevel::CurrentView,
            Some("3") => PrefetchLevel::FullSync,
            Some(other) => return Err(AppError::Config(format!("invalid prefetch_level: {other}"))),
        };

        let bit = |key: &str, default: bool| -> AppResult<bool> {
            match map.get(key).map(String::as_str) {
                None => Ok(default),
                Some("0") => Ok(false),
                Some("1") => Ok(true),
                Some(other) => Err(AppError::Config(format!("{key} must be 0 or 1, got {other}"))),
            }
        };

        Ok(Config {
            imap_host: require("imap_host")?,
            imap_port: parse_or(&map, "imap_port", 993)?,
            smtp_host: require("smtp_host")?,
            smtp_port: parse_or(&map, "smtp_port", 587)?,
            email: require("email")?,
            auth_mechanism,
            inbox: map.get("inbox").cloned().unwrap_or_else(|| "INBOX".to_string()),
            sent_folder: map.get("sent").cloned().unwrap_or_else(|| "Sent".to_string()),
            drafts_folder: map.get("drafts").cloned().unwrap_or_else(|| "Drafts".to_string()),
            trash_folder: map.get("trash").cloned().unwrap_or_else(|| "Trash".to_string()),
            poll_interval_secs: parse_or(&map, "poll_interval_secs", 300)?,
            cache_dir: map
                .get("cache_dir")
                .map(PathBuf::from)
                .unwrap_or_else(default_cache_dir),
            cache_encryption: bit("cache_encrypt", false)?,
            save_pass: bit("save_pass", false)?,
            prefetch_level,
            client_store_sent: bit("client_store_sent", true)?,
            compose_backup_interval_secs: parse_or(&map, "compose_backup_interval", 30)?,
            offline: bit("offline", false)?,
            log_level: map.get("log_level").cloned().unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parse_or<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> AppResult<T> {
    match map.get(key) {
        Some(v) => v.parse().map_err(|_| AppError::Config(format!("invalid value for {key}: {v}"))),
        None => Ok(default),
    }
}

/// `$XDG_DATA_HOME/wrenmail`, falling back to `~/.local/share/wrenmail`,
/// falling back to `./wrenmail-data` if no home directory can be found.
fn default_cache_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("wrenmail"))
        .unwrap_or_else(|| PathBuf::from("./wrenmail-data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let text = "imap_host = imap.example.test\nsmtp_host = smtp.example.test\nemail = a@example.test\n";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.imap_host, "imap.example.test");
        assert_eq!(config.imap_port, 993);
        assert_eq!(config.auth_mechanism, AuthMechanism::Plain);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let text = "# comment\n\nimap_host = a\nsmtp_host = b\nemail = c\n";
        assert!(Config::parse(text).is_ok());
    }

    #[test]
    fn missing_required_key_errors() {
        let text = "imap_host = a\n";
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn unknown_auth_mechanism_errors() {
        let text = "imap_host=a\nsmtp_host=b\nemail=c\nauth_mechanism=carrier-pigeon\n";
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn malformed_line_errors() {
        let text = "imap_host a\n";
        assert!(Config::parse(text).is_err());
    }
}
