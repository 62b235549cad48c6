//! Client configuration file.
//!
//! JSON blob at `~/.mrc/qa_system/client/settings.conf` (POSIX) or
//! `%APPDATA%\mrc\qa_system\client\settings.conf` (Windows). Created on
//! first use with a random guest username and `default_host = "localhost"`.
//! The signed address book persists inside the same blob.

use crate::address_book::AddressBook;
use qa_protocol::{ProtocolInfo, Role};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot resolve a settings directory for this platform")]
    NoConfigDir,
    #[error("settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("user type must be \"user\" or \"admin\", got {0:?}")]
    UnknownRole(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub username: String,
    /// `"user"` or `"admin"`; anything else is a configuration error.
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    pub default_host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub user: UserSettings,
    pub server: ProtocolInfo,
    pub client: ClientSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address_book: Option<AddressBook>,
}

impl Settings {
    /// Platform settings path, per the original lab deployment layout.
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        #[cfg(windows)]
        let base = dirs::config_dir()
            .ok_or(SettingsError::NoConfigDir)?
            .join("mrc");
        #[cfg(not(windows))]
        let base = dirs::home_dir()
            .ok_or(SettingsError::NoConfigDir)?
            .join(".mrc");
        Ok(base
            .join("qa_system")
            .join("client")
            .join("settings.conf"))
    }

    /// Fresh defaults: a random guest identity pointed at localhost.
    pub fn generate() -> Settings {
        Settings {
            user: UserSettings {
                username: format!("Guest{}", rand::thread_rng().gen_range(0..10_000)),
                kind: "user".to_owned(),
            },
            server: ProtocolInfo::default(),
            client: ClientSettings {
                default_host: "localhost".to_owned(),
            },
            server_address_book: None,
        }
    }

    /// Read the settings file, creating it with defaults when missing.
    pub fn load_or_create(path: &Path) -> Result<Settings, SettingsError> {
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            return Ok(serde_json::from_str(&text)?);
        }
        let settings = Settings::generate();
        settings.save(path)?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    /// The configured role, rejecting anything the protocol doesn't know.
    pub fn role(&self) -> Result<Role, SettingsError> {
        match self.user.kind.as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(SettingsError::UnknownRole(other.to_owned())),
        }
    }

    /// Store the address book in the blob and write it through to disk.
    pub fn save_address_book(
        &mut self,
        book: &AddressBook,
        path: &Path,
    ) -> Result<(), SettingsError> {
        self.server_address_book = Some(book.clone());
        self.save(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_guest_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client").join("settings.conf");
        let settings = Settings::load_or_create(&path).unwrap();

        assert!(path.is_file());
        assert!(settings.user.username.starts_with("Guest"));
        assert_eq!(settings.user.kind, "user");
        assert_eq!(settings.client.default_host, "localhost");
        assert_eq!(settings.server.protocol, "QAServ1.0");
        assert_eq!(settings.server.client, "QA_QT1.0");

        let reloaded = Settings::load_or_create(&path).unwrap();
        assert_eq!(reloaded, settings);
    }

    #[test]
    fn unknown_role_is_a_configuration_error() {
        let mut settings = Settings::generate();
        settings.user.kind = "superuser".to_owned();
        assert!(matches!(
            settings.role(),
            Err(SettingsError::UnknownRole(_))
        ));
    }

    #[test]
    fn address_book_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.conf");
        let mut settings = Settings::load_or_create(&path).unwrap();

        let book = AddressBook::new();
        settings.save_address_book(&book, &path).unwrap();

        let reloaded = Settings::load_or_create(&path).unwrap();
        assert_eq!(reloaded.server_address_book, Some(book));
    }

    #[test]
    fn malformed_blob_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.conf");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            Settings::load_or_create(&path),
            Err(SettingsError::Json(_))
        ));
    }
}
