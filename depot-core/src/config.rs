use std::io;
use std::path::Path;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};

const SECURITY_FILE: &str = "security.json";
const DEFAULT_EXPIRATION: &str = "24h";

/// Runtime settings persisted at `.config/security.json`.
///
/// Secrets are generated on first run and the file is written with
/// owner-only permissions. The master key is at least 96 hex characters and
/// is never logged beyond its prefix (see [`Settings::master_key_prefix`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub master_key: String,
    pub jwt_secret: String,
    /// Token lifetime as a duration string, e.g. `"24h"`, `"30m"`.
    pub jwt_expiration: String,
    pub allow_registration: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            master_key: String::new(),
            jwt_secret: String::new(),
            jwt_expiration: DEFAULT_EXPIRATION.into(),
            allow_registration: true,
        }
    }
}

impl Settings {
    /// Load settings from `<config_dir>/security.json`, generating any
    /// missing secrets and writing the result back.
    pub fn load_or_init(config_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(config_dir)?;
        let path = config_dir.join(SECURITY_FILE);
        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        } else {
            Settings::default()
        };

        let mut dirty = false;
        if settings.master_key.len() < 96 {
            settings.master_key = random_hex(64);
            dirty = true;
        }
        if settings.jwt_secret.is_empty() {
            settings.jwt_secret = random_hex(32);
            dirty = true;
        }
        if settings.jwt_expiration.is_empty() {
            settings.jwt_expiration = DEFAULT_EXPIRATION.into();
            dirty = true;
        }
        if dirty || !path.exists() {
            settings.write(&path)?;
        }
        Ok(settings)
    }

    fn write(&self, path: &Path) -> io::Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, raw)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Token lifetime as a [`Duration`]; falls back to 24 hours when the
    /// configured string does not parse.
    pub fn jwt_expiration(&self) -> Duration {
        humantime::parse_duration(&self.jwt_expiration).unwrap_or_else(|_| {
            tracing::warn!(
                value = %self.jwt_expiration,
                "unparseable jwtExpiration, using 24h"
            );
            Duration::from_secs(24 * 3600)
        })
    }

    /// The only form of the master key that may appear in logs.
    pub fn master_key_prefix(&self) -> &str {
        &self.master_key[..self.master_key.len().min(8)]
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_generates_secrets_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_or_init(dir.path()).unwrap();
        assert!(settings.master_key.len() >= 96);
        assert!(!settings.jwt_secret.is_empty());
        assert_eq!(settings.jwt_expiration, "24h");

        let reloaded = Settings::load_or_init(dir.path()).unwrap();
        assert_eq!(reloaded.master_key, settings.master_key);
        assert_eq!(reloaded.jwt_secret, settings.jwt_secret);
    }

    #[cfg(unix)]
    #[test]
    fn security_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        Settings::load_or_init(dir.path()).unwrap();
        let mode = std::fs::metadata(dir.path().join("security.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn expiration_parses_duration_strings() {
        let settings = Settings {
            jwt_expiration: "30m".into(),
            ..Settings::default()
        };
        assert_eq!(settings.jwt_expiration(), Duration::from_secs(1800));
    }

    #[test]
    fn master_key_prefix_is_short() {
        let settings = Settings {
            master_key: "a".repeat(128),
            ..Settings::default()
        };
        assert_eq!(settings.master_key_prefix().len(), 8);
    }
}
