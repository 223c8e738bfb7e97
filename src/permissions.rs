//! Runtime permission checks
//!
//! Location access and storage write access are checked before the
//! sources are registered and before each CSV append.

use std::path::{Path, PathBuf};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    FineLocation,
    StorageWrite,
}

impl Permission {
    pub fn name(&self) -> &'static str {
        match self {
            Permission::FineLocation => "location",
            Permission::StorageWrite => "storage",
        }
    }
}

pub trait PermissionGate: Send {
    fn has(&self, permission: Permission) -> bool;

    /// Ask for a permission. Never blocks; a grant only shows up on a
    /// later `has` call.
    fn request(&mut self, permission: Permission);
}

/// Permissions granted through the `[permissions]` config section.
///
/// A request re-reads that section, so editing the config file grants
/// access without a restart.
#[derive(Debug, Clone)]
pub struct ConfigPermissions {
    location: bool,
    storage: bool,
    output_dir: PathBuf,
    config_path: Option<PathBuf>,
}

impl ConfigPermissions {
    pub fn from_config(config: &Config) -> Self {
        Self::with_config_path(config, Config::path())
    }

    pub fn with_config_path(config: &Config, config_path: Option<PathBuf>) -> Self {
        Self {
            location: config.permissions.location,
            storage: config.permissions.storage,
            output_dir: config.output_dir(),
            config_path,
        }
    }

    fn reload(&mut self) {
        let Some(path) = self.config_path.as_deref() else {
            return;
        };
        let permissions = Config::load_from(path).permissions;
        self.location = permissions.location;
        self.storage = permissions.storage;
    }
}

fn dir_is_writable(dir: &Path) -> bool {
    match std::fs::metadata(dir) {
        Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
        Err(_) => false,
    }
}

impl PermissionGate for ConfigPermissions {
    fn has(&self, permission: Permission) -> bool {
        match permission {
            Permission::FineLocation => self.location,
            Permission::StorageWrite => self.storage && dir_is_writable(&self.output_dir),
        }
    }

    fn request(&mut self, permission: Permission) {
        self.reload();
        if self.has(permission) {
            tracing::info!("{} permission granted", permission.name());
            return;
        }

        match permission {
            Permission::StorageWrite if self.storage => {
                tracing::warn!(
                    "Storage permission requested but {:?} is missing or read-only",
                    self.output_dir
                );
            }
            _ => {
                tracing::warn!(
                    "{} permission requested; set `{} = true` under [permissions] in {:?}",
                    permission.name(),
                    permission.name(),
                    self.config_path.as_deref().unwrap_or(Path::new("config.toml"))
                );
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config_for(dir: &Path) -> Config {
        let mut config = Config::default();
        config.output.dir = Some(dir.to_path_buf());
        config
    }

    #[test]
    fn test_storage_requires_existing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = ConfigPermissions::with_config_path(&config_for(tmp.path()), None);
        assert!(gate.has(Permission::StorageWrite));

        let gate =
            ConfigPermissions::with_config_path(&config_for(&tmp.path().join("missing")), None);
        assert!(!gate.has(Permission::StorageWrite));
    }

    #[test]
    fn test_config_revokes_permissions() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config_for(tmp.path());
        config.permissions.location = false;
        config.permissions.storage = false;

        let gate = ConfigPermissions::with_config_path(&config, None);
        assert!(!gate.has(Permission::FineLocation));
        assert!(!gate.has(Permission::StorageWrite));
    }

    #[test]
    fn test_request_picks_up_config_edit() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.toml");
        fs::write(&config_path, "[permissions]\nlocation = false\n").unwrap();

        let config = Config::load_from(&config_path);
        let mut gate = ConfigPermissions::with_config_path(&config, Some(config_path.clone()));
        assert!(!gate.has(Permission::FineLocation));

        // Still denied: nothing changed
        gate.request(Permission::FineLocation);
        assert!(!gate.has(Permission::FineLocation));

        fs::write(&config_path, "[permissions]\nlocation = true\n").unwrap();
        gate.request(Permission::FineLocation);
        assert!(gate.has(Permission::FineLocation));
    }
}
