use crate::eventlog::DEFAULT_SECURITYFS;
use crate::seal::Evidence;
use crate::tpm::device::{DeviceConnector, DEFAULT_DEVICE_PATH, DEFAULT_TCTI};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_STATUS_DIR: &str = "/persist/status";
/// Longest owner credential the provisioning tooling ever wrote.
pub const MAX_OWNER_CREDENTIAL_LEN: usize = 7;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("parsing config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// TPM device in TCTI format
    pub tcti: String,
    /// Device node whose existence means a TPM is installed
    pub device_path: PathBuf,
    pub securityfs: PathBuf,
    /// Where the PCR snapshot and measurement log copies are kept
    pub status_dir: PathBuf,
    /// File holding the owner hierarchy password
    pub owner_credential: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcti: DEFAULT_TCTI.into(),
            device_path: DEFAULT_DEVICE_PATH.into(),
            securityfs: DEFAULT_SECURITYFS.into(),
            status_dir: DEFAULT_STATUS_DIR.into(),
            owner_credential: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Reads the owner credential file, if one is configured. Only the first
    /// [`MAX_OWNER_CREDENTIAL_LEN`] bytes are the credential.
    pub fn owner_credential(&self) -> Result<Option<String>> {
        let Some(path) = &self.owner_credential else {
            return Ok(None);
        };
        let mut credential = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut end = credential.len().min(MAX_OWNER_CREDENTIAL_LEN);
        while !credential.is_char_boundary(end) {
            end -= 1;
        }
        credential.truncate(end);
        Ok(Some(credential))
    }

    pub fn connector(&self) -> Result<DeviceConnector> {
        Ok(DeviceConnector::new(&self.tcti, &self.device_path)
            .with_owner_auth(self.owner_credential()?))
    }

    pub fn evidence(&self) -> Evidence {
        Evidence::new(&self.status_dir, &self.securityfs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn empty_config_uses_defaults() -> Result<()> {
        assert_eq!(Config::from_yaml("{}")?, Config::default());
        Ok(())
    }

    #[test]
    fn partial_config_overrides_fields() -> Result<()> {
        let config = Config::from_yaml(
            "tcti: mssim:host=localhost,port=2321\nstatus_dir: /var/lib/vault\n",
        )?;
        assert_eq!(config.tcti, "mssim:host=localhost,port=2321");
        assert_eq!(config.status_dir, Path::new("/var/lib/vault"));
        assert_eq!(config.device_path, Path::new(DEFAULT_DEVICE_PATH));
        assert_eq!(
            config.evidence().snapshot_path(),
            Path::new("/var/lib/vault/sealingpcrs")
        );
        Ok(())
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            Config::from_yaml("tcit: device:/dev/tpm0\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn owner_credential_is_truncated() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("owner");
        fs::write(&path, "s3cr3tpassword")?;
        let config = Config {
            owner_credential: Some(path),
            ..Config::default()
        };
        assert_eq!(config.owner_credential()?.as_deref(), Some("s3cr3tp"));
        assert_eq!(Config::default().owner_credential()?, None);
        Ok(())
    }

    #[test]
    fn missing_owner_credential_file_fails() {
        let config = Config {
            owner_credential: Some("/nonexistent/owner".into()),
            ..Config::default()
        };
        assert!(matches!(
            config.connector(),
            Err(ConfigError::Io { .. })
        ));
    }
}
