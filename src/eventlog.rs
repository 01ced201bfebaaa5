//! Keeps copies of the firmware measurement logs next to the sealing
//! snapshot: the log from the boot that sealed the key, the log from a boot
//! that failed to unseal it, and one previous pair of each.

use crate::file::write_rename;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_SECURITYFS: &str = "/sys/kernel/security";
pub const MEASUREMENT_LOG_FILE: &str = "binary_bios_measurements";
const BACKUP_SUFFIX: &str = "-backup";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("no TPM found under {0}")]
    NoDevices(PathBuf),
    #[error("enumerating TPMs under {path} failed: {source}")]
    Enumerate { path: PathBuf, source: io::Error },
    #[error("failed to {operation} {failed} TPM measurement log(s)")]
    PartialIo {
        operation: &'static str,
        failed: usize,
    },
}

pub type Result<T, E = ArchiveError> = core::result::Result<T, E>;

/// Which boot a log copy documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRole {
    SealSuccess,
    UnsealFailure,
}

impl LogRole {
    fn file_prefix(self) -> &'static str {
        match self {
            Self::SealSuccess => "tpm_measurement_seal_success",
            Self::UnsealFailure => "tpm_measurement_unseal_fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementLogs {
    securityfs: PathBuf,
    status_dir: PathBuf,
}

impl MeasurementLogs {
    pub fn new(securityfs: impl Into<PathBuf>, status_dir: impl Into<PathBuf>) -> Self {
        Self {
            securityfs: securityfs.into(),
            status_dir: status_dir.into(),
        }
    }

    /// The `tpm*` directories under securityfs, in name order. A device's
    /// position in this list is its index in the copy names.
    pub fn devices(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.securityfs).map_err(|source| ArchiveError::Enumerate {
            path: self.securityfs.clone(),
            source,
        })?;
        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ArchiveError::Enumerate {
                path: self.securityfs.clone(),
                source,
            })?;
            if entry.file_name().to_string_lossy().starts_with("tpm") {
                devices.push(entry.path());
            }
        }
        if devices.is_empty() {
            return Err(ArchiveError::NoDevices(self.securityfs.clone()));
        }
        devices.sort();
        Ok(devices)
    }

    pub fn copy_path(&self, role: LogRole, device: usize) -> PathBuf {
        self.status_dir
            .join(format!("{}-tpm{}", role.file_prefix(), device))
    }

    pub fn backup_path(&self, role: LogRole, device: usize) -> PathBuf {
        with_backup_suffix(&self.copy_path(role, device))
    }

    /// Moves each device's current pair of copies over its backup pair.
    /// Devices with only one current copy are left alone, a lone copy is
    /// not evidence of a complete seal/unseal cycle.
    pub fn rotate(&self) -> Result<()> {
        let devices = self.devices()?;
        partial("back up", self.rotate_pairs(devices.len()).len())
    }

    /// Deletes the current copies of both roles.
    pub fn remove_current(&self) -> Result<()> {
        let devices = self.devices()?;
        partial("remove", self.remove_copies(devices.len(), &[]))
    }

    /// Copies each device's live log to its `role` copy. Devices without a
    /// log are skipped.
    pub fn copy(&self, role: LogRole) -> Result<()> {
        let devices = self.devices()?;
        partial("copy", self.copy_logs(&devices, role, &[]))
    }

    /// Run after a successful seal: keep the last pair as backup and start a
    /// new history with this boot's log. A device whose pair could not be
    /// backed up keeps it as current; every other device is refreshed.
    pub fn refresh_after_seal(&self) -> Result<()> {
        let devices = self.devices()?;
        let stuck = self.rotate_pairs(devices.len());
        let failed = stuck.len()
            + self.remove_copies(devices.len(), &stuck)
            + self.copy_logs(&devices, LogRole::SealSuccess, &stuck);
        partial("refresh", failed)
    }

    /// Returns the devices whose pair is still current after a failure.
    fn rotate_pairs(&self, count: usize) -> Vec<usize> {
        let mut stuck = Vec::new();
        for device in 0..count {
            let sealed = self.copy_path(LogRole::SealSuccess, device);
            let unsealed = self.copy_path(LogRole::UnsealFailure, device);
            if !sealed.exists() || !unsealed.exists() {
                continue;
            }
            let sealed_backup = with_backup_suffix(&sealed);
            let unsealed_backup = with_backup_suffix(&unsealed);

            if let Err(err) = fs::rename(&sealed, &sealed_backup) {
                log::warn!("backing up {} failed: {}", sealed.display(), err);
                stuck.push(device);
                continue;
            }
            if let Err(err) = fs::rename(&unsealed, &unsealed_backup) {
                log::warn!("backing up {} failed: {}", unsealed.display(), err);
                // keep the pair together
                if let Err(err) = fs::rename(&sealed_backup, &sealed) {
                    log::warn!("restoring {} failed: {}", sealed.display(), err);
                }
                stuck.push(device);
                continue;
            }
            log::debug!("backed up measurement log pair of tpm{}", device);
        }
        stuck
    }

    fn remove_copies(&self, count: usize, skip: &[usize]) -> usize {
        let mut failed = 0;
        for device in (0..count).filter(|device| !skip.contains(device)) {
            for role in [LogRole::SealSuccess, LogRole::UnsealFailure] {
                let path = self.copy_path(role, device);
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        log::warn!("removing {} failed: {}", path.display(), err);
                        failed += 1;
                    }
                }
            }
        }
        failed
    }

    fn copy_logs(&self, devices: &[PathBuf], role: LogRole, skip: &[usize]) -> usize {
        let mut failed = 0;
        for (device, dir) in devices.iter().enumerate() {
            if skip.contains(&device) {
                continue;
            }
            let source = dir.join(MEASUREMENT_LOG_FILE);
            if !source.exists() {
                log::debug!("{} has no measurement log", dir.display());
                continue;
            }
            let destination = self.copy_path(role, device);
            if let Err(err) = fs::read(&source).and_then(|log| write_rename(&destination, &log)) {
                log::warn!(
                    "copying {} to {} failed: {}",
                    source.display(),
                    destination.display(),
                    err
                );
                failed += 1;
            }
        }
        failed
    }
}

fn with_backup_suffix(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

fn partial(operation: &'static str, failed: usize) -> Result<()> {
    if failed == 0 {
        Ok(())
    } else {
        Err(ArchiveError::PartialIo { operation, failed })
    }
}
