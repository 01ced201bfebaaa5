//! Sealing and unsealing of the vault key against a PCR policy. The sealed
//! object's private and public areas are kept in NV storage, so the key
//! survives without anything on disk but the diagnostic evidence.

use crate::eventlog::{ArchiveError, LogRole, MeasurementLogs};
use crate::snapshot::{self, SnapshotError, SNAPSHOT_FILE_NAME};
use crate::tpm::pcr::PcrSelection;
use crate::tpm::{Flushed, NvIndex, SealedBlob, Tpm, TpmError, Undefined};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Where the diagnostic artifacts of seal and unseal go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    snapshot: PathBuf,
    logs: MeasurementLogs,
}

impl Evidence {
    pub fn new(status_dir: impl Into<PathBuf>, securityfs: impl Into<PathBuf>) -> Self {
        let status_dir = status_dir.into();
        Self {
            snapshot: status_dir.join(SNAPSHOT_FILE_NAME),
            logs: MeasurementLogs::new(securityfs, status_dir),
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot
    }

    pub fn logs(&self) -> &MeasurementLogs {
        &self.logs
    }
}

#[derive(Error, Debug)]
pub enum SealError {
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error("saving the sealing PCR snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Unseal(#[from] Box<UnsealFailure>),
}

pub type Result<T, E = SealError> = core::result::Result<T, E>;

#[derive(Debug)]
pub enum LogCopy {
    Copied,
    Failed(ArchiveError),
}

impl fmt::Display for LogCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copied => write!(f, "measurement log copied"),
            Self::Failed(err) => write!(f, "copying measurement log failed: {}", err),
        }
    }
}

#[derive(Debug)]
pub enum Diagnosis {
    /// PCRs whose value differs from the sealing snapshot. Empty means the
    /// measurements are unchanged and the cause lies elsewhere.
    Mismatch(Vec<u8>),
    Failed(SnapshotError),
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch(pcrs) if pcrs.is_empty() => {
                write!(f, "PCR values match the sealing snapshot")
            }
            Self::Mismatch(pcrs) => write!(f, "mismatching PCR indexes {:?}", pcrs),
            Self::Failed(err) => write!(f, "finding mismatching PCRs failed: {}", err),
        }
    }
}

/// An unseal that reached the TPM and failed, with what was collected to
/// explain it.
#[derive(Error, Debug)]
#[error("unsealing the vault key failed: {source} ({log_copy}, {diagnosis})")]
pub struct UnsealFailure {
    pub source: TpmError,
    pub log_copy: LogCopy,
    pub diagnosis: Diagnosis,
}

impl UnsealFailure {
    pub fn mismatching_pcrs(&self) -> Option<&[u8]> {
        match &self.diagnosis {
            Diagnosis::Mismatch(pcrs) => Some(pcrs),
            Diagnosis::Failed(_) => None,
        }
    }

    /// The measured boot chain changed since sealing.
    pub fn is_measurement_change(&self) -> bool {
        self.mismatching_pcrs().map_or(false, |pcrs| !pcrs.is_empty())
    }
}

/// Seals `secret` to the current values of `selection` and replaces any
/// previously sealed key.
pub fn seal(
    tpm: &mut dyn Tpm,
    secret: &[u8],
    selection: &PcrSelection,
    evidence: &Evidence,
) -> Result<()> {
    for index in [NvIndex::SealedPublic, NvIndex::SealedPrivate] {
        if tpm.nv_undefine(index)? == Undefined::Removed {
            log::debug!("removed previous {}", index);
        }
    }

    // only the digest is needed, the session itself authorizes nothing
    let (session, policy) = tpm.policy_session(selection)?;
    tpm.flush(session)?;

    let blob = tpm.create_sealed(&policy, secret)?;
    // the private half goes last, its presence marks a complete seal
    store(tpm, NvIndex::SealedPublic, &blob.public)?;
    store(tpm, NvIndex::SealedPrivate, &blob.private)?;

    snapshot::save(tpm, evidence.snapshot_path(), selection)?;
    if let Err(err) = evidence.logs().refresh_after_seal() {
        log::warn!("archiving measurement logs after seal failed: {}", err);
    }
    log::info!("sealed vault key to PCRs {}", selection);
    Ok(())
}

fn store(tpm: &mut dyn Tpm, index: NvIndex, data: &[u8]) -> Result<(), TpmError> {
    tpm.nv_define(index, data.len())?;
    tpm.nv_write(index, data)
}

/// Unseals the key sealed by [`seal`]. When the TPM refuses, the current
/// measurement log is kept and the PCRs are compared with the sealing
/// snapshot before the error is returned.
pub fn unseal(tpm: &mut dyn Tpm, selection: &PcrSelection, evidence: &Evidence) -> Result<Vec<u8>> {
    let blob = SealedBlob {
        private: tpm.nv_read(NvIndex::SealedPrivate)?,
        public: tpm.nv_read(NvIndex::SealedPublic)?,
    };
    let object = tpm.load_sealed(&blob)?;
    let mut tpm = Flushed::new(tpm, object);
    let (session, _) = tpm.policy_session(selection)?;
    let mut tpm = Flushed::new(&mut *tpm, session);

    let source = match tpm.unseal(session, object) {
        Ok(secret) => return Ok(secret),
        Err(err) => err,
    };
    log::error!("unsealing the vault key failed: {}", source);

    let log_copy = match evidence.logs().copy(LogRole::UnsealFailure) {
        Ok(()) => LogCopy::Copied,
        Err(err) => {
            log::warn!("copying measurement log after failed unseal failed: {}", err);
            LogCopy::Failed(err)
        }
    };
    let diagnosis = match snapshot::diagnose(&mut *tpm, evidence.snapshot_path(), selection) {
        Ok(pcrs) => Diagnosis::Mismatch(pcrs),
        Err(err) => Diagnosis::Failed(err),
    };
    let failure = UnsealFailure {
        source,
        log_copy,
        diagnosis,
    };
    log::error!("{}", failure.diagnosis);
    Err(Box::new(failure).into())
}
