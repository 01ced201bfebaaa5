use crate::file::write_rename;
use crate::tpm::pcr::PcrSelection;
use crate::tpm::{Tpm, TpmError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the snapshot inside the status directory.
pub const SNAPSHOT_FILE_NAME: &str = "sealingpcrs";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("PCR snapshot {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("malformed PCR snapshot: {0}")]
    Encoding(#[from] serde_yaml::Error),
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error("saved PCR index {index} doesn't exist in the run-time PCR list {selection}")]
    MissingLivePcr { index: u8, selection: PcrSelection },
    #[error("PCR snapshot was taken from the {saved} bank, run-time PCR list is {selection}")]
    BankMismatch {
        saved: String,
        selection: PcrSelection,
    },
}

pub type Result<T, E = SnapshotError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PcrValue(#[serde(with = "hex::serde")] pub Vec<u8>);

/// PCR values recorded when the vault key was sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrSnapshot {
    pub bank: String,
    pub pcrs: BTreeMap<u8, PcrValue>,
}

/// Reads the selected PCRs one at a time. A single TPM2_PCR_Read returns at
/// most eight digests.
pub fn read_pcrs(
    tpm: &mut dyn Tpm,
    selection: &PcrSelection,
) -> Result<BTreeMap<u8, Vec<u8>>, TpmError> {
    selection
        .pcrs()
        .iter()
        .map(|&pcr| Ok((pcr, tpm.read_pcr(selection.bank(), pcr)?)))
        .collect()
}

impl PcrSnapshot {
    pub fn capture(tpm: &mut dyn Tpm, selection: &PcrSelection) -> Result<Self, TpmError> {
        let pcrs = read_pcrs(tpm, selection)?
            .into_iter()
            .map(|(pcr, value)| (pcr, PcrValue(value)))
            .collect();
        Ok(Self {
            bank: selection.bank_name().to_owned(),
            pcrs,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read(path).map_err(|source| SnapshotError::Io {
            path: path.to_owned(),
            source,
        })?;
        Ok(serde_yaml::from_slice(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        write_rename(path, content.as_bytes()).map_err(|source| SnapshotError::Io {
            path: path.to_owned(),
            source,
        })
    }

    /// Indices whose live value differs from the recorded one, ascending.
    pub fn mismatches(
        &self,
        live: &BTreeMap<u8, Vec<u8>>,
        selection: &PcrSelection,
    ) -> Result<Vec<u8>> {
        if self.bank != selection.bank_name() {
            return Err(SnapshotError::BankMismatch {
                saved: self.bank.clone(),
                selection: selection.clone(),
            });
        }
        let mut mismatch = Vec::new();
        for (&index, saved) in &self.pcrs {
            // only possible when the sealing PCR set changed since sealing
            let current = live.get(&index).ok_or_else(|| SnapshotError::MissingLivePcr {
                index,
                selection: selection.clone(),
            })?;
            if current != &saved.0 {
                mismatch.push(index);
            }
        }
        Ok(mismatch)
    }
}

/// Replaces the snapshot at `path` with the current PCR values.
pub fn save(tpm: &mut dyn Tpm, path: &Path, selection: &PcrSelection) -> Result<()> {
    let snapshot = PcrSnapshot::capture(tpm, selection)?;
    snapshot.save(path)?;
    log::debug!("saved snapshot of PCRs {} to {}", selection, path.display());
    Ok(())
}

/// Lists the PCRs that changed since the snapshot at `path` was taken.
pub fn diagnose(tpm: &mut dyn Tpm, path: &Path, selection: &PcrSelection) -> Result<Vec<u8>> {
    let snapshot = PcrSnapshot::load(path)?;
    let live = read_pcrs(tpm, selection)?;
    snapshot.mismatches(&live, selection)
}
