//! Lifecycle of the vault key: generated on first boot, migrated from the
//! legacy plain NV copy, and from then on only released by the TPM when the
//! measured boot chain matches the one it was sealed to.

use crate::seal::{self, Evidence, SealError};
use crate::tpm::pcr::PcrSelection;
use crate::tpm::{with_session, Connect, NvIndex, Tpm, TpmError, Undefined};
use std::fmt;
use thiserror::Error;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;

pub const VAULT_KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error(transparent)]
    Seal(#[from] SealError),
    #[error("vault key is {0} bytes long, expected {}", VAULT_KEY_LEN)]
    KeyLength(usize),
    #[error("unsealed key differs from the key that was sealed")]
    KeyMismatch,
}

pub type Result<T, E = VaultError> = core::result::Result<T, E>;

#[derive(Clone, PartialEq, Eq)]
pub struct VaultKey([u8; VAULT_KEY_LEN]);

impl VaultKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key = bytes
            .try_into()
            .map_err(|_| VaultError::KeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; VAULT_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey(..)")
    }
}

/// How the sealed key relates to the legacy copy, for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealedKeyRelationship {
    Unknown,
    Reused,
    New,
    Unprotected,
}

impl fmt::Display for SealedKeyRelationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "sealed key relationship to legacy key is unknown",
            Self::Reused => "sealed key is the migrated legacy key",
            Self::New => "sealed key is newly generated",
            Self::Unprotected => "no sealed key, vault key is unprotected",
        })
    }
}

/// What the TPM can do, probed once and then passed around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub device_present: bool,
    pub sha256_bank: bool,
}

impl Capabilities {
    /// Only an unallocated SHA-256 bank selects legacy mode. Any other
    /// failure is returned, the caller can't tell what the TPM supports.
    pub fn probe<C: Connect + ?Sized>(connector: &C) -> Result<Self, TpmError> {
        if !connector.is_present() {
            return Ok(Self {
                device_present: false,
                sha256_bank: false,
            });
        }
        let sha256_bank =
            match with_session(connector, |tpm| tpm.read_pcr(HashingAlgorithm::Sha256, 0)) {
                Ok(_) => true,
                Err(TpmError::BankUnallocated(bank)) => {
                    log::info!("PCR bank {} is not allocated", bank);
                    false
                }
                Err(err) => return Err(err),
            };
        Ok(Self {
            device_present: true,
            sha256_bank,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    NoKey,
    LegacyOnly,
    Sealed,
}

pub struct VaultKeyManager<C> {
    connector: C,
    capabilities: Capabilities,
    selection: PcrSelection,
    evidence: Evidence,
}

impl<C: Connect> VaultKeyManager<C> {
    pub fn new(
        connector: C,
        capabilities: Capabilities,
        selection: PcrSelection,
        evidence: Evidence,
    ) -> Self {
        Self {
            connector,
            capabilities,
            selection,
            evidence,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn reprobe(&mut self) -> Result<Capabilities, TpmError> {
        self.capabilities = Capabilities::probe(&self.connector)?;
        Ok(self.capabilities)
    }

    /// Returns the vault key, creating or migrating it first if needed.
    ///
    /// Once a sealed key exists it is the only source: a failed unseal is
    /// returned as is and never falls back to the legacy copy.
    pub fn fetch_vault_key(&self) -> Result<VaultKey> {
        if !self.capabilities.device_present {
            return Err(TpmError::DeviceUnavailable("no TPM device found".into()).into());
        }
        if !self.capabilities.sha256_bank {
            log::info!("SHA-256 PCR bank not available, using the legacy vault key");
            return self.fetch_legacy_key();
        }

        with_session(&self.connector, |tpm| match key_state(tpm)? {
            KeyState::NoKey => {
                log::info!("no vault key found, generating a new one");
                let key = VaultKey::from_slice(&tpm.get_random(VAULT_KEY_LEN)?)?;
                self.seal_and_verify(tpm, &key)?;
                log::info!("generated and sealed a new vault key");
                Ok(key)
            }
            KeyState::LegacyOnly => {
                log::info!("migrating the legacy vault key to a sealed key");
                let key = VaultKey::from_slice(&tpm.nv_read(NvIndex::LegacyKey)?)?;
                self.seal_and_verify(tpm, &key)?;
                log::info!("sealed the legacy vault key");
                Ok(key)
            }
            KeyState::Sealed => {
                let key = seal::unseal(tpm, &self.selection, &self.evidence)?;
                log::info!("unsealed the vault key");
                VaultKey::from_slice(&key)
            }
        })
    }

    /// Compares the sealed key with the legacy copy. Never fails, anything
    /// that can't be established is `Unknown`.
    pub fn sealed_key_relationship(&self) -> SealedKeyRelationship {
        if !self.capabilities.device_present {
            return SealedKeyRelationship::Unprotected;
        }
        let result = with_session(&self.connector, |tpm| {
            if !is_sealed(tpm)? {
                return Ok(SealedKeyRelationship::Unprotected);
            }
            let legacy = match tpm.nv_read(NvIndex::LegacyKey) {
                Ok(legacy) => legacy,
                Err(err) => {
                    log::debug!("no legacy key to compare with: {}", err);
                    return Ok(SealedKeyRelationship::New);
                }
            };
            Ok::<_, VaultError>(match seal::unseal(tpm, &self.selection, &self.evidence) {
                Ok(sealed) if sealed == legacy => SealedKeyRelationship::Reused,
                Ok(_) => SealedKeyRelationship::New,
                Err(err) => {
                    log::debug!("can't unseal to compare keys: {}", err);
                    SealedKeyRelationship::Unknown
                }
            })
        });
        result.unwrap_or_else(|err| {
            log::warn!("determining sealed key relationship failed: {}", err);
            SealedKeyRelationship::Unknown
        })
    }

    /// Removes the sealed key. The legacy copy and the evidence files stay.
    pub fn wipe_sealed_key(&self) -> Result<()> {
        with_session(&self.connector, |tpm| {
            for index in [NvIndex::SealedPublic, NvIndex::SealedPrivate] {
                match tpm.nv_undefine(index)? {
                    Undefined::Removed => log::info!("removed {}", index),
                    Undefined::AlreadyAbsent => log::debug!("{} was not defined", index),
                }
            }
            Ok(())
        })
    }

    fn fetch_legacy_key(&self) -> Result<VaultKey> {
        with_session(&self.connector, |tpm| {
            match tpm.nv_read(NvIndex::LegacyKey) {
                Ok(key) => {
                    log::info!("read the legacy vault key");
                    return VaultKey::from_slice(&key);
                }
                Err(err) if err.is_absent() => {
                    log::info!("no legacy vault key found, generating a new one")
                }
                Err(err) => return Err(err.into()),
            }
            let key = VaultKey::from_slice(&tpm.get_random(VAULT_KEY_LEN)?)?;
            tpm.nv_undefine(NvIndex::LegacyKey)?;
            tpm.nv_define(NvIndex::LegacyKey, VAULT_KEY_LEN)?;
            tpm.nv_write(NvIndex::LegacyKey, key.as_bytes())?;
            Ok(key)
        })
    }

    /// Seals `key` and reads it back, so a key that can't be unsealed is
    /// never handed out.
    fn seal_and_verify(&self, tpm: &mut dyn Tpm, key: &VaultKey) -> Result<()> {
        seal::seal(tpm, key.as_bytes(), &self.selection, &self.evidence)?;
        let unsealed = seal::unseal(tpm, &self.selection, &self.evidence)?;
        if unsealed != key.as_bytes() {
            return Err(VaultError::KeyMismatch);
        }
        Ok(())
    }
}

fn is_defined(tpm: &mut dyn Tpm, index: NvIndex) -> Result<bool, TpmError> {
    match tpm.nv_read(index) {
        Ok(_) => Ok(true),
        Err(err) if err.is_absent() => Ok(false),
        Err(err) => Err(err),
    }
}

/// Both halves of the sealed object are stored. A lone half is what an
/// interrupted seal leaves behind; the next seal removes it.
fn is_sealed(tpm: &mut dyn Tpm) -> Result<bool, TpmError> {
    let private = is_defined(tpm, NvIndex::SealedPrivate)?;
    let public = is_defined(tpm, NvIndex::SealedPublic)?;
    if private != public {
        log::warn!("found an incomplete sealed key, it will be replaced");
    }
    Ok(private && public)
}

fn key_state(tpm: &mut dyn Tpm) -> Result<KeyState, TpmError> {
    if is_sealed(tpm)? {
        return Ok(KeyState::Sealed);
    }
    if is_defined(tpm, NvIndex::LegacyKey)? {
        return Ok(KeyState::LegacyOnly);
    }
    Ok(KeyState::NoKey)
}
