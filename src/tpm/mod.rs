use self::pcr::{PcrError, PcrSelection};
use ambassador::{delegatable_trait, Delegate};
use std::fmt;
use std::ops::{Deref, DerefMut};
use thiserror::Error;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::constants::response_code::Tss2ResponseCode;

pub mod device;
pub mod pcr;
#[cfg(test)]
pub(crate) mod sim;

/// Persistent handle of the storage root key the sealed object lives under.
pub const SRK_HANDLE: u32 = 0x8100_0002;

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("TPM device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("TPM rejected the authorization value")]
    AuthFailure,
    #[error("TPM policy check failed")]
    PolicyFail,
    #[error("malformed TPM response: {0}")]
    Protocol(String),
    #[error("PCR bank {0} is not allocated")]
    BankUnallocated(&'static str),
    #[error("NV index {index}: {fault}")]
    Storage { index: NvIndex, fault: StorageFault },
    #[error("failed to create auth session")]
    AuthSessionCreate,
    #[error(transparent)]
    TssEsapi(tss_esapi::Error),
    #[error(transparent)]
    PcrError(#[from] PcrError),
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

impl TpmError {
    pub fn storage(index: NvIndex, fault: StorageFault) -> Self {
        Self::Storage { index, fault }
    }

    /// True when the error only says the NV index does not exist.
    pub fn is_undefined(&self) -> bool {
        matches!(
            self,
            Self::Storage {
                fault: StorageFault::Undefined,
                ..
            }
        )
    }

    /// Undefined, or defined but never written: either way there is no key.
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            Self::Storage {
                fault: StorageFault::Undefined | StorageFault::Uninitialized,
                ..
            }
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageFault {
    #[error("index is not defined")]
    Undefined,
    #[error("index is defined but was never written")]
    Uninitialized,
    #[error("index is defined with {defined} bytes, {requested} requested")]
    SizeMismatch { defined: usize, requested: usize },
    #[error("index contents are malformed: {0}")]
    Malformed(String),
    #[error("TPM rejected the NV operation (rc {0:#x})")]
    Rejected(u32),
}

/// Well known NV indices, one per role. They share the TPM's global NV
/// namespace with every other consumer of the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NvIndex {
    OwnerCredential,
    LegacyKey,
    SealedPrivate,
    SealedPublic,
}

impl NvIndex {
    pub const fn handle(self) -> u32 {
        match self {
            Self::OwnerCredential => 0x0160_0000,
            Self::LegacyKey => 0x0170_0000,
            Self::SealedPrivate => 0x0180_0000,
            Self::SealedPublic => 0x0190_0000,
        }
    }

    fn role(self) -> &'static str {
        match self {
            Self::OwnerCredential => "owner credential",
            Self::LegacyKey => "legacy key",
            Self::SealedPrivate => "sealed private",
            Self::SealedPublic => "sealed public",
        }
    }
}

impl fmt::Display for NvIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#010x})", self.role(), self.handle())
    }
}

/// Outcome of a best-effort NV undefine. Hard failures are the `Err` side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Undefined {
    Removed,
    AlreadyAbsent,
}

/// A transient TPM object or session, valid only within the session that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// The two halves produced by TPM2_Create for a sealed data object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlob {
    pub private: Vec<u8>,
    pub public: Vec<u8>,
}

/// Primitives available on an open TPM session.
#[delegatable_trait]
pub trait Tpm {
    fn nv_undefine(&mut self, index: NvIndex) -> Result<Undefined>;
    fn nv_define(&mut self, index: NvIndex, size: usize) -> Result<()>;
    fn nv_write(&mut self, index: NvIndex, data: &[u8]) -> Result<()>;
    fn nv_read(&mut self, index: NvIndex) -> Result<Vec<u8>>;
    fn read_pcr(&mut self, bank: HashingAlgorithm, pcr: u8) -> Result<Vec<u8>>;
    /// Starts a policy session asserting PolicyPCR over `selection` and
    /// returns it with its current policy digest.
    fn policy_session(&mut self, selection: &PcrSelection) -> Result<(Handle, Vec<u8>)>;
    /// Seals `secret` under the SRK with `policy` as the only way to authorize
    /// unsealing.
    fn create_sealed(&mut self, policy: &[u8], secret: &[u8]) -> Result<SealedBlob>;
    fn load_sealed(&mut self, blob: &SealedBlob) -> Result<Handle>;
    fn unseal(&mut self, session: Handle, object: Handle) -> Result<Vec<u8>>;
    /// Releases a session or object. Unknown handles are ignored.
    fn flush(&mut self, handle: Handle) -> Result<()>;
    fn flush_transient(&mut self) -> Result<()>;
    fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>>;
}

/// Opens connections to a TPM.
pub trait Connect {
    type Module: Tpm;

    /// Cheap presence probe, no TPM command is issued.
    fn is_present(&self) -> bool;
    fn connect(&self) -> Result<Self::Module>;
}

/// An exclusive connection to the TPM. Anything transient left behind is
/// flushed when the session goes away.
#[derive(Delegate)]
#[delegate(Tpm, target = "module")]
pub struct Session<M: Tpm> {
    module: M,
}

impl<M: Tpm> Session<M> {
    pub fn open<C: Connect<Module = M> + ?Sized>(connector: &C) -> Result<Self> {
        if !connector.is_present() {
            return Err(TpmError::DeviceUnavailable("no TPM device found".into()));
        }
        let module = connector.connect()?;
        log::debug!("opened TPM session");
        Ok(Self { module })
    }
}

impl<M: Tpm> Drop for Session<M> {
    fn drop(&mut self) {
        if let Err(err) = self.module.flush_transient() {
            log::debug!("flushing transient handles on close failed: {}", err);
        }
    }
}

/// Runs `f` on a fresh session, which is closed before this returns on every
/// path including unwinding.
pub fn with_session<C, T, E, F>(connector: &C, f: F) -> core::result::Result<T, E>
where
    C: Connect + ?Sized,
    E: From<TpmError>,
    F: FnOnce(&mut dyn Tpm) -> core::result::Result<T, E>,
{
    let mut session = Session::open(connector)?;
    f(&mut session)
}

/// Flushes its handle when dropped. Derefs to the TPM so further commands
/// can be issued while the handle is alive.
pub struct Flushed<'a> {
    tpm: &'a mut dyn Tpm,
    handle: Handle,
}

impl<'a> Flushed<'a> {
    pub fn new(tpm: &'a mut dyn Tpm, handle: Handle) -> Self {
        Self { tpm, handle }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }
}

impl<'a> Deref for Flushed<'a> {
    type Target = dyn Tpm + 'a;
    fn deref(&self) -> &Self::Target {
        &*self.tpm
    }
}

impl<'a> DerefMut for Flushed<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.tpm
    }
}

impl Drop for Flushed<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.tpm.flush(self.handle) {
            log::warn!("failed to flush TPM handle {}: {}", self.handle, err);
        }
    }
}

const TSS2_RC_LAYER_MASK: u32 = 0x00ff_0000;
const TSS2_TPM_RC_LAYER: u32 = 0;
const TSS2_TCTI_RC_LAYER: u32 = 10 << 16;
const TSS2_RESMGR_RC_LAYER: u32 = 12 << 16;
const TSS2_RESMGR_TPM_RC_LAYER: u32 = 11 << 16;

const TPM2_RC_FMT1: u32 = 0x080;
const TPM2_RC_FMT1_ERROR_MASK: u32 = 0x03f;
const TPM2_RC_FMT0_MASK: u32 = 0x9ff;

/// Coarse classification of a raw TSS2 return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCodeClass {
    DeviceUnavailable,
    AuthFailure,
    PolicyFail,
    Handle,
    NvUninitialized,
    NvDefined,
    NvSize,
    Other,
}

pub fn classify_return_code(rc: u32) -> ReturnCodeClass {
    let layer = rc & TSS2_RC_LAYER_MASK;
    if layer == TSS2_TCTI_RC_LAYER || layer == TSS2_RESMGR_RC_LAYER {
        return ReturnCodeClass::DeviceUnavailable;
    }
    if layer != TSS2_TPM_RC_LAYER && layer != TSS2_RESMGR_TPM_RC_LAYER {
        return ReturnCodeClass::Other;
    }
    let code = rc & 0xffff;
    if code & TPM2_RC_FMT1 != 0 {
        return match code & TPM2_RC_FMT1_ERROR_MASK {
            // TPM_RC_AUTH_FAIL, TPM_RC_BAD_AUTH
            0x00e | 0x022 => ReturnCodeClass::AuthFailure,
            // TPM_RC_POLICY_FAIL
            0x01d => ReturnCodeClass::PolicyFail,
            // TPM_RC_HANDLE
            0x00b => ReturnCodeClass::Handle,
            _ => ReturnCodeClass::Other,
        };
    }
    match code & TPM2_RC_FMT0_MASK {
        // TPM_RC_NV_AUTHORIZATION, TPM_RC_LOCKOUT
        0x149 | 0x921 => ReturnCodeClass::AuthFailure,
        0x147 => ReturnCodeClass::NvSize,
        0x14a => ReturnCodeClass::NvUninitialized,
        0x14c => ReturnCodeClass::NvDefined,
        _ => ReturnCodeClass::Other,
    }
}

/// Raw return code carried by a TSS error, if any.
pub fn return_code(err: &tss_esapi::Error) -> Option<u32> {
    match err {
        tss_esapi::Error::Tss2Error(rc) => Some(match rc {
            Tss2ResponseCode::Success => 0,
            Tss2ResponseCode::FormatZero(code) => code.0,
            Tss2ResponseCode::FormatOne(code) => code.0,
        }),
        tss_esapi::Error::WrapperError(_) => None,
    }
}

impl From<tss_esapi::Error> for TpmError {
    fn from(err: tss_esapi::Error) -> Self {
        let Some(rc) = return_code(&err) else {
            return TpmError::Protocol(err.to_string());
        };
        match classify_return_code(rc) {
            ReturnCodeClass::DeviceUnavailable => TpmError::DeviceUnavailable(err.to_string()),
            ReturnCodeClass::AuthFailure => TpmError::AuthFailure,
            ReturnCodeClass::PolicyFail => TpmError::PolicyFail,
            _ => TpmError::TssEsapi(err),
        }
    }
}
