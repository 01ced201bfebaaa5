use super::pcr::{bank_name, pcr_slot, PcrSelection};
use super::{
    classify_return_code, return_code, Connect, Handle, NvIndex, Result, ReturnCodeClass,
    SealedBlob, StorageFault, Tpm, TpmError, Undefined, SRK_HANDLE,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tss_esapi::attributes::{NvIndexAttributes, ObjectAttributes, SessionAttributes};
use tss_esapi::constants::{CapabilityType, SessionType};
use tss_esapi::handles::{
    KeyHandle, NvIndexHandle, NvIndexTpmHandle, PersistentTpmHandle, TpmHandle,
};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::resource_handles::{Hierarchy, NvAuth, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, HmacSession, PolicySession};
use tss_esapi::structures::{
    Auth, CapabilityData, CreateKeyResult, Digest, KeyedHashScheme, MaxNvBuffer, NvPublic,
    PcrSelectionList, Private, Public, PublicKeyedHashParameters, SensitiveData,
    SymmetricDefinition,
};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::traits::{Marshall, UnMarshall};

pub const DEFAULT_TCTI: &str = "device:/dev/tpmrm0";
pub const DEFAULT_DEVICE_PATH: &str = "/dev/tpmrm0";

const TPM2_TRANSIENT_FIRST: u32 = 0x8000_0000;
const NV_READ_CHUNK: usize = 512;
const RANDOM_CHUNK: usize = 32;

/// Opens `tss_esapi` contexts on a hardware TPM.
#[derive(Debug, Clone)]
pub struct DeviceConnector {
    tcti: String,
    device_path: PathBuf,
    owner_auth: Option<String>,
}

impl DeviceConnector {
    pub fn new(tcti: impl Into<String>, device_path: impl AsRef<Path>) -> Self {
        Self {
            tcti: tcti.into(),
            device_path: device_path.as_ref().to_path_buf(),
            owner_auth: None,
        }
    }

    /// Owner hierarchy password used for NV operations. Empty when unset.
    pub fn with_owner_auth(mut self, owner_auth: Option<String>) -> Self {
        self.owner_auth = owner_auth;
        self
    }
}

impl Default for DeviceConnector {
    fn default() -> Self {
        Self::new(DEFAULT_TCTI, DEFAULT_DEVICE_PATH)
    }
}

impl Connect for DeviceConnector {
    type Module = Device;

    fn is_present(&self) -> bool {
        self.device_path.exists()
    }

    fn connect(&self) -> Result<Device> {
        let conf = TctiNameConf::from_str(&self.tcti).map_err(|err| {
            TpmError::DeviceUnavailable(format!("invalid TCTI `{}`: {}", self.tcti, err))
        })?;
        log::debug!("TCTI config {:?}", conf);
        let mut ctx = tss_esapi::Context::new(conf)
            .map_err(|err| TpmError::DeviceUnavailable(err.to_string()))?;
        if let Some(owner_auth) = &self.owner_auth {
            let auth = Auth::try_from(owner_auth.as_bytes().to_vec())?;
            ctx.tr_set_auth(Hierarchy::Owner.into(), auth)?;
        }
        Ok(Device {
            ctx,
            sessions: HashMap::new(),
            objects: HashMap::new(),
            next_handle: 0,
        })
    }
}

/// A live `tss_esapi` context. Sessions and loaded objects are tracked so
/// callers only ever see opaque [`Handle`]s.
pub struct Device {
    ctx: tss_esapi::Context,
    sessions: HashMap<Handle, AuthSession>,
    objects: HashMap<Handle, KeyHandle>,
    next_handle: u32,
}

/// Maps a TSS failure on an NV command to a storage fault where it is one.
fn nv_error(index: NvIndex, err: tss_esapi::Error) -> TpmError {
    let Some(rc) = return_code(&err) else {
        return err.into();
    };
    match classify_return_code(rc) {
        ReturnCodeClass::Handle => TpmError::storage(index, StorageFault::Undefined),
        ReturnCodeClass::NvUninitialized => TpmError::storage(index, StorageFault::Uninitialized),
        ReturnCodeClass::NvDefined | ReturnCodeClass::NvSize => {
            TpmError::storage(index, StorageFault::Rejected(rc))
        }
        _ => err.into(),
    }
}

impl Device {
    fn allocate(&mut self) -> Handle {
        self.next_handle += 1;
        Handle::new(self.next_handle)
    }

    fn flush_session(&mut self, session: AuthSession) -> Result<()> {
        let handle = match session {
            AuthSession::HmacSession(session) => match session {
                HmacSession::HmacSession { session_handle, .. } => Some(session_handle.into()),
            },
            AuthSession::PolicySession(session) => match session {
                PolicySession::PolicySession { session_handle, .. } => Some(session_handle.into()),
            },
            _ => None,
        };
        if let Some(handle) = handle {
            self.ctx.flush_context(handle)?;
        }
        Ok(())
    }

    fn make_session(&mut self, t: SessionType) -> Result<AuthSession> {
        let session = self
            .ctx
            .start_auth_session(
                None,
                None,
                None,
                t,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or(TpmError::AuthSessionCreate)?;
        let (session_attributes, session_attributes_mask) =
            SessionAttributes::builder().with_encrypt(true).build();
        self.ctx
            .tr_sess_set_attributes(session, session_attributes, session_attributes_mask)?;
        Ok(session)
    }

    fn assert_pcr_policy(
        &mut self,
        session: AuthSession,
        selection: &PcrSelection,
    ) -> Result<Digest> {
        let policy_session = PolicySession::try_from(session)?;
        // An empty digest makes the TPM bind to the PCR values as they are now.
        self.ctx.policy_pcr(
            policy_session,
            Digest::default(),
            selection.selection_list()?,
        )?;
        Ok(self.ctx.policy_get_digest(policy_session)?)
    }

    fn srk(&mut self) -> Result<KeyHandle> {
        let persistent = PersistentTpmHandle::new(SRK_HANDLE)?;
        let handle = self
            .ctx
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(persistent)))
            .map_err(|err| match return_code(&err).map(classify_return_code) {
                Some(ReturnCodeClass::Handle) => {
                    TpmError::Protocol(format!("no storage root key at {:#010x}", SRK_HANDLE))
                }
                _ => err.into(),
            })?;
        Ok(KeyHandle::from(handle))
    }

    fn nv_handle(&mut self, index: NvIndex) -> Result<NvIndexHandle> {
        let tpm_handle = NvIndexTpmHandle::new(index.handle())?;
        self.ctx
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::NvIndex(tpm_handle)))
            .map(NvIndexHandle::from)
            .map_err(|err| nv_error(index, err))
    }

    fn nv_size(&mut self, index: NvIndex, handle: NvIndexHandle) -> Result<usize> {
        let (public, _name) = self
            .ctx
            .execute_without_session(|ctx| ctx.nv_read_public(handle))
            .map_err(|err| nv_error(index, err))?;
        Ok(public.data_size())
    }
}

impl Tpm for Device {
    fn nv_undefine(&mut self, index: NvIndex) -> Result<Undefined> {
        let handle = match self.nv_handle(index) {
            Ok(handle) => handle,
            Err(err) if err.is_undefined() => return Ok(Undefined::AlreadyAbsent),
            Err(err) => return Err(err),
        };
        self.ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.nv_undefine_space(Provision::Owner, handle)
            })
            .map_err(|err| nv_error(index, err))?;
        log::debug!("undefined NV index {}", index);
        Ok(Undefined::Removed)
    }

    fn nv_define(&mut self, index: NvIndex, size: usize) -> Result<()> {
        match self.nv_handle(index) {
            Ok(handle) => {
                let defined = self.nv_size(index, handle)?;
                if defined == size {
                    return Ok(());
                }
                return Err(TpmError::storage(
                    index,
                    StorageFault::SizeMismatch {
                        defined,
                        requested: size,
                    },
                ));
            }
            Err(err) if err.is_undefined() => {}
            Err(err) => return Err(err),
        }

        let attributes = NvIndexAttributes::builder()
            .with_owner_write(true)
            .with_owner_read(true)
            .build()?;
        let public = NvPublic::builder()
            .with_nv_index(NvIndexTpmHandle::new(index.handle())?)
            .with_index_name_algorithm(HashingAlgorithm::Sha256)
            .with_index_attributes(attributes)
            .with_data_area_size(size)
            .build()?;
        self.ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.nv_define_space(Provision::Owner, None, public)
            })
            .map_err(|err| nv_error(index, err))?;
        log::debug!("defined NV index {} with {} bytes", index, size);
        Ok(())
    }

    fn nv_write(&mut self, index: NvIndex, data: &[u8]) -> Result<()> {
        let handle = self.nv_handle(index)?;
        let defined = self.nv_size(index, handle)?;
        if defined != data.len() {
            return Err(TpmError::storage(
                index,
                StorageFault::SizeMismatch {
                    defined,
                    requested: data.len(),
                },
            ));
        }
        let buffer = MaxNvBuffer::try_from(data.to_vec())?;
        self.ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.nv_write(NvAuth::Owner, handle, buffer, 0)
            })
            .map_err(|err| nv_error(index, err))
    }

    fn nv_read(&mut self, index: NvIndex) -> Result<Vec<u8>> {
        let handle = self.nv_handle(index)?;
        let size = self.nv_size(index, handle)?;
        let mut data = Vec::with_capacity(size);
        while data.len() < size {
            let chunk = (size - data.len()).min(NV_READ_CHUNK) as u16;
            let offset = data.len() as u16;
            let buffer = self
                .ctx
                .execute_with_session(Some(AuthSession::Password), |ctx| {
                    ctx.nv_read(NvAuth::Owner, handle, chunk, offset)
                })
                .map_err(|err| nv_error(index, err))?;
            if buffer.value().is_empty() {
                return Err(TpmError::Protocol(format!(
                    "empty NV read from {} at offset {}",
                    index, offset
                )));
            }
            data.extend_from_slice(buffer.value());
        }
        Ok(data)
    }

    fn read_pcr(&mut self, bank: HashingAlgorithm, pcr: u8) -> Result<Vec<u8>> {
        let selection = PcrSelectionList::builder()
            .with_selection(bank, &[pcr_slot(pcr)?])
            .build()?;
        let (_update_counter, _selection_list, digest_list) = self
            .ctx
            .execute_without_session(|ctx| ctx.pcr_read(selection))?;
        digest_list
            .value()
            .first()
            .map(|digest| digest.value().to_vec())
            .ok_or(TpmError::BankUnallocated(bank_name(bank)))
    }

    fn policy_session(&mut self, selection: &PcrSelection) -> Result<(Handle, Vec<u8>)> {
        let session = self.make_session(SessionType::Policy)?;
        match self.assert_pcr_policy(session, selection) {
            Ok(digest) => {
                let handle = self.allocate();
                self.sessions.insert(handle, session);
                Ok((handle, digest.value().to_vec()))
            }
            Err(err) => {
                self.flush_session(session).ok();
                Err(err)
            }
        }
    }

    fn create_sealed(&mut self, policy: &[u8], secret: &[u8]) -> Result<SealedBlob> {
        let srk = self.srk()?;

        let object_attributes = ObjectAttributes::builder()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .build()?;

        let public = Public::builder()
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_auth_policy(Digest::try_from(policy.to_vec())?)
            .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
            .with_keyed_hash_unique_identifier(Digest::default())
            .build()?;
        let data = SensitiveData::try_from(secret.to_vec())?;

        let CreateKeyResult {
            out_private,
            out_public,
            ..
        } = self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.create(srk, public, None, Some(data), None, None)
            })?;

        Ok(SealedBlob {
            private: out_private.value().to_vec(),
            public: out_public.marshall()?,
        })
    }

    fn load_sealed(&mut self, blob: &SealedBlob) -> Result<Handle> {
        let srk = self.srk()?;
        let private = Private::try_from(blob.private.clone()).map_err(|err| {
            TpmError::storage(
                NvIndex::SealedPrivate,
                StorageFault::Malformed(err.to_string()),
            )
        })?;
        let public = Public::unmarshall(&blob.public).map_err(|err| {
            TpmError::storage(
                NvIndex::SealedPublic,
                StorageFault::Malformed(err.to_string()),
            )
        })?;
        let key = self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.load(srk, private, public)
            })?;
        let handle = self.allocate();
        self.objects.insert(handle, key);
        log::debug!("loaded sealed object as {}", handle);
        Ok(handle)
    }

    fn unseal(&mut self, session: Handle, object: Handle) -> Result<Vec<u8>> {
        let auth_session = *self
            .sessions
            .get(&session)
            .ok_or_else(|| TpmError::Protocol(format!("unknown session handle {}", session)))?;
        let key = *self
            .objects
            .get(&object)
            .ok_or_else(|| TpmError::Protocol(format!("unknown object handle {}", object)))?;
        let data = self
            .ctx
            .execute_with_session(Some(auth_session), |ctx| ctx.unseal(key.into()))?;
        Ok(data.value().to_vec())
    }

    fn flush(&mut self, handle: Handle) -> Result<()> {
        if let Some(session) = self.sessions.remove(&handle) {
            self.flush_session(session)?;
        } else if let Some(key) = self.objects.remove(&handle) {
            self.ctx.flush_context(key.into())?;
        }
        Ok(())
    }

    fn flush_transient(&mut self) -> Result<()> {
        let sessions: Vec<_> = self.sessions.drain().map(|(_, s)| s).collect();
        for session in sessions {
            self.flush_session(session).ok();
        }
        let objects: Vec<_> = self.objects.drain().map(|(_, k)| k).collect();
        for key in objects {
            self.ctx.flush_context(key.into()).ok();
        }

        let (capabilities, _) =
            self.ctx
                .get_capability(CapabilityType::Handles, TPM2_TRANSIENT_FIRST, 80)?;
        if let CapabilityData::Handles(handles) = capabilities {
            for handle in handles
                .into_inner()
                .into_iter()
                .filter(|h| matches!(h, TpmHandle::Transient(_)))
            {
                let handle = self
                    .ctx
                    .execute_without_session(|ctx| ctx.tr_from_tpm_public(handle))?;
                self.ctx.flush_context(handle).ok();
            }
        }
        Ok(())
    }

    fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(num_bytes);
        while bytes.len() < num_bytes {
            let wanted = (num_bytes - bytes.len()).min(RANDOM_CHUNK);
            let chunk = self.ctx.get_random(wanted)?;
            if chunk.value().is_empty() {
                return Err(TpmError::Protocol("TPM returned no random bytes".into()));
            }
            bytes.extend_from_slice(chunk.value());
        }
        bytes.truncate(num_bytes);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_not_present() {
        let connector = DeviceConnector::new(DEFAULT_TCTI, "/nonexistent/tpmrm0");
        assert!(!connector.is_present());
    }

    #[test]
    fn invalid_tcti_is_device_unavailable() {
        let connector = DeviceConnector::new("bogus-transport:", "/dev/null");
        assert!(matches!(
            connector.connect(),
            Err(TpmError::DeviceUnavailable(_))
        ));
    }
}
