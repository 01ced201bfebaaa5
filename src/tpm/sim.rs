//! In-memory TPM used by the unit tests. Models NV storage, SHA-1/SHA-256
//! PCR banks, PolicyPCR digests and sealed objects closely enough to exercise
//! the failure paths real hardware produces.

use super::pcr::{bank_name, PcrSelection, PCR_COUNT};
use super::{
    Connect, Handle, NvIndex, Result, SealedBlob, StorageFault, Tpm, TpmError, Undefined,
};
use sha2::{Digest, Sha256};
use std::cell::{RefCell, RefMut};
use std::collections::hash_map::RandomState;
use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hasher};
use std::rc::Rc;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;

const PRIVATE_MAGIC: &[u8] = b"SIMP";
const PUBLIC_MAGIC: &[u8] = b"SIMU";

struct NvSlot {
    data: Vec<u8>,
    written: bool,
}

pub(crate) struct SimState {
    pub present: bool,
    pub sha256_bank: bool,
    /// Returned by the next unseal calls instead of checking the policy.
    pub unseal_fault: Option<fn() -> TpmError>,
    /// The next `nv_define` of this index fails as if NV space ran out.
    pub define_fault: Option<NvIndex>,
    /// Returned once by the next `read_pcr`.
    pub pcr_fault: Option<fn() -> TpmError>,
    /// Number of live handles released through `flush`.
    pub flushed: usize,
    pub connections: usize,
    nv: BTreeMap<u32, NvSlot>,
    sha1: [[u8; 20]; PCR_COUNT as usize],
    sha256: [[u8; 32]; PCR_COUNT as usize],
    sessions: HashMap<Handle, Vec<u8>>,
    objects: HashMap<Handle, (Vec<u8>, Vec<u8>)>,
    next_handle: u32,
    rng_seed: u64,
    rng_counter: u64,
}

impl SimState {
    fn new() -> Self {
        Self {
            present: true,
            sha256_bank: true,
            unseal_fault: None,
            define_fault: None,
            pcr_fault: None,
            flushed: 0,
            connections: 0,
            nv: BTreeMap::new(),
            sha1: [[0; 20]; PCR_COUNT as usize],
            sha256: [[0; 32]; PCR_COUNT as usize],
            sessions: HashMap::new(),
            objects: HashMap::new(),
            next_handle: 0x8000_0000,
            // every simulated chip gets its own random stream
            rng_seed: RandomState::new().build_hasher().finish(),
            rng_counter: 0,
        }
    }

    /// Extends a SHA-256 PCR the way a boot component measurement would.
    pub fn extend(&mut self, pcr: u8, measurement: &[u8]) {
        let slot = &mut self.sha256[pcr as usize];
        let mut hasher = Sha256::new();
        hasher.update(&slot[..]);
        hasher.update(measurement);
        slot.copy_from_slice(&hasher.finalize());
    }

    pub fn live_handles(&self) -> usize {
        self.sessions.len() + self.objects.len()
    }

    pub fn nv_contents(&self, index: NvIndex) -> Option<Vec<u8>> {
        self.nv
            .get(&index.handle())
            .filter(|slot| slot.written)
            .map(|slot| slot.data.clone())
    }

    pub fn nv_defined(&self) -> usize {
        self.nv.len()
    }

    fn allocate(&mut self) -> Handle {
        self.next_handle += 1;
        Handle::new(self.next_handle)
    }

    fn pcr(&self, bank: HashingAlgorithm, pcr: u8) -> Result<Vec<u8>> {
        if pcr >= PCR_COUNT {
            return Err(TpmError::Protocol(format!("no PCR {}", pcr)));
        }
        match bank {
            HashingAlgorithm::Sha1 => Ok(self.sha1[pcr as usize].to_vec()),
            HashingAlgorithm::Sha256 if self.sha256_bank => Ok(self.sha256[pcr as usize].to_vec()),
            _ => Err(TpmError::BankUnallocated(bank_name(bank))),
        }
    }

    fn policy_digest(&self, selection: &PcrSelection) -> Result<Vec<u8>> {
        let mut values = Sha256::new();
        for &pcr in selection.pcrs() {
            values.update(self.pcr(selection.bank(), pcr)?);
        }
        let mut policy = Sha256::new();
        policy.update(b"PolicyPCR");
        policy.update(selection.bank_name().as_bytes());
        policy.update(selection.pcrs());
        policy.update(values.finalize());
        Ok(policy.finalize().to_vec())
    }

    fn slot(&self, index: NvIndex) -> Result<&NvSlot> {
        self.nv
            .get(&index.handle())
            .ok_or_else(|| TpmError::storage(index, StorageFault::Undefined))
    }
}

/// Hands out connections to one shared simulated chip.
#[derive(Clone)]
pub(crate) struct SimConnector {
    state: Rc<RefCell<SimState>>,
}

impl SimConnector {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState::new())),
        }
    }

    pub fn state(&self) -> RefMut<'_, SimState> {
        self.state.borrow_mut()
    }
}

impl Connect for SimConnector {
    type Module = SimTpm;

    fn is_present(&self) -> bool {
        self.state.borrow().present
    }

    fn connect(&self) -> Result<SimTpm> {
        self.state.borrow_mut().connections += 1;
        Ok(SimTpm {
            state: Rc::clone(&self.state),
        })
    }
}

pub(crate) struct SimTpm {
    state: Rc<RefCell<SimState>>,
}

impl Tpm for SimTpm {
    fn nv_undefine(&mut self, index: NvIndex) -> Result<Undefined> {
        Ok(match self.state.borrow_mut().nv.remove(&index.handle()) {
            Some(_) => Undefined::Removed,
            None => Undefined::AlreadyAbsent,
        })
    }

    fn nv_define(&mut self, index: NvIndex, size: usize) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.define_fault == Some(index) {
            state.define_fault = None;
            // TPM_RC_NV_SPACE
            return Err(TpmError::storage(index, StorageFault::Rejected(0x14b)));
        }
        if let Some(slot) = state.nv.get(&index.handle()) {
            if slot.data.len() == size {
                return Ok(());
            }
            return Err(TpmError::storage(
                index,
                StorageFault::SizeMismatch {
                    defined: slot.data.len(),
                    requested: size,
                },
            ));
        }
        state.nv.insert(
            index.handle(),
            NvSlot {
                data: vec![0; size],
                written: false,
            },
        );
        Ok(())
    }

    fn nv_write(&mut self, index: NvIndex, data: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let slot = state
            .nv
            .get_mut(&index.handle())
            .ok_or_else(|| TpmError::storage(index, StorageFault::Undefined))?;
        if slot.data.len() != data.len() {
            return Err(TpmError::storage(
                index,
                StorageFault::SizeMismatch {
                    defined: slot.data.len(),
                    requested: data.len(),
                },
            ));
        }
        slot.data.copy_from_slice(data);
        slot.written = true;
        Ok(())
    }

    fn nv_read(&mut self, index: NvIndex) -> Result<Vec<u8>> {
        let state = self.state.borrow();
        let slot = state.slot(index)?;
        if !slot.written {
            return Err(TpmError::storage(index, StorageFault::Uninitialized));
        }
        Ok(slot.data.clone())
    }

    fn read_pcr(&mut self, bank: HashingAlgorithm, pcr: u8) -> Result<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        if let Some(fault) = state.pcr_fault.take() {
            return Err(fault());
        }
        state.pcr(bank, pcr)
    }

    fn policy_session(&mut self, selection: &PcrSelection) -> Result<(Handle, Vec<u8>)> {
        let mut state = self.state.borrow_mut();
        let digest = state.policy_digest(selection)?;
        let handle = state.allocate();
        state.sessions.insert(handle, digest.clone());
        Ok((handle, digest))
    }

    fn create_sealed(&mut self, policy: &[u8], secret: &[u8]) -> Result<SealedBlob> {
        Ok(SealedBlob {
            private: [PRIVATE_MAGIC, secret].concat(),
            public: [PUBLIC_MAGIC, policy].concat(),
        })
    }

    fn load_sealed(&mut self, blob: &SealedBlob) -> Result<Handle> {
        let secret = blob.private.strip_prefix(PRIVATE_MAGIC).ok_or_else(|| {
            TpmError::storage(
                NvIndex::SealedPrivate,
                StorageFault::Malformed("bad private area".into()),
            )
        })?;
        let policy = blob.public.strip_prefix(PUBLIC_MAGIC).ok_or_else(|| {
            TpmError::storage(
                NvIndex::SealedPublic,
                StorageFault::Malformed("bad public area".into()),
            )
        })?;
        let mut state = self.state.borrow_mut();
        let handle = state.allocate();
        state
            .objects
            .insert(handle, (policy.to_vec(), secret.to_vec()));
        Ok(handle)
    }

    fn unseal(&mut self, session: Handle, object: Handle) -> Result<Vec<u8>> {
        let state = self.state.borrow();
        if let Some(fault) = state.unseal_fault {
            return Err(fault());
        }
        let digest = state
            .sessions
            .get(&session)
            .ok_or_else(|| TpmError::Protocol(format!("unknown session {}", session)))?;
        let (policy, secret) = state
            .objects
            .get(&object)
            .ok_or_else(|| TpmError::Protocol(format!("unknown object {}", object)))?;
        if digest != policy {
            return Err(TpmError::PolicyFail);
        }
        Ok(secret.clone())
    }

    fn flush(&mut self, handle: Handle) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let removed =
            state.sessions.remove(&handle).is_some() || state.objects.remove(&handle).is_some();
        if removed {
            state.flushed += 1;
        }
        Ok(())
    }

    fn flush_transient(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.sessions.clear();
        state.objects.clear();
        Ok(())
    }

    fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        let mut bytes = Vec::with_capacity(num_bytes);
        while bytes.len() < num_bytes {
            state.rng_counter += 1;
            let mut hasher = Sha256::new();
            hasher.update(state.rng_seed.to_le_bytes());
            hasher.update(state.rng_counter.to_le_bytes());
            bytes.extend_from_slice(&hasher.finalize());
        }
        bytes.truncate(num_bytes);
        Ok(bytes)
    }
}
