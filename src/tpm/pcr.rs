use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::structures::{PcrSelectionList, PcrSlot};

/// Number of PCRs in a PC client TPM bank.
pub const PCR_COUNT: u8 = 24;

/// PCRs the vault key is sealed against. Any boot component not measured into
/// one of these is outside the protection of the seal.
pub const DISK_KEY_SEALING_PCRS: &[u8] = &[0, 1, 2, 3, 4, 6, 7, 8, 9, 13, 14];

#[derive(Error, Debug, PartialEq)]
pub enum PcrError {
    #[error("empty PCR selection list, expected at least one selection")]
    EmptyPcrSelectionList,
    #[error("invalid PCR selection list specification `{0}`")]
    InvalidPcrSelectionString(String),
    #[error("invalid PCR bank `{0}`")]
    InvalidPcrBank(String),
    #[error("invalid PCR slot `{0}`")]
    InvalidPcrSlot(String),
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

/// A PCR bank together with an ascending, de-duplicated set of indices.
///
/// This is the compatibility contract between seal and unseal: a blob sealed
/// against one selection can only be unsealed with exactly the same one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSelection {
    bank: HashingAlgorithm,
    pcrs: Vec<u8>,
}

impl PcrSelection {
    pub fn new(bank: HashingAlgorithm, pcrs: &[u8]) -> Result<Self> {
        if pcrs.is_empty() {
            return Err(PcrError::EmptyPcrSelectionList);
        }
        if let Some(bad) = pcrs.iter().find(|&&pcr| pcr >= PCR_COUNT) {
            return Err(PcrError::InvalidPcrSlot(bad.to_string()));
        }
        let mut pcrs = pcrs.to_vec();
        pcrs.sort_unstable();
        pcrs.dedup();
        Ok(Self { bank, pcrs })
    }

    pub fn bank(&self) -> HashingAlgorithm {
        self.bank
    }

    pub fn pcrs(&self) -> &[u8] {
        &self.pcrs
    }

    pub fn bank_name(&self) -> &'static str {
        bank_name(self.bank)
    }

    /// Converts to the TSS representation for PolicyPCR.
    pub fn selection_list(&self) -> Result<PcrSelectionList> {
        let slots = self
            .pcrs
            .iter()
            .map(|&pcr| pcr_slot(pcr))
            .collect::<Result<Vec<_>>>()?;
        Ok(PcrSelectionList::builder()
            .with_selection(self.bank, slots.as_slice())
            .build()?)
    }
}

impl Default for PcrSelection {
    fn default() -> Self {
        Self {
            bank: HashingAlgorithm::Sha256,
            pcrs: DISK_KEY_SEALING_PCRS.to_vec(),
        }
    }
}

impl fmt::Display for PcrSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pcrs = self
            .pcrs
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}:{}", self.bank_name(), pcrs)
    }
}

impl FromStr for PcrSelection {
    type Err = PcrError;

    fn from_str(expression: &str) -> Result<Self> {
        parse_pcr_selection(expression)
    }
}

pub fn bank_name(bank: HashingAlgorithm) -> &'static str {
    match bank {
        HashingAlgorithm::Sha1 => "sha1",
        HashingAlgorithm::Sha256 => "sha256",
        HashingAlgorithm::Sha384 => "sha384",
        HashingAlgorithm::Sha512 => "sha512",
        _ => "unknown",
    }
}

fn parse_pcr_bank(bank: &str) -> Result<HashingAlgorithm> {
    match bank {
        "sha1" => Ok(HashingAlgorithm::Sha1),
        "sha256" => Ok(HashingAlgorithm::Sha256),
        _ => Err(PcrError::InvalidPcrBank(bank.to_string())),
    }
}

fn parse_slot(slot: &str) -> Result<u8> {
    match slot.parse::<u8>() {
        Ok(pcr) if pcr < PCR_COUNT => Ok(pcr),
        _ => Err(PcrError::InvalidPcrSlot(slot.to_string())),
    }
}

fn parse_slots(slots: &str) -> Result<Vec<u8>> {
    if slots.is_empty() {
        return Err(PcrError::EmptyPcrSelectionList);
    }
    slots.split(',').map(parse_slot).collect()
}

/// Parses `bank:i,j,k`, e.g. `sha256:0,1,2,3,4,6,7`.
pub fn parse_pcr_selection(expression: &str) -> Result<PcrSelection> {
    let (bank, slots) = expression
        .split_once(':')
        .ok_or_else(|| PcrError::InvalidPcrSelectionString(expression.to_owned()))?;
    let hash_algorithm = parse_pcr_bank(bank)?;
    let slots = parse_slots(slots)?;
    PcrSelection::new(hash_algorithm, &slots)
}

/// `PcrSlot` values are the selection bitmask bit for the index.
pub fn pcr_slot(pcr: u8) -> Result<PcrSlot> {
    if pcr >= PCR_COUNT {
        return Err(PcrError::InvalidPcrSlot(pcr.to_string()));
    }
    Ok(PcrSlot::try_from(1u32 << pcr)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn parse_no_bank_delimiter() {
        let parsed = parse_pcr_selection("1,2,3");
        assert_eq!(
            parsed,
            Err(PcrError::InvalidPcrSelectionString("1,2,3".to_string()))
        );
    }

    #[test]
    fn parse_no_bank() {
        let parsed = parse_pcr_selection(":1,2,3");
        assert_eq!(parsed, Err(PcrError::InvalidPcrBank("".to_string())));
    }

    #[test]
    fn parse_bad_bank() {
        let parsed = parse_pcr_selection("bunk:1,2,3");
        assert_eq!(parsed, Err(PcrError::InvalidPcrBank("bunk".to_string())));
    }

    #[test]
    fn parse_no_selections() {
        let parsed = parse_pcr_selection("sha256:");
        assert_eq!(parsed, Err(PcrError::EmptyPcrSelectionList));
    }

    #[test]
    fn parse_bad_slot() {
        let parsed = parse_pcr_selection("sha1:1,bad,2");
        assert_eq!(parsed, Err(PcrError::InvalidPcrSlot("bad".to_string())));
    }

    #[test]
    fn parse_out_of_range_slot() {
        let parsed = parse_pcr_selection("sha256:1,24");
        assert_eq!(parsed, Err(PcrError::InvalidPcrSlot("24".to_string())));
    }

    #[test]
    fn parse_sorts_and_dedups() -> Result<()> {
        let parsed = parse_pcr_selection("sha256:7,0,7,3")?;
        assert_eq!(parsed.bank(), HashingAlgorithm::Sha256);
        assert_eq!(parsed.pcrs(), &[0, 3, 7]);
        Ok(())
    }

    #[test]
    fn default_round_trips_through_display() -> Result<()> {
        let default = PcrSelection::default();
        assert_eq!(default.to_string(), "sha256:0,1,2,3,4,6,7,8,9,13,14");
        assert_eq!(default.to_string().parse::<PcrSelection>()?, default);
        Ok(())
    }

    #[test]
    fn selection_list_matches_builder() -> Result<()> {
        let expected = PcrSelectionList::builder()
            .with_selection(
                HashingAlgorithm::Sha1,
                &[PcrSlot::Slot0, PcrSlot::Slot1, PcrSlot::Slot9],
            )
            .build()?;
        let parsed = parse_pcr_selection("sha1:0,1,9")?;
        assert_eq!(expected, parsed.selection_list()?);
        Ok(())
    }
}
