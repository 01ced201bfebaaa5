use crate::config::Config;
use crate::file::write_rename;
use crate::snapshot;
use crate::tpm::device::DeviceConnector;
use crate::tpm::pcr::{parse_pcr_selection, PcrSelection};
use crate::tpm::with_session;
use crate::vault::{Capabilities, VaultKeyManager};
use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use std::path::{Path, PathBuf};

const TPM_ENV_VAR: &str = "TCTI";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// PCRs the vault key is sealed to
    #[arg(short, long, value_name = "PCR List", default_value = "sha256:0,1,2,3,4,6,7,8,9,13,14", value_parser = parse_pcr_selection)]
    pcrs: PcrSelection,

    /// TPM device specified in TCTI format, overrides the config file
    #[arg(short = 'T', long, env = TPM_ENV_VAR)]
    tcti: Option<String>,

    /// YAML config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the vault key to a file, generating, migrating or unsealing it first
    Fetch {
        /// File the raw key is written to, readable by the owner only
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
    /// Report whether the sealed key is new, the migrated legacy key, or absent
    Relationship,
    /// Remove the sealed key from TPM NV storage
    Wipe,
    /// List PCRs that changed since the vault key was sealed
    Diagnose,
    /// Show current values of the selected PCRs
    Pcrs,
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub fn run(&self) -> Result<&Self> {
        log::debug!("{:?}", self);
        let config = self.config()?;
        match &self.command {
            Commands::Fetch { output } => self.fetch(&config, output)?,
            Commands::Relationship => {
                println!("{}", self.manager(&config)?.sealed_key_relationship())
            }
            Commands::Wipe => self.manager(&config)?.wipe_sealed_key()?,
            Commands::Diagnose => self.diagnose(&config)?,
            Commands::Pcrs => self.show_pcrs(&config)?,
        };
        Ok(self)
    }

    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(tcti) = &self.tcti {
            config.tcti = tcti.clone();
        }
        Ok(config)
    }

    fn manager(&self, config: &Config) -> Result<VaultKeyManager<DeviceConnector>> {
        let connector = config.connector()?;
        let capabilities = Capabilities::probe(&connector)?;
        log::debug!("{:?}", capabilities);
        Ok(VaultKeyManager::new(
            connector,
            capabilities,
            self.pcrs.clone(),
            config.evidence(),
        ))
    }

    fn fetch(&self, config: &Config, output: &Path) -> Result<()> {
        let key = self.manager(config)?.fetch_vault_key()?;
        write_rename(output, key.as_bytes())
            .wrap_err_with(|| format!("writing vault key to {}", output.display()))?;
        Ok(())
    }

    fn diagnose(&self, config: &Config) -> Result<()> {
        let evidence = config.evidence();
        let mismatch = with_session(&config.connector()?, |tpm| {
            snapshot::diagnose(tpm, evidence.snapshot_path(), &self.pcrs)
        })?;
        if mismatch.is_empty() {
            println!("PCR values match the sealing snapshot");
        } else {
            println!("Mismatching PCR indexes: {:?}", mismatch);
        }
        Ok(())
    }

    fn show_pcrs(&self, config: &Config) -> Result<()> {
        let values = with_session(&config.connector()?, |tpm| {
            snapshot::read_pcrs(tpm, &self.pcrs)
        })?;
        for (pcr, value) in values {
            println!("{}:{:<2} {}", self.pcrs.bank_name(), pcr, hex::encode(value));
        }
        Ok(())
    }
}
