//! ALFA DeviceVault - CLI
//!
//! Desktop front-end over a file store and the software wrap adapter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use zeroize::Zeroizing;

use alfa_devicevault::{
    logging, DeviceVault, EncryptedBlob, FileStore, KdfCost, KeyValueStore, SoftwareWrapAdapter,
    VaultConfig, VaultError, VaultState,
};

/// Non-interactive password source for scripts
const ENV_PASSWORD: &str = "ALFA_DEVICEVAULT_PASSWORD";

#[derive(Parser)]
#[command(name = "alfa-devicevault")]
#[command(version = alfa_devicevault::VERSION)]
#[command(about = "ALFA DeviceVault - device-bound vault with auto-wipe")]
struct Cli {
    /// Config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Profile id
    #[arg(short, long, global = true)]
    profile: Option<String>,

    /// JSON logs on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind a new password to this device
    Init {
        /// Tune Argon2id cost to this machine
        #[arg(long)]
        auto_tune: bool,
    },

    /// Verify the password and open the vault
    Unlock,

    /// Encrypt a file
    Encrypt {
        input: PathBuf,
        output: PathBuf,
    },

    /// Decrypt a file produced by `encrypt`
    Decrypt {
        input: PathBuf,
        output: PathBuf,
    },

    /// Store an application secret (value read from the prompt)
    SecretSet { name: String },

    /// Print an application secret
    SecretGet { name: String },

    /// Change the vault password
    Passwd,

    /// Show vault status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Destroy the vault immediately
    Panic {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Show the device fingerprint
    Fingerprint,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.json_logs);

    if let Err(e) = run(cli) {
        match e.downcast_ref::<VaultError>() {
            Some(vault_err) => eprintln!("{} {}", style("Error:").red().bold(), vault_err.user_message()),
            None => eprintln!("{} {:#}", style("Error:").red().bold(), e),
        }
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<VaultConfig> {
    let mut config = VaultConfig::resolve(cli.config.as_deref()).context("loading config")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(profile) = &cli.profile {
        config.profile = profile.clone();
    }
    config.validate()?;
    Ok(config)
}

fn open_vault(config: VaultConfig) -> anyhow::Result<DeviceVault> {
    let root = config.data_dir();
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&root.join("vault"))?);
    let keystore: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&root.join("keystore"))?);
    eprintln!(
        "{}",
        style("Using the software key adapter: keys are not hardware-protected.").yellow()
    );
    Ok(DeviceVault::open(config, store, Arc::new(SoftwareWrapAdapter::new(keystore)))?)
}

fn prompt_password(prompt: &str) -> anyhow::Result<SecretString> {
    if let Ok(password) = std::env::var(ENV_PASSWORD) {
        return Ok(SecretString::from(password));
    }
    let password = rpassword::prompt_password(prompt).context("reading password")?;
    Ok(SecretString::from(password))
}

/// Runs a slow operation behind a spinner
fn with_spinner<T>(message: &str, f: impl FnOnce() -> T) -> anyhow::Result<T> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.cyan} {msg}")?);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    let result = f();
    spinner.finish_and_clear();
    Ok(result)
}

fn unlock(vault: &DeviceVault) -> anyhow::Result<()> {
    let password = prompt_password("Password: ")?;
    let path = with_spinner("Verifying password...", || vault.unlock(&password))??;
    tracing::debug!(?path, "Unlocked");
    Ok(())
}

fn write_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Init { auto_tune } => {
            let mut config = config;
            if auto_tune {
                config.kdf = KdfCost::auto_tune_from_system();
                println!(
                    "  argon2id: {} MiB, {} iterations, ~{} ms",
                    config.kdf.memory_kib / 1024,
                    config.kdf.iterations,
                    config.kdf.estimated_time_ms()
                );
            }
            let vault = open_vault(config)?;
            if vault.state() != VaultState::Uninitialized {
                bail!("vault already initialised for profile {}", vault.config().profile);
            }
            let password = prompt_password("New password: ")?;
            if std::env::var(ENV_PASSWORD).is_err() {
                let confirm = prompt_password("Repeat password: ")?;
                if secrecy::ExposeSecret::expose_secret(&password)
                    != secrecy::ExposeSecret::expose_secret(&confirm)
                {
                    bail!("passwords do not match");
                }
            }
            with_spinner("Deriving device-bound key...", || vault.setup(&password))??;
            println!("{} Vault created for profile {}", style("✓").green(), vault.config().profile);
            println!("  data: {}", vault.config().data_dir().display());
        }

        Commands::Unlock => {
            let vault = open_vault(config)?;
            unlock(&vault)?;
            println!("{} Password accepted", style("✓").green());
        }

        Commands::Encrypt { input, output } => {
            let vault = open_vault(config)?;
            unlock(&vault)?;
            let data = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let blob = vault.encrypt_payload(&data)?;
            write_file(&output, &blob.to_bytes())?;
            println!("{} {} -> {}", style("✓").green(), input.display(), output.display());
        }

        Commands::Decrypt { input, output } => {
            let vault = open_vault(config)?;
            unlock(&vault)?;
            let data = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let blob = EncryptedBlob::from_bytes(&data).map_err(VaultError::from)?;
            let plaintext = vault.decrypt_payload(&blob)?;
            write_file(&output, &plaintext)?;
            println!("{} {} -> {}", style("✓").green(), input.display(), output.display());
        }

        Commands::SecretSet { name } => {
            let vault = open_vault(config)?;
            unlock(&vault)?;
            let value = Zeroizing::new(rpassword::prompt_password(format!("Value for {}: ", name))?);
            vault.store_secret(&name, value.as_bytes())?;
            println!("{} Secret {} stored", style("✓").green(), name);
        }

        Commands::SecretGet { name } => {
            let vault = open_vault(config)?;
            unlock(&vault)?;
            match vault.load_secret(&name)? {
                Some(value) => println!("{}", String::from_utf8_lossy(value.as_slice())),
                None => bail!("no secret named {}", name),
            }
        }

        Commands::Passwd => {
            let vault = open_vault(config)?;
            let current = prompt_password("Current password: ")?;
            with_spinner("Verifying password...", || vault.unlock(&current))??;
            let new = rpassword::prompt_password("New password: ")?;
            let new = SecretString::from(new);
            with_spinner("Re-sealing keys...", || vault.change_password(&current, &new))??;
            println!("{} Password changed", style("✓").green());
        }

        Commands::Status { json } => {
            let vault = open_vault(config)?;
            let status = vault.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            println!("{}", style("ALFA DeviceVault").bold());
            println!("  profile:   {}", status.profile);
            println!("  state:     {:?}", status.state);
            println!("  attempts:  {} remaining", status.remaining_attempts);
            println!("  cipher:    {}", status.cipher.name());
            println!("  threat:    {}", status.threat_level.as_str());
            match status.last_wipe {
                Some(event) => println!(
                    "  last wipe: {} ({:?}, {}/{} methods ok)",
                    event.timestamp,
                    event.reason,
                    event.succeeded(),
                    event.results.len()
                ),
                None => println!("  last wipe: never"),
            }
        }

        Commands::Panic { yes } => {
            let vault = open_vault(config)?;
            if !yes {
                let term = Term::stderr();
                term.write_line(&format!(
                    "{}",
                    style("This permanently destroys the vault. Type WIPE to continue:").red().bold()
                ))?;
                if term.read_line()?.trim() != "WIPE" {
                    bail!("aborted");
                }
            }
            let event = vault.panic_wipe()?;
            println!("{} Vault wiped. This cannot be undone.", style("✓").green());
            if let Some(event) = event {
                for result in &event.results {
                    let mark = if result.success { style("ok").green() } else { style("failed").red() };
                    println!("  {:?}: {}", result.method, mark);
                }
            }
        }

        Commands::Fingerprint => {
            let vault = open_vault(config)?;
            let fingerprint = vault.fingerprint()?;
            println!("{}", style(fingerprint.digest_hex()).bold());
            for (name, value) in &fingerprint.attributes {
                println!("  {:<12} {}", name, value);
            }
        }
    }

    Ok(())
}
