#![warn(missing_docs)]

//! `vaultfs` command-line client.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vaultfs_client::{ClientConfig, ItemInfo, LocalDirBackend, VaultFs};
use vaultfs_storage::AccountKeys;

#[derive(Parser)]
#[command(name = "vaultfs")]
#[command(about = "Encrypted, replicated file vault", long_about = None)]
struct Cli {
    /// Configuration file (TOML or JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an account key file.
    Keygen {
        /// Overwrite an existing key file.
        #[arg(long)]
        force: bool,
    },
    /// Register the account.
    Init,
    /// List a directory.
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Create a directory.
    Mkdir {
        path: String,
        /// Create missing parents.
        #[arg(short = 'p', long)]
        parents: bool,
    },
    /// Remove a directory.
    Rmdir {
        path: String,
        /// Remove contents too.
        #[arg(short, long)]
        recursive: bool,
    },
    /// Upload a local file.
    Put { local: PathBuf, remote: String },
    /// Download a file.
    Get { remote: String, local: PathBuf },
    /// Move or rename an item.
    Mv { src: String, dst: String },
    /// Copy an item.
    Cp { src: String, dst: String },
    /// Remove a file.
    Rm { path: String },
    /// Show transactions and journal state.
    Status,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::from_file(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(ClientConfig::default()),
    }
}

fn load_keys(path: &Path) -> Result<AccountKeys> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading key file {} (run `vaultfs keygen`)", path.display()))?;
    let bytes = hex::decode(text.trim()).context("key file is not hex")?;
    let secret: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("key file must hold 32 bytes"))?;
    Ok(AccountKeys::from_secret_bytes(secret))
}

fn keygen(config: &ClientConfig, force: bool) -> Result<()> {
    if config.key_file.exists() && !force {
        bail!("{} already exists; pass --force to replace it", config.key_file.display());
    }
    let keys = AccountKeys::generate();
    std::fs::write(&config.key_file, hex::encode(*keys.secret_bytes()))?;
    println!("public key: {}", hex::encode(keys.public_bytes()));
    Ok(())
}

fn open(config: ClientConfig) -> Result<VaultFs> {
    let keys = Arc::new(load_keys(&config.key_file)?);
    let backend = Arc::new(LocalDirBackend::open(&config.backend_dir)?);
    Ok(VaultFs::open(config, keys, backend)?)
}

fn print_items(items: &[ItemInfo], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(items)?);
        return Ok(());
    }
    for item in items {
        let kind = if item.is_dir { 'd' } else { '-' };
        println!("{} {:>12} {}", kind, item.size, item.name);
    }
    Ok(())
}

/// Waits for uploads to reach the backend before the process exits.
fn drain(fs: &VaultFs) {
    while !fs.wait_idle(Duration::from_secs(5)) {
        tracing::info!("waiting for transfers to finish");
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    if let Command::Keygen { force } = cli.command {
        return keygen(&config, force);
    }

    let fs = open(config)?;
    if let Command::Init = cli.command {
        fs.register()?;
        println!("account registered");
        return Ok(());
    }

    match cli.command {
        Command::Ls { path } => print_items(&fs.listdir(&path)?, cli.json)?,
        Command::Mkdir { path, parents } => fs.mkdir(&path, parents)?,
        Command::Rmdir { path, recursive } => fs.rmdir(&path, recursive)?,
        Command::Put { local, remote } => {
            let mut src = std::fs::File::open(&local).with_context(|| format!("opening {}", local.display()))?;
            let mut dst = fs.open_file(&remote, true)?;
            let n = std::io::copy(&mut src, &mut dst)?;
            dst.close()?;
            drain(&fs);
            println!("uploaded {} bytes to {}", n, remote);
        }
        Command::Get { remote, local } => {
            let mut src = fs.open_file(&remote, false)?;
            let mut dst = std::fs::File::create(&local).with_context(|| format!("creating {}", local.display()))?;
            let n = std::io::copy(&mut src, &mut dst)?;
            println!("downloaded {} bytes to {}", n, local.display());
        }
        Command::Mv { src, dst } => fs.move_item(&src, &dst)?,
        Command::Cp { src, dst } => {
            fs.copy(&src, &dst)?;
            drain(&fs);
        }
        Command::Rm { path } => fs.remove_file(&path)?,
        Command::Status => {
            let ops = fs.inprocess_operations();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&ops)?);
            } else {
                println!("journal: {}", fs.journal_status());
                for op in ops {
                    println!(
                        "{:>6} {:<8} {:<11} {}/{} {}",
                        op.id, op.kind, op.status, op.blocks_done, op.blocks_total, op.path
                    );
                    if let Some(error) = op.error {
                        println!("       {}", error);
                    }
                }
            }
        }
        Command::Keygen { .. } | Command::Init => {}
    }
    fs.stop();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);
    run(cli)
}
