//! kdbx-dump - Look up and dump entries from KeePass databases
//!
//! Provides:
//! - A text report of every entry, grouped by folder
//! - Password lookup by group, title and username
//! - Header inspection without unlocking
//! - The group tree as JSON

mod config;
mod report;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kdbx_core::{CancelToken, CompositeKey, Database, KdfParams};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::report::Report;

#[derive(Debug, Parser)]
#[command(name = "kdbx-dump", version, about = "Read KeePass KDBX 3.x/4.x databases")]
struct Cli {
    /// Configuration file (default: ./kdbx-dump.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct Credentials {
    /// Master password; prompted for when neither this nor KDBX_PASSWORD is set
    #[arg(long, env = "KDBX_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Key file
    #[arg(long)]
    keyfile: Option<PathBuf>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("keyfile", &self.keyfile)
            .finish()
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print every entry grouped by folder
    Dump {
        database: PathBuf,
        #[command(flatten)]
        credentials: Credentials,
        /// Write the report here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Look up one entry
    Get {
        database: PathBuf,
        #[command(flatten)]
        credentials: Credentials,
        #[arg(long)]
        title: String,
        /// Print only the password of the entry with this username
        #[arg(long)]
        user: Option<String>,
        /// Direct subgroup of the root to search; the root itself when omitted
        #[arg(long)]
        group: Option<String>,
    },
    /// Show the outer header without unlocking
    Header { database: PathBuf },
    /// Print the group tree as JSON
    Tree {
        database: PathBuf,
        #[command(flatten)]
        credentials: Credentials,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "kdbx_dump=debug,kdbx_core=debug"
    } else {
        "kdbx_dump=info,kdbx_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Dump {
            database,
            mut credentials,
            output,
        } => {
            let db = unlock(&database, &mut credentials, &config).await?;
            let report = Report::new(&db, &config.report.excluded_groups);
            match output {
                Some(path) => {
                    let mut file = File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    report.write_to(&mut file)?;
                    tracing::info!("Wrote report to {}", path.display());
                }
                None => report.write_to(&mut std::io::stdout().lock())?,
            }
        }
        Command::Get {
            database,
            mut credentials,
            title,
            user,
            group,
        } => {
            let db = unlock(&database, &mut credentials, &config).await?;
            let group = group.as_deref();
            let found = match user.as_deref() {
                Some(user) => db
                    .get_password(group, &title, user)
                    .map(|password| println!("{}", password)),
                None => db
                    .get_user_and_password(group, &title)
                    .map(|(user, password)| {
                        println!("user: {}", user);
                        println!("password: {}", password);
                    }),
            };
            if found.is_none() {
                eprintln!("No matching entry for '{}'", title);
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Header { database } => {
            let data = read_file(&database)?;
            let header = kdbx_core::read_header(&data)
                .with_context(|| format!("Failed to read header of {}", database.display()))?;
            print_header(&mut std::io::stdout().lock(), &header)?;
        }
        Command::Tree {
            database,
            mut credentials,
        } => {
            let db = unlock(&database, &mut credentials, &config).await?;
            println!("{}", serde_json::to_string_pretty(&db.group_tree())?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Takes the password out of `credentials` so it is wiped once the key is built
fn composite_key(credentials: &mut Credentials) -> anyhow::Result<CompositeKey> {
    let password = match credentials.password.take() {
        Some(password) => Zeroizing::new(password),
        None => Zeroizing::new(
            rpassword::prompt_password("Password: ").context("Failed to read password")?,
        ),
    };
    let mut key = CompositeKey::new().with_password(&password);
    if let Some(path) = &credentials.keyfile {
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open key file {}", path.display()))?;
        key = key.with_keyfile(&mut file)?;
    }
    Ok(key)
}

/// Open `path`, cancelling key derivation on Ctrl-C
async fn unlock(
    path: &Path,
    credentials: &mut Credentials,
    config: &Config,
) -> anyhow::Result<Database> {
    let data = read_file(path)?;
    let key = composite_key(credentials)?;

    let cancel = CancelToken::new();
    tokio::select! {
        result = Database::open_async(data, key, config.kdf, cancel.clone()) => {
            result.with_context(|| format!("Failed to open {}", path.display()))
        }
        Ok(()) = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, cancelling key derivation");
            cancel.cancel();
            anyhow::bail!("Interrupted while unlocking {}", path.display())
        }
    }
}

fn print_header<W: Write>(out: &mut W, header: &kdbx_core::DatabaseHeader) -> std::io::Result<()> {
    writeln!(out, "version: {}", header.version)?;
    writeln!(out, "cipher: {:?}", header.cipher)?;
    writeln!(out, "compression: {:?}", header.compression)?;
    match &header.kdf {
        KdfParams::Aes { rounds, .. } => {
            writeln!(out, "kdf: AES-KDF")?;
            writeln!(out, "rounds: {}", rounds)?;
        }
        KdfParams::Argon2 {
            variant,
            memory_bytes,
            iterations,
            parallelism,
            version,
            ..
        } => {
            writeln!(out, "kdf: {:?}", variant)?;
            writeln!(out, "memory: {} KiB", memory_bytes / 1024)?;
            writeln!(out, "iterations: {}", iterations)?;
            writeln!(out, "parallelism: {}", parallelism)?;
            writeln!(out, "argon2 version: {:#x}", version)?;
        }
    }
    if let Some(legacy) = &header.legacy {
        writeln!(out, "inner stream: {:?}", legacy.inner_stream)?;
    }
    Ok(())
}
