//! TPM NV Store - a key-value store on TPM 2.0 NV indices.
//!
//! Talks to the TPM through tpm2-tools, or to a file-backed emulator with
//! `--simulator`.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tpm_nvstore::device::{MemoryDevice, NvDevice, Tpm2ToolsDevice};
use tpm_nvstore::{Error, NvIndex, NvStore, StoreConfig};

#[derive(Parser)]
#[command(name = "tpm-nvstore")]
#[command(author, version, about, long_about = None)]
#[command(
    about = "Key-value store on TPM 2.0 NV indices",
    long_about = "Stores small values in TPM 2.0 non-volatile indices. Keys are NV indices in the user band [0x01800000, 0x01BFFFFF]; every write is verified by reading it back."
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalOpts {
    /// Use a file-backed emulated TPM instead of tpm2-tools
    #[arg(long, global = true)]
    simulator: Option<PathBuf>,

    /// Store configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory containing the tpm2-tools binaries
    #[arg(long, global = true)]
    tools_dir: Option<PathBuf>,

    /// TCTI passed to tpm2-tools (e.g. device:/dev/tpmrm0)
    #[arg(long, global = true)]
    tcti: Option<String>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the TPM answers commands
    Check,

    /// List defined NV indices
    List {
        /// Include indices outside the user band
        #[arg(long)]
        all: bool,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the public metadata of an NV index
    Show {
        /// NV index (hex or decimal)
        index: NvIndex,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show TPM NV limits and usage
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read the value stored at an NV index
    Read {
        /// NV index (hex or decimal)
        index: NvIndex,

        /// Prompt for the index password
        #[arg(long)]
        password: bool,

        /// Print the value hex-encoded
        #[arg(long, conflicts_with = "output")]
        hex: bool,

        /// Output file (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Store a value at a new NV index
    Write {
        /// NV index (hex or decimal)
        index: NvIndex,

        /// Input file to store
        #[arg(long, conflicts_with = "data")]
        input: Option<PathBuf>,

        /// String data to store
        #[arg(long, conflicts_with = "input")]
        data: Option<String>,

        /// Protect the index with a password (prompted)
        #[arg(long)]
        password: bool,
    },

    /// Delete an NV index
    Delete {
        /// NV index (hex or decimal)
        index: NvIndex,

        /// Prompt for a password to authorize the delete
        #[arg(long)]
        password: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        if let Some(index) = e.downcast_ref::<Error>().and_then(Error::orphaned_index) {
            eprintln!(
                "NV index {} is still defined. Remove it with `tpm-nvstore delete {}` before retrying.",
                index, index
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(default_level));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.global.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StoreConfig::default(),
    };

    match &cli.global.simulator {
        Some(state) => {
            let device = MemoryDevice::load(state)
                .with_context(|| format!("loading simulator state {}", state.display()))?;
            let mut store = NvStore::with_config(device, config)?;
            let result = dispatch(&mut store, cli.command);
            // Persist even on failure: a failed write can leave an index defined.
            store
                .device()
                .save(state)
                .with_context(|| format!("saving simulator state {}", state.display()))?;
            result
        }
        None => {
            let mut device = Tpm2ToolsDevice::new();
            if let Some(dir) = &cli.global.tools_dir {
                device = device.with_tools_dir(dir);
            }
            if let Some(tcti) = &cli.global.tcti {
                device = device.with_tcti(tcti);
            }
            let mut store = NvStore::with_config(device, config)?;
            dispatch(&mut store, cli.command)
        }
    }
}

fn dispatch<D: NvDevice>(store: &mut NvStore<D>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Check => cmd_check(store),
        Commands::List { all, json } => cmd_list(store, all, json),
        Commands::Show { index, json } => cmd_show(store, index, json),
        Commands::Info { json } => cmd_info(store, json),
        Commands::Read {
            index,
            password,
            hex,
            output,
        } => cmd_read(store, index, password, hex, output),
        Commands::Write {
            index,
            input,
            data,
            password,
        } => cmd_write(store, index, input, data, password),
        Commands::Delete { index, password } => cmd_delete(store, index, password),
    }
}

fn prompt_password(prompt: &str) -> io::Result<String> {
    rpassword::prompt_password(prompt)
}

fn prompt_optional(enabled: bool, prompt: &str) -> anyhow::Result<Option<String>> {
    if !enabled {
        return Ok(None);
    }
    let password = prompt_password(prompt).context("reading password")?;
    Ok(Some(password))
}

fn cmd_check<D: NvDevice>(store: &mut NvStore<D>) -> anyhow::Result<()> {
    store.sanity_check()?;
    println!("TPM is reachable via {}", store.device().name());
    Ok(())
}

fn cmd_list<D: NvDevice>(store: &mut NvStore<D>, all: bool, json: bool) -> anyhow::Result<()> {
    let indices = if all { store.list()? } else { store.list_user()? };

    if json {
        println!("{}", serde_json::to_string_pretty(&indices)?);
    } else if indices.is_empty() {
        println!("(empty)");
    } else {
        for index in indices {
            println!("{}", index);
        }
    }

    Ok(())
}

fn cmd_show<D: NvDevice>(store: &mut NvStore<D>, index: NvIndex, json: bool) -> anyhow::Result<()> {
    let meta = store.metadata(index)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&meta)?);
        return Ok(());
    }

    println!("NV index:     {}", meta.index);
    println!("Size:         {} bytes", meta.size);
    let attributes: Vec<&str> = meta.attributes.iter().map(String::as_str).collect();
    println!("Attributes:   {}", attributes.join("|"));
    if let Some(alg) = &meta.name_alg {
        println!("Name alg:     {}", alg);
    }

    Ok(())
}

fn cmd_info<D: NvDevice>(store: &mut NvStore<D>, json: bool) -> anyhow::Result<()> {
    let info = store.info()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("TPM NV Information");
    println!("==================");
    println!("Device:             {}", store.device().name());
    println!("User band:          [{}, {}]", info.low, info.high);
    println!();
    println!("Limits:");
    println!("  Max index size:   {} bytes", info.limits.max_value_size);
    println!("  Max transfer:     {} bytes", info.limits.max_transfer_size);
    println!("  Max value:        {} bytes", info.max_value_size);
    println!();
    println!("Usage:");
    println!("  Defined indices:  {}", info.total_slots);
    println!("  User indices:     {}", info.user_slots);
    println!("  User bytes:       {} bytes", info.user_bytes);
    println!(
        "  Guaranteed total: {} bytes (free space is not reported by the TPM)",
        info.guaranteed_capacity
    );

    Ok(())
}

fn cmd_read<D: NvDevice>(
    store: &mut NvStore<D>,
    index: NvIndex,
    password: bool,
    as_hex: bool,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let password = prompt_optional(password, "Password: ")?;
    let data = store.read(index, password.as_deref())?;

    match output {
        Some(path) => {
            write_output(&path, &data)?;
            println!("Wrote {} bytes to {}", data.len(), path.display());
        }
        None if as_hex => println!("{}", hex::encode(&data)),
        None => io::stdout().write_all(&data)?,
    }

    Ok(())
}

fn write_output(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))
}

fn cmd_write<D: NvDevice>(
    store: &mut NvStore<D>,
    index: NvIndex,
    input: Option<PathBuf>,
    data: Option<String>,
    password: bool,
) -> anyhow::Result<()> {
    let content = match (input, data) {
        (Some(path), None) => {
            std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?
        }
        (None, Some(s)) => s.into_bytes(),
        (None, None) => {
            let mut buffer = Vec::new();
            io::stdin().read_to_end(&mut buffer)?;
            buffer
        }
        (Some(_), Some(_)) => unreachable!(),
    };

    let password = if password {
        let password = prompt_password("Password: ")?;
        let confirm = prompt_password("Confirm password: ")?;
        if password != confirm {
            bail!("passwords do not match");
        }
        Some(password)
    } else {
        None
    };

    store.allocate_and_write(index, &content, password.as_deref())?;
    println!("Wrote {} bytes to {}", content.len(), index);

    Ok(())
}

fn cmd_delete<D: NvDevice>(store: &mut NvStore<D>, index: NvIndex, password: bool) -> anyhow::Result<()> {
    let password = prompt_optional(password, "Password: ")?;
    store.delete(index, password.as_deref())?;
    println!("Deleted {}", index);

    Ok(())
}
