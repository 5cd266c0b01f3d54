use std::process::ExitCode;

use clap::{Parser, Subcommand};
use db::Store;
use tracing_subscriber::EnvFilter;

/// Command-line driver for a vaultstore file: open or create a store, run
/// one transaction, and exit. Each invocation is its own transaction —
/// this binary is a demo and debugging tool, not a long-running server.
#[derive(Parser)]
#[command(name = "vaultstore", version, about)]
struct Cli {
    /// Path to the store file. Created if it doesn't exist.
    file: String,

    /// Comma-separated `key:value` store options, e.g. `readOnly:true`.
    #[arg(long, default_value = "")]
    options: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Set a key in a map, committing immediately.
    Put {
        map: String,
        key: String,
        value: String,
    },
    /// Read a key from a map under a fresh snapshot.
    Get { map: String, key: String },
    /// Remove a key from a map, committing immediately.
    Remove { map: String, key: String },
    /// List every key/value pair currently visible in a map.
    List { map: String },
    /// Flush dirty maps into a new chunk.
    Save,
    /// Reclaim blocks held by chunks past their retention window.
    Gc,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> db::Result<()> {
    let store = if std::path::Path::new(&cli.file).exists() {
        Store::open(&cli.file, &cli.options)?
    } else {
        Store::create(&cli.file, &cli.options)?
    };

    match cli.command {
        Command::Put { map, key, value } => {
            let handle = store.open_map(&map)?;
            let tx = store.begin(30_000, std::process::id() as u64)?;
            handle.put(&tx, key, Some(value))?;
            store.commit(&tx)?;
            store.save()?;
        }
        Command::Remove { map, key } => {
            let handle = store.open_map(&map)?;
            let tx = store.begin(30_000, std::process::id() as u64)?;
            handle.put(&tx, key, None)?;
            store.commit(&tx)?;
            store.save()?;
        }
        Command::Get { map, key } => {
            let handle = store.open_map(&map)?;
            let tx = store.begin(30_000, std::process::id() as u64)?;
            match handle.get(&tx, &key) {
                Some(value) => println!("{value}"),
                None => println!("(not found)"),
            }
            store.commit(&tx)?;
        }
        Command::List { map } => {
            let handle = store.open_map(&map)?;
            let tx = store.begin(30_000, std::process::id() as u64)?;
            for (key, value) in handle.snapshot(&tx) {
                println!("{key}\t{value}");
            }
            store.commit(&tx)?;
        }
        Command::Save => {
            match store.save()? {
                Some(chunk_id) => println!("saved chunk {chunk_id}"),
                None => println!("nothing to save"),
            }
        }
        Command::Gc => {
            let collected = store.collect_garbage()?;
            println!("collected {} chunk(s)", collected.len());
        }
    }
    Ok(())
}
