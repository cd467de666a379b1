use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};
use seqstore::{Result, Store};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "maintenance CLI for a sequential record store", long_about = None)]
struct Opts {
    /// Store directory.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add or overwrite an identifier's payload, read from stdin.
    Add { identifier: String },
    /// Print an identifier's payload to stdout.
    Get { identifier: String },
    /// Delete an identifier.
    Delete { identifier: String },
    /// List live identifiers in key-ascending (last-write) order.
    Iter,
    /// Compact the record log down to the live identifier set.
    Gc,
    /// Export the live set to a file.
    Export { path: PathBuf },
    /// Import items from a previously exported file.
    Import { path: PathBuf },
    /// Print identifier count and on-disk size.
    Stat,
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    if let Err(e) = run() {
        error!("{}", e);
        exit(1);
    }
}

fn run() -> Result<()> {
    let opts = Opts::parse();
    let mut store = Store::open(&opts.dir)?;
    info!("opened store at {}", opts.dir.display());

    match opts.command {
        Command::Add { identifier } => {
            let mut data = Vec::new();
            std::io::Read::read_to_end(&mut std::io::stdin(), &mut data)?;
            store.add(&identifier, &data)?;
            store.commit()?;
        }
        Command::Get { identifier } => {
            let data = store.get(&identifier)?;
            std::io::Write::write_all(&mut std::io::stdout(), &data)?;
        }
        Command::Delete { identifier } => {
            store.delete(&identifier)?;
            store.commit()?;
        }
        Command::Iter => {
            for identifier in store.iter_keys()? {
                println!("{}", identifier?);
            }
        }
        Command::Gc => {
            store.gc(None, true)?;
        }
        Command::Export { path } => {
            store.export(&path)?;
        }
        Command::Import { path } => {
            store.import_from(&path)?;
        }
        Command::Stat => {
            println!("identifiers: {}", store.length()?);
            println!("size_on_disk: {}", store.size_on_disk()?);
        }
    }

    store.close()?;
    Ok(())
}
