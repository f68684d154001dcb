//! Inspection tool for trees in a storage directory.
//!
//! ```text
//! sbtree <dir> stats <tree>   size, depth and page counts, after a full check
//! sbtree <dir> dump <tree>    every entry, one per line
//! ```
//!
//! Both commands read an `int -> long` tree. Configuration comes from the
//! `SBTREE_*` environment variables.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use sbtree::config::IndexConfig;
use sbtree::serialization::{IntegerSerializer, LongSerializer};
use sbtree::storage::Storage;
use sbtree::storage::btree::{NULL_BUCKET_FILE_EXTENSION, SBTree, TreeOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: sbtree <dir> stats|dump <tree>";

#[derive(Debug, Clone, Copy)]
enum Command {
    Stats,
    Dump,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sbtree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [directory, command, name] = args.as_slice() else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };
    let command = match command.as_str() {
        "stats" => Command::Stats,
        "dump" => Command::Dump,
        other => {
            eprintln!("unknown command '{other}'\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    match run(&PathBuf::from(directory), command, name) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(directory: &Path, command: Command, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = IndexConfig::from_env()?;
    let storage = Storage::open(directory, &config)?;

    let mut options = TreeOptions::default();
    if storage
        .cache()
        .file_exists(&format!("{name}{NULL_BUCKET_FILE_EXTENSION}"))
    {
        options = options.with_null_keys();
    }
    let tree = SBTree::new(&storage, name, IntegerSerializer, LongSerializer, options);
    tree.load()?;

    match command {
        Command::Stats => {
            let stats = tree.check_consistency()?;
            println!("size:       {}", stats.size);
            println!("depth:      {}", stats.depth);
            println!("pages:      {}", stats.pages);
            println!("leaf pages: {}", stats.leaf_pages);
        }
        Command::Dump => {
            if tree.options().null_keys_supported {
                if let Some(value) = tree.get_null()? {
                    println!("null\t{value}");
                }
            }
            for entry in tree.iterate_entries_major(&i32::MIN, true, true)? {
                let (key, value) = entry?;
                println!("{key}\t{value}");
            }
        }
    }

    tree.close()?;
    Ok(())
}
