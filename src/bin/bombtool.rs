//! persistcache bomb file tool
//!
//! Inspects crash-recovery files without knowing the record type.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use persistcache::codec::{inspect_ops, RawOp};
use persistcache::{bomb, OpKind};
use tracing_subscriber::{fmt, EnvFilter};

/// Bomb file inspector
#[derive(Parser, Debug)]
#[command(name = "bombtool")]
#[command(about = "Inspect persistcache bomb files")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a bomb file and print op counts per kind
    Verify {
        /// Path to the .bomb file
        file: PathBuf,
    },

    /// List every op in a bomb file
    Dump {
        /// Path to the .bomb file
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    let (file, dump) = match &args.command {
        Commands::Verify { file } => (file, false),
        Commands::Dump { file } => (file, true),
    };

    let ops = match bomb::read_file(file).and_then(|payload| inspect_ops(&payload)) {
        Ok(ops) => ops,
        Err(e) => {
            tracing::error!(path = %file.display(), error = %e, "invalid bomb file");
            eprintln!("{}: {}", file.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if dump {
        print_dump(&ops);
    } else {
        print_summary(file, &ops);
    }
    ExitCode::SUCCESS
}

fn print_summary(file: &Path, ops: &[RawOp]) {
    println!("{}: ok, {} ops", file.display(), ops.len());
    for kind in [OpKind::Insert, OpKind::Update, OpKind::Delete, OpKind::Unload] {
        let count = ops.iter().filter(|op| op.kind == kind).count();
        println!("  {:<8} {}", kind.name(), count);
    }
}

fn print_dump(ops: &[RawOp]) {
    println!("{:>6}  {:<8} {:>6} {:>8}", "#", "op", "fields", "bytes");
    for (i, op) in ops.iter().enumerate() {
        println!(
            "{:>6}  {:<8} {:>6} {:>8}",
            i,
            op.kind.name(),
            op.field_count(),
            op.record_len
        );
    }
}
