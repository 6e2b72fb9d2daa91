use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use ucdb2cobertura::cli;

/// ucdb2cobertura — Convert UCIS/UCDB statement coverage into Cobertura XML.
#[derive(Parser)]
#[command(name = "ucdb2cobertura", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export statement coverage from a UCDB file as a Cobertura report.
    Export {
        /// UCDB file in UCIS format (XML).
        #[arg(long)]
        ucdb: PathBuf,

        /// Cobertura code coverage file (XML) to write.
        #[arg(long)]
        cobertura: PathBuf,

        /// Merge statements replicated across instances of the same design unit.
        #[arg(long)]
        merge_instances: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Export {
            ucdb,
            cobertura,
            merge_instances,
        } => {
            // A missing input file is an operator mistake, reported on the
            // same exit code clap uses for usage errors.
            if !ucdb.exists() {
                eprintln!("UCDB file '{}' not found.", ucdb.display());
                return ExitCode::from(2);
            }

            match cli::cmd_export(&ucdb, &cobertura, merge_instances) {
                Ok(output) => {
                    print!("{output}");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("Error: {err:#}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
