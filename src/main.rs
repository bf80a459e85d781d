use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;

use hydrafuzz::config::FuzzConfig;
use hydrafuzz::fuzzer::Fuzzer;
use hydrafuzz::logger;

#[derive(Parser)]
#[command(author, version, about = "Coverage-guided mutation fuzzer for EVM smart contracts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// compilation platform: direct-compiler | project-toolchain
        platform: Option<String>,
        #[arg(long, default_value = "hydrafuzz.json")]
        out: PathBuf,
    },
    /// Run a fuzzing campaign
    Fuzz {
        /// path to the configuration file
        #[arg(default_value = "hydrafuzz.json")]
        config: PathBuf,
    },
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Init { platform, out } => {
            let config = FuzzConfig::default_for(platform.as_deref())?;
            config.write(&out)?;
            println!("wrote default configuration to {}", out.display());
            Ok(0)
        }
        Commands::Fuzz { config } => {
            let config = FuzzConfig::load(&config)?;
            let fuzzer = Fuzzer::new(config)?;
            let report = fuzzer.run()?;
            Ok(report.exit_code)
        }
    }
}

fn main() -> ExitCode {
    logger::init();
    match run(Cli::parse()) {
        // 0 = success, 7 = test case failed; 2-5 stay reserved
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}
