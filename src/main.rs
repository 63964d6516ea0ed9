//! nodus - request-dispatch core of a pluggable proxy platform

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use nodus::app::Instance;
use nodus::config::Config;
use nodus::error::Result;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&Config::example()).unwrap()
        );
        return Ok(());
    }

    // Load configuration before logging so the log section can shape the
    // subscriber.
    let (config, config_source) = match args.config {
        Some(path) => (Config::load(&path)?, path.display().to_string()),
        None => (Config::example(), "built-in example".to_string()),
    };

    // RUST_LOG overrides the configured level.
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("nodus v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Using config: {}", config_source);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let instance = Instance::from_config(&config)?;
        instance.start()?;

        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");
        instance.close()
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"nodus - request-dispatch core of a pluggable proxy platform

USAGE:
    nodus [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config            Print an example config
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    nodus -c config.json
    nodus --gen-config > config.json

ENVIRONMENT:
    RUST_LOG                Log level (trace, debug, info, warn, error)
    XRAY_CONE_DISABLED      "true" disables cone NAT behavior
"#
    );
}

fn print_version() {
    println!("nodus v{}", env!("CARGO_PKG_VERSION"));
    println!("Request-dispatch core of a pluggable proxy platform");
}
