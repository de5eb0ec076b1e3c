use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use nvr::{NvrApp, NvrConfig};

#[derive(Parser, Debug)]
#[command(name = "nvr")]
#[command(about = "Network video recorder media core")]
#[command(version)]
#[command(
    long_about = "Network video recorder media core: ingests IP cameras over RTSP, \
serves them as HLS to browsers, and runs per-camera object detection pipelines \
that trigger recordings."
)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "nvr.toml",
        help = "Path to TOML configuration file"
    )]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(
        long,
        help = "Validate configuration file and exit without starting the system"
    )]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(
        long,
        value_name = "FORMAT",
        help = "Log output format: json, pretty, or compact"
    )]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting NVR media core v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match NvrConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate()?;

    let app = NvrApp::new(config).map_err(|e| {
        error!("Failed to initialize: {}", e);
        e
    })?;

    setup_signal_handlers(app.cancellation_token());

    app.run().await.map_err(|e| {
        error!("System error during execution: {}", e);
        e
    })?;

    info!("NVR exited");
    Ok(())
}

fn setup_signal_handlers(token: tokio_util::sync::CancellationToken) {
    // SIGTERM (systemd stop) - Unix only
    #[cfg(unix)]
    {
        let token = token.clone();
        tokio::spawn(async move {
            if let Ok(mut sigterm) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            {
                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM signal");
                    token.cancel();
                }
            }
        });
    }

    // SIGINT (Ctrl+C) - cross-platform
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT signal (Ctrl+C)");
            token.cancel();
        }
    });
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{
        fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    };

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nvr={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        Some("compact") => fmt::layer().compact().with_target(false).boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# NVR Configuration File");
    println!("# These are the built-in defaults; override in TOML or env vars");
    println!();

    let default_config = NvrConfig::default();
    match toml::to_string_pretty(&default_config) {
        Ok(toml_str) => println!("{}", toml_str),
        Err(e) => eprintln!("Failed to render default config: {}", e),
    }
}
