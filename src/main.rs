//! Sandbox server entry point.

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use execbox::server;
use execbox::{SecurityLevel, ServerConfig};

/// Local multi-language code-execution sandbox over MCP stdio.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Start even when no container engine answers the initial ping
    #[arg(long, default_value = "false")]
    skip_engine_check: bool,

    /// Security level applied to every container: strict, standard, permissive
    #[arg(long, default_value = "standard")]
    security_level: String,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // MCP owns stdout for JSON-RPC; all logging goes to stderr. LOG_LEVEL
    // feeds the filter, --verbose overrides it.
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(format!("execbox={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("execbox v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::from_env();
    config.security_level = match args.security_level.as_str() {
        "strict" => SecurityLevel::Strict,
        "standard" => SecurityLevel::Standard,
        "permissive" => SecurityLevel::Permissive,
        other => {
            error!("Unknown security level: {}", other);
            std::process::exit(2);
        }
    };

    if args.skip_engine_check {
        warn!("Skipping engine reachability check (--skip-engine-check)");
    } else {
        match execbox::Engine::connect().await {
            Ok(engine) => {
                let version = engine
                    .version_string()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                info!("Container engine reachable (version {})", version);
            }
            Err(e) => {
                error!("No container engine reachable: {}", e);
                error!("Start Docker or Podman, or pass --skip-engine-check");
                std::process::exit(1);
            }
        }
    }

    let service = server::SandboxService::new(config).await?;

    // Serve until the client closes stdio or we receive ctrl-c
    let served = tokio::select! {
        result = server::run(std::sync::Arc::clone(&service)) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
            service.shutdown().await;
            Ok(())
        }
    };

    if let Err(e) = served {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
