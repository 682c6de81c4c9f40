use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use clap_serde_derive::ClapSerde;
use tokio::net::TcpListener;
use tracing::{error, info};

use voxtral_runner::cache::{init_cache_env, upload_dir};
use voxtral_runner::config::Config;
use voxtral_runner::inference::voxtral;
use voxtral_runner::server::{router, AppState};
use voxtral_runner::telemetry::init_telemetry;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEFAULT_CONFIG_FILE: &str = "VoxtralRunner.toml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// OTLP collector endpoint for traces and metrics
    #[arg(long, env)]
    otlp_endpoint: Option<String>,

    /// Keep logging to the console while exporting to an OTLP endpoint
    #[arg(long, env)]
    console: bool,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            error!($fmt $(, $arg)*);
            std::process::exit($code);
        }
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();
    init_telemetry(args.otlp_endpoint.as_deref(), args.console)?;

    let config = match Config::from_toml(&args.config_file) {
        Ok(conf) => conf.merge(&mut args.opt_config),
        Err(err) => {
            if args.config_file == DEFAULT_CONFIG_FILE {
                Config::default().merge(&mut args.opt_config)
            } else {
                exit_err!(
                    1,
                    "Failed to read configuration file {} with error: {}",
                    args.config_file,
                    err
                );
            }
        }
    };

    let cache_dir = Path::new(&config.cache_dir).to_path_buf();
    if let Err(err) = init_cache_env(&cache_dir) {
        exit_err!(1, "Failed to prepare model cache: {:#}", err);
    }
    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    // Serving starts only once both models are resident
    let setup_config = config.clone();
    let context = match tokio::task::spawn_blocking(move || voxtral::setup(&setup_config)).await? {
        Ok(context) => context,
        Err(err) => exit_err!(1, "Failed to load models: {:#}", err),
    };

    let state = AppState::new(Arc::new(context), upload_dir(&cache_dir))?;
    let router = router(state, config.max_body_size);

    let listener = TcpListener::bind(format!("{}:{}", config.address, config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}
