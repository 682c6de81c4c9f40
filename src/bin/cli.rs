use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_serde_derive::ClapSerde;

use voxtral_runner::cache::init_cache_env;
use voxtral_runner::config::Config;
use voxtral_runner::inference::params::{
    Language, Mode, ModelSize, PredictOptions, PredictRequest, TokenBudget, DEFAULT_PROMPT,
    LANGUAGE_TABLE,
};
use voxtral_runner::inference::voxtral;
use voxtral_runner::telemetry::init_telemetry;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = "VoxtralRunner.toml")]
    config_file: String,

    #[command(subcommand)]
    cmd: Commands,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[derive(Subcommand)]
enum Commands {
    /// Load both models and run a single prediction
    Predict {
        /// Audio file to process
        audio: PathBuf,

        #[clap(long, value_enum, default_value_t = Mode::default())]
        mode: Mode,

        /// Question or instruction for understanding mode
        #[clap(long, default_value = DEFAULT_PROMPT)]
        prompt: String,

        /// Audio language for transcription
        #[clap(long, value_enum, default_value_t = Language::default())]
        language: Language,

        #[clap(long, value_enum, default_value_t = ModelSize::default())]
        model_size: ModelSize,

        /// Maximum number of generated tokens, between 50 and 1000
        #[clap(long, default_value_t = TokenBudget::default().get())]
        max_tokens: usize,
    },
    /// List the selectable languages and their codes
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    match args.cmd {
        Commands::Languages => {
            println!("Auto-detect\t(en)");
            for (language, code) in LANGUAGE_TABLE {
                println!("{language}\t{code}");
            }
        }
        Commands::Predict {
            audio,
            mode,
            prompt,
            language,
            model_size,
            max_tokens,
        } => {
            init_telemetry(None, true)?;
            let options = PredictOptions {
                mode,
                prompt,
                language,
                model_size,
                max_tokens: TokenBudget::try_from(max_tokens)?,
            };

            let config = match Config::from_toml(&args.config_file) {
                Ok(conf) => conf.merge(&mut args.opt_config),
                Err(_) => Config::default().merge(&mut args.opt_config),
            };
            init_cache_env(Path::new(&config.cache_dir))?;

            let output = tokio::task::spawn_blocking(move || {
                let context = voxtral::setup(&config)?;
                context.predict(&PredictRequest::new(audio, options))
            })
            .await??;
            println!("{output}");
        }
    }
    Ok(())
}
