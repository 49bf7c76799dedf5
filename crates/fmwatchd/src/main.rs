use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use log::{info, LevelFilter};

use fmwatch::{
    CommandNotifier, CooldownNotifier, HistoryStore, JsonLinesStore, LogNotifier, Monitor,
    MonitorConfig, Notifier, NullStore,
};

mod app;
mod cli;
mod shutdown;

use cli::{Args, CliError};

/// Environment variable which overrides `radio.frequency`
const ENV_FREQUENCY: &str = "FMWATCH_FREQUENCY";

/// Environment variable which overrides `radio.gain`
const ENV_GAIN: &str = "FMWATCH_GAIN";

fn main() {
    match fmwatchd() {
        Ok(()) => {}
        Err(cli_error) => cli_error.exit(),
    }
}

fn fmwatchd() -> Result<(), CliError> {
    // Parse options and start logging
    let args = Args::try_parse()?;
    log_setup(&args);

    let config = build_config(&args, |key| std::env::var(key).ok())?;
    info!(
        "monitoring {} (gain {} dB, silence below {} dBFS for {} s)",
        config.radio.frequency,
        config.radio.gain,
        config.audio.silence_threshold_db,
        config.audio.silence_duration_secs
    );

    let notifier = notifier_setup(&config);
    let store = store_setup(&args)?;
    let monitor = Monitor::new(config, notifier, store).context("invalid configuration")?;

    let quit = shutdown::install_handler().context("unable to install signal handlers")?;

    match args.read_metadata {
        Some(secs) => app::read_metadata(&monitor, Duration::from_secs(secs))?,
        None => app::run(
            &monitor,
            &quit,
            Duration::from_secs(args.status_interval),
            args.quiet,
        )?,
    }

    Ok(())
}

fn log_setup(args: &Args) {
    if args.quiet {
        // no logging
        return;
    } else if std::env::var_os("RUST_LOG").is_none() {
        // parameter controls
        let log_filter = match args.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        pretty_env_logger::formatted_builder()
            .filter_module("fmwatch", log_filter)
            .filter_module("fmwatchd", log_filter)
            .init();
    } else {
        // environment controls
        pretty_env_logger::init();
    }
}

// Configuration, from lowest to highest precedence: defaults,
// --config file, environment, command line
fn build_config<F>(args: &Args, env: F) -> Result<MonitorConfig, anyhow::Error>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match &args.config {
        Some(path) => MonitorConfig::load(path)
            .with_context(|| format!("unable to load --config \"{}\"", path.display()))?,
        None => MonitorConfig::default(),
    };

    if let Some(freq) = env(ENV_FREQUENCY) {
        config.radio.frequency = freq;
    }
    if let Some(gain) = env(ENV_GAIN) {
        config.radio.gain = gain
            .trim()
            .parse()
            .map_err(|_| anyhow!("{} is not a number: \"{}\"", ENV_GAIN, gain))?;
    }

    if let Some(freq) = &args.frequency {
        config.radio.frequency = freq.clone();
    }
    if let Some(gain) = args.gain {
        config.radio.gain = gain;
    }
    if !args.alert_hook.is_empty() {
        config.alerts.command = args.alert_hook.clone();
    }

    config.validate()?;
    Ok(config)
}

fn notifier_setup(config: &MonitorConfig) -> CooldownNotifier<Box<dyn Notifier>> {
    let inner: Box<dyn Notifier> =
        match CommandNotifier::from_argv(&config.alerts.command, &config.radio.frequency) {
            Some(hook) => {
                info!("alert hook: {:?}", config.alerts.command);
                Box::new(hook)
            }
            None => {
                info!("no alert hook; alerts will only be logged");
                Box::new(LogNotifier::default())
            }
        };

    CooldownNotifier::new(inner, config.cooldown()).with_enabled(config.alerts.enabled)
}

fn store_setup(args: &Args) -> Result<Box<dyn HistoryStore>, anyhow::Error> {
    match &args.history {
        Some(path) => {
            let store = JsonLinesStore::open(path)
                .with_context(|| format!("unable to open --history \"{}\"", path.display()))?;
            info!("recording history to \"{}\"", store.path().display());
            Ok(Box::new(store))
        }
        None => Ok(Box::new(NullStore::default())),
    }
}
