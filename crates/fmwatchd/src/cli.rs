use std::fmt::Display;
use std::path::PathBuf;

use clap::{error::ErrorKind, value_parser, CommandFactory, Parser};

const USAGE_SHORT: &str = r#"
This program tunes a software-defined radio to one FM broadcast station and watches it. If the station stays silent for too long, an alert is raised.

See --help for more details.

ALWAYS TEST YOUR ALERTING SETUP!
"#;

const USAGE_LONG: &str = r#"
This program tunes a software-defined radio to one FM broadcast station and watches it. If the station stays silent for too long, an alert is raised.

The radio is driven by rtl_fm. RDS metadata is decoded by redsea, and audio is encoded by sox. All three must be installed. Settings live in a TOML --config file; see the README for every key.

    fmwatchd --config /etc/fmwatch.toml -v

Arguments which follow "--" will be used to spawn an alert hook for every alert. The hook runs with standard input closed and receives the following environment variables:

  FMWATCH_ALERT_TYPE="signal_lost" (or signal_recovered)
  FMWATCH_ALERT_TITLE="Signal lost"
  FMWATCH_ALERT_DETAILS="Level: -62.10 dB, duration: 30 s"
  FMWATCH_FREQUENCY="88.6M"
  FMWATCH_TIMESTAMP="1714557605" (UNIX timestamp)
  FMWATCH_LOCAL_TIME="01/05/2024 12:00:05"

    fmwatchd -- sh -c 'echo "$FMWATCH_ALERT_DETAILS" | mail -s "$FMWATCH_ALERT_TITLE" ops'

The hook must exit with status 0 within 30 seconds for the alert to count as delivered. Otherwise the alert is retried.

The environment variables FMWATCH_FREQUENCY and FMWATCH_GAIN, if set, override the --config file. Command-line options override both.

ALWAYS TEST YOUR ALERTING SETUP!
"#;

const OVERRIDES: &str = "Radio Overrides";

/// Top-level program arguments
#[derive(Parser, Clone, Debug)]
#[command(version)]
#[command(about, long_about = None)]
#[command(after_help = USAGE_SHORT, after_long_help = USAGE_LONG)]
#[command(max_term_width = 100)]
pub struct Args {
    /// Verbosity level (-vvv for more)
    #[arg(short, long, default_value_t = 0, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print NOTHING, not even status lines
    #[arg(short, long)]
    pub quiet: bool,

    /// Configuration file (TOML)
    ///
    /// Every setting has a default, so the file may be
    /// omitted entirely.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Append level and alert history to FILE (JSON lines)
    #[arg(long, value_name = "FILE")]
    pub history: Option<PathBuf>,

    /// Print a status line every SECS seconds (0 to disable)
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub status_interval: u64,

    /// Print the station's RDS metadata and exit
    ///
    /// Runs the radio for at most SECS seconds, or until both
    /// the station name and a radiotext have been received.
    #[arg(long, value_name = "SECS")]
    #[arg(value_parser = value_parser!(u64).range(1..=600))]
    pub read_metadata: Option<u64>,

    /// Tuning frequency, like "88.6M"
    #[arg(short, long)]
    #[arg(help_heading = OVERRIDES)]
    pub frequency: Option<String>,

    /// Tuner gain (dB)
    #[arg(short, long)]
    #[arg(help_heading = OVERRIDES)]
    pub gain: Option<f32>,

    /// Spawn alert hook for every alert. Optional.
    ///
    /// Arguments are provided VERBATIM to the hook without
    /// shell interpretation.
    #[arg(last = true)]
    pub alert_hook: Vec<String>,
}

/// A program-level error with exit code
#[derive(Debug)]
pub struct CliError {
    error: anyhow::Error,
    exit_code: i32,
}

impl CliError {
    /// Create new error with a custom exit code
    pub fn new(error: anyhow::Error, code: i32) -> CliError {
        CliError {
            error,
            exit_code: code,
        }
    }

    /// Print this error to the terminal
    ///
    /// Errors from clap are printed verbatim. Other types of errors
    /// are printed indirectly via clap's fancy formatter.
    pub fn print(&self) -> std::io::Result<()> {
        if let Some(e) = self.error.downcast_ref::<clap::Error>() {
            e.print()
        } else {
            Args::command()
                .error(ErrorKind::Format, self.to_string())
                .print()
        }
    }

    /// Print this error to the terminal and exit
    pub fn exit(&self) -> ! {
        drop(self.print());
        std::process::exit(self.exit_code);
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.error)
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> CliError {
        CliError::new(err, 1)
    }
}

impl From<clap::Error> for CliError {
    fn from(err: clap::Error) -> CliError {
        let code = if err.use_stderr() { 1 } else { 0 };
        CliError::new(err.into(), code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clap() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse() {
        let args = Args::try_parse_from([
            "fmwatchd",
            "-vv",
            "--config",
            "/etc/fmwatch.toml",
            "-f",
            "101.1M",
            "--",
            "mail",
            "-s",
            "alert",
        ])
        .expect("parse");
        assert_eq!(args.verbose, 2);
        assert_eq!(args.config, Some(PathBuf::from("/etc/fmwatch.toml")));
        assert_eq!(args.frequency.as_deref(), Some("101.1M"));
        assert_eq!(args.status_interval, 10);
        assert_eq!(args.alert_hook, vec!["mail", "-s", "alert"]);

        assert!(Args::try_parse_from(["fmwatchd", "--read-metadata", "0"]).is_err());
    }
}
