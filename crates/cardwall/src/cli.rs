use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use poolconfig::StaticRenderMode;

#[derive(Parser, Debug)]
#[command(
    name = "cardwall",
    author,
    version,
    about = "Simulate a page of animated cards sharing a bounded context pool"
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Pool configuration file; defaults to `cardwall.toml` in the config directory.
    #[arg(long, value_name = "PATH", env = "CARDWALL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of cards on the simulated page.
    #[arg(long, value_name = "N", default_value_t = 24)]
    pub cards: usize,

    /// Number of simulated frames to run.
    #[arg(long, value_name = "N", default_value_t = 600)]
    pub ticks: u64,

    /// Simulated time between frames (e.g. `16ms`).
    #[arg(long, value_name = "DURATION", default_value = "16ms", value_parser = parse_duration_arg)]
    pub tick: Duration,

    /// Seed for the scroll and pointer workload.
    #[arg(long, value_name = "SEED", default_value_t = 1)]
    pub seed: u64,

    /// Override `pool.size`.
    #[arg(long, value_name = "N")]
    pub pool_size: Option<usize>,

    /// Override `static_render.mode`.
    #[arg(long, value_enum, value_name = "MODE")]
    pub mode: Option<ModeArg>,

    /// Override `static_render.batch_size`.
    #[arg(long, value_name = "N")]
    pub batch_size: Option<usize>,

    /// Override `pool.borrow_timeout` (e.g. `2s`).
    #[arg(long, value_name = "DURATION", value_parser = parse_duration_arg)]
    pub borrow_timeout: Option<Duration>,

    /// Rendering backend used for pool slots.
    #[arg(long, value_enum, default_value_t = BackendArg::Software)]
    pub backend: BackendArg,

    /// Write every card's snapshot as PNG into this directory.
    #[arg(long, value_name = "DIR")]
    pub snapshots: Option<PathBuf>,

    /// Print the final report as JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Inspect or create the pool configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Print the resolved configuration directory and file.
    Where,
    /// Validate a configuration file and print the effective settings.
    Check {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
    /// Write a default configuration file if none exists.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Sequential,
    Batched,
}

impl From<ModeArg> for StaticRenderMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Sequential => StaticRenderMode::Sequential,
            ModeArg::Batched => StaticRenderMode::Batched,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendArg {
    /// CPU surfaces; always available.
    Software,
    /// Headless wgpu devices (requires the `wgpu` feature).
    Wgpu,
}

pub fn parse() -> Cli {
    Cli::parse()
}

fn parse_duration_arg(value: &str) -> Result<Duration, String> {
    poolconfig::parse_duration(value).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_without_arguments() {
        let cli = Cli::try_parse_from(["cardwall"]).unwrap();
        assert_eq!(cli.run.cards, 24);
        assert_eq!(cli.run.tick, Duration::from_millis(16));
        assert_eq!(cli.run.backend, BackendArg::Software);
        assert!(cli.command.is_none());
    }

    #[test]
    fn overrides_and_subcommands_parse() {
        let cli = Cli::try_parse_from([
            "cardwall",
            "--pool-size",
            "3",
            "--mode",
            "batched",
            "--borrow-timeout",
            "250ms",
            "config",
            "check",
            "wall.toml",
        ])
        .unwrap();
        assert_eq!(cli.run.pool_size, Some(3));
        assert_eq!(cli.run.mode, Some(ModeArg::Batched));
        assert_eq!(cli.run.borrow_timeout, Some(Duration::from_millis(250)));
        match cli.command {
            Some(Command::Config {
                action: ConfigCommand::Check { path },
            }) => assert_eq!(path, Some(PathBuf::from("wall.toml"))),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(Cli::try_parse_from(["cardwall", "--tick", "soon"]).is_err());
    }
}
