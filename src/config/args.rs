//! CLI argument parsing using clap

use clap::{Parser, Subcommand};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Reference offset changes applied by `simulate` when none are given
pub const DEFAULT_STEPS: [PpmStep; 4] = [
    PpmStep {
        iteration: 25,
        ppm: 300.0,
    },
    PpmStep {
        iteration: 50,
        ppm: 150.0,
    },
    PpmStep {
        iteration: 80,
        ppm: -300.0,
    },
    PpmStep {
        iteration: 130,
        ppm: 0.0,
    },
];

/// swpll - software PLL clock recovery for serial audio links
///
/// Disciplines a local master clock to an external word clock by steering a
/// fractional PLL divider from reference-edge timestamps
#[derive(Parser, Debug)]
#[command(name = "swpll")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output to file
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Configuration file (default: ./swpll.toml, then the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the clock recovery loop against simulated hardware
    Simulate {
        /// Control iterations to run (0 = until Ctrl+C)
        #[arg(short, long, default_value = "150")]
        iterations: u64,

        /// Reference clock offset at start, in ppm
        #[arg(long, default_value = "0", allow_negative_numbers = true)]
        initial_ppm: f64,

        /// Change the reference offset at an iteration, as ITER:PPM (repeatable)
        #[arg(long = "step", value_name = "ITER:PPM")]
        steps: Vec<PpmStep>,

        /// Keep the reference fixed instead of using the default step schedule
        #[arg(long, conflicts_with = "steps")]
        steady: bool,

        /// Deliver timestamps through a sampler thread instead of directly
        #[arg(long)]
        threaded: bool,
    },

    /// Show divider table statistics
    Table {
        /// List every entry in the clamp range
        #[arg(long)]
        entries: bool,
    },

    /// Show or write the configuration
    Config {
        /// Print a commented sample configuration instead
        #[arg(long)]
        sample: bool,

        /// Write the effective configuration to a file
        #[arg(long, value_name = "FILE")]
        write: Option<PathBuf>,
    },
}

impl Args {
    /// Get the log level based on verbose/quiet flags
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }

    /// Whether the flags asked for a specific level
    pub fn has_level_flags(&self) -> bool {
        self.quiet || self.verbose > 0
    }
}

impl Default for Command {
    fn default() -> Self {
        Command::Simulate {
            iterations: 150,
            initial_ppm: 0.0,
            steps: Vec::new(),
            steady: false,
            threaded: false,
        }
    }
}

/// Reference offset change at a control iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PpmStep {
    pub iteration: u64,
    pub ppm: f64,
}

impl FromStr for PpmStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (iteration, ppm) = s
            .split_once(':')
            .ok_or_else(|| format!("expected ITER:PPM, got '{}'", s))?;
        let iteration = iteration
            .trim()
            .parse()
            .map_err(|e| format!("bad iteration '{}': {}", iteration, e))?;
        let ppm: f64 = ppm
            .trim()
            .parse()
            .map_err(|e| format!("bad ppm '{}': {}", ppm, e))?;
        if !ppm.is_finite() {
            return Err(format!("bad ppm '{}'", ppm));
        }
        Ok(Self { iteration, ppm })
    }
}

impl fmt::Display for PpmStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:+}", self.iteration, self.ppm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_step() {
        assert_eq!(
            "80:-300".parse::<PpmStep>().unwrap(),
            PpmStep {
                iteration: 80,
                ppm: -300.0
            }
        );
        assert_eq!("25: 12.5".parse::<PpmStep>().unwrap().ppm, 12.5);
        assert!("25".parse::<PpmStep>().is_err());
        assert!("x:1".parse::<PpmStep>().is_err());
        assert!("1:inf".parse::<PpmStep>().is_err());
    }

    #[test]
    fn test_simulate_args() {
        let args = Args::parse_from([
            "swpll",
            "-vv",
            "simulate",
            "--iterations",
            "40",
            "--initial-ppm",
            "-20",
            "--step",
            "10:150",
            "--step",
            "30:-151",
        ]);
        assert_eq!(args.log_level(), tracing::Level::TRACE);
        match args.command {
            Some(Command::Simulate {
                iterations,
                initial_ppm,
                steps,
                steady,
                threaded,
            }) => {
                assert_eq!(iterations, 40);
                assert_eq!(initial_ppm, -20.0);
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[1].ppm, -151.0);
                assert!(!steady);
                assert!(!threaded);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_threaded_flag() {
        let args = Args::parse_from(["swpll", "simulate", "--threaded", "--steady"]);
        assert!(matches!(
            args.command,
            Some(Command::Simulate {
                threaded: true,
                steady: true,
                ..
            })
        ));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::parse_from(["swpll", "table", "--entries", "-q", "--config", "x.toml"]);
        assert!(args.quiet);
        assert!(args.has_level_flags());
        assert_eq!(args.config, Some(PathBuf::from("x.toml")));
    }

    #[test]
    fn test_step_display() {
        assert_eq!(DEFAULT_STEPS[2].to_string(), "80:-300");
        assert_eq!(DEFAULT_STEPS[0].to_string(), "25:+300");
    }
}
