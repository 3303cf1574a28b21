//! stkflash CLI - write Intel HEX images through an STK500 (optiboot) bootloader.
//!
//! ## Features
//!
//! - Program `.hex` images, optionally several times in a row
//! - Inspect images without a target attached
//! - Query the bootloader version
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use stkflash::ResetSignal;

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations and symbols should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Failure classes with their own exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or environment (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// stkflash - program AVR boards through an STK500 bootloader.
///
/// Environment variables:
///   STKFLASH_PORT              - Default serial port
///   STKFLASH_BAUD              - Default baud rate (default: 115200)
///   STKFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "stkflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "STKFLASH_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate of the bootloader.
    #[arg(short, long, global = true, env = "STKFLASH_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "STKFLASH_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    pub(crate) confirm_port: bool,

    /// Offer all ports during selection (including unknown types).
    #[arg(long, global = true)]
    pub(crate) list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Write an Intel HEX image to the target.
    Flash {
        /// Path to the .hex image.
        image: PathBuf,

        #[command(flatten)]
        options: FlashOptions,
    },

    /// Show statistics about an Intel HEX image.
    Info {
        /// Path to the .hex image.
        image: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Page size used for the page count.
        #[arg(long, value_parser = parse_page_size)]
        page_size: Option<u8>,
    },

    /// Query the bootloader software version.
    Version {
        /// Do not pulse the reset line before syncing.
        #[arg(long)]
        no_reset: bool,

        /// Control line wired to the target reset pin.
        #[arg(long, value_parser = parse_reset_signal)]
        reset_signal: Option<ResetSignal>,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Options of the `flash` command.
#[derive(clap::Args, Debug, Clone, Default)]
pub(crate) struct FlashOptions {
    /// Number of programming cycles.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub(crate) repeat: u32,

    /// Seconds to wait between cycles.
    #[arg(long, default_value_t = 0)]
    pub(crate) interval_secs: u64,

    /// Do not pulse the reset line before syncing.
    #[arg(long)]
    pub(crate) no_reset: bool,

    /// Control line wired to the target reset pin (dtr, rts, none).
    #[arg(long, value_parser = parse_reset_signal)]
    pub(crate) reset_signal: Option<ResetSignal>,

    /// Flash page size in bytes.
    #[arg(long, value_parser = parse_page_size)]
    pub(crate) page_size: Option<u8>,

    /// Send GET_SYNC probes instead of bare end-of-packet bytes.
    #[arg(long)]
    pub(crate) get_sync: bool,
}

/// Parse a reset signal name.
fn parse_reset_signal(s: &str) -> Result<ResetSignal, String> {
    s.parse::<ResetSignal>()
        .map_err(|_| format!("Invalid reset signal '{s}'. Expected one of: dtr, rts, none"))
}

/// Parse a page size: even, 2..=254 bytes.
fn parse_page_size(s: &str) -> Result<u8, String> {
    let size: u8 = s
        .trim()
        .parse()
        .map_err(|e| format!("Invalid page size: {e}"))?;
    if size == 0 || size % 2 != 0 {
        return Err(format!("Page size must be even and non-zero, got {size}"));
    }
    Ok(size)
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

/// Route Ctrl-C into the library's interrupt checker. A second Ctrl-C exits.
fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            std::process::exit(130);
        }
    });
    if let Err(e) = result {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    stkflash::set_interrupt_checker(was_interrupted);
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<stkflash::Error>() {
        Some(stkflash::Error::Cancelled) => 130,
        Some(stkflash::Error::DeviceNotFound | stkflash::Error::Config(_)) => 2,
        _ => 1,
    }
}

fn main() -> ExitCode {
    // NO_COLOR and TTY detection
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    debug!(
        "stkflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash { image, options } => {
            commands::flash::cmd_flash(cli, &mut config, image, options)
        },
        Commands::Info {
            image,
            json,
            page_size,
        } => commands::info::cmd_info(&config, image, *json, *page_size),
        Commands::Version {
            no_reset,
            reset_signal,
        } => commands::flash::cmd_version(cli, &mut config, *no_reset, *reset_signal),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Get serial port from CLI args, config, or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

/// Baud rate from CLI/env, then config, then the bootloader default.
pub(crate) fn resolve_baud(cli: &Cli, config: &Config) -> u32 {
    cli.baud
        .or(config.port.connection.baud)
        .unwrap_or(stkflash::port::DEFAULT_BAUD)
}
