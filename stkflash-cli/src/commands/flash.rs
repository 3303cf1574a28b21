//! Flash and bootloader version command implementations.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use std::path::Path;
use std::thread;
use std::time::Duration;
use stkflash::{
    DirStore, ImageStats, MemoryStore, NativePort, Port, Programmer, ProgrammerConfig,
    ResetSignal, SerialConfig,
};

use crate::config::Config;
use crate::{
    Cli, CliError, FlashOptions, get_port, resolve_baud, use_fancy_output, was_interrupted,
};

const INTERVAL_TICK: Duration = Duration::from_millis(100);

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Split an image path into a store rooted at its directory and the file name.
pub(crate) fn open_store(image: &Path) -> Result<(DirStore, String)> {
    let name = image
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CliError::Usage(format!("Invalid image path: {}", image.display())))?;
    let dir = image
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    Ok((DirStore::new(dir), name.to_string()))
}

/// Session settings: defaults, then config file, then command line.
pub(crate) fn session_config(config: &Config, options: &FlashOptions) -> Result<ProgrammerConfig> {
    let mut session = config.flash.apply(ProgrammerConfig::default());
    if let Some(page_size) = options.page_size {
        session.page_size = page_size;
    }
    if let Some(signal) = options.reset_signal {
        session.reset_signal = signal;
    }
    if options.no_reset {
        session.reset_signal = ResetSignal::None;
    }
    session.get_sync_probe = options.get_sync;
    session.validate()?;
    Ok(session)
}

fn open_port(cli: &Cli, config: &mut Config) -> Result<NativePort> {
    let port_name = get_port(cli, config)?;
    let baud = resolve_baud(cli, config);
    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {baud} baud",
            style("🔌").cyan(),
            style(&port_name).bold()
        );
    }
    NativePort::open(&SerialConfig::new(&port_name, baud))
        .with_context(|| format!("Failed to open {port_name}"))
}

fn progress_bar(quiet: bool, pages: usize) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(pages as u64);
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages")
    {
        pb.set_style(bar_style.progress_chars("#>-"));
    }
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Sleep between cycles, waking up early on Ctrl-C.
fn wait_interval(secs: u64) -> Result<()> {
    let ticks = secs * 10;
    for _ in 0..ticks {
        ensure_not_interrupted()?;
        thread::sleep(INTERVAL_TICK);
    }
    Ok(())
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    image: &Path,
    options: &FlashOptions,
) -> Result<()> {
    let session = session_config(config, options)?;
    let (store, name) = open_store(image)?;

    let stats = ImageStats::from_store(&store, &name)
        .with_context(|| format!("Failed to read image {}", image.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} {}: {} bytes in {} data records",
            style("📦").cyan(),
            image.display(),
            stats.data_bytes,
            stats.data_records
        );
    }
    if stats.has_foreign_payload() {
        warn!("Image has non-data records with payload; it is written as program data");
    }

    let pages = stats.pages(usize::from(session.page_size));
    let port = open_port(cli, config)?;
    let mut programmer = Programmer::new(port, store, session);
    programmer.load(&name)?;

    for cycle in 1..=options.repeat {
        ensure_not_interrupted()?;
        if options.repeat > 1 && !cli.quiet {
            eprintln!(
                "{} Cycle {cycle}/{}",
                style("⏳").yellow(),
                options.repeat
            );
        }

        let pb = progress_bar(cli.quiet, pages);
        let result = programmer.program_cycle(|done, total| {
            pb.set_length(total as u64);
            pb.set_position(done as u64);
        });
        pb.finish_and_clear();
        let report = result.with_context(|| format!("Programming {} failed", image.display()))?;

        if !cli.quiet {
            eprintln!(
                "{} Wrote {} bytes in {} pages",
                style("✓").green(),
                report.bytes,
                report.pages
            );
        }

        if cycle < options.repeat && options.interval_secs > 0 {
            debug!("Waiting {}s before the next cycle", options.interval_secs);
            wait_interval(options.interval_secs)?;
        }
    }

    programmer.port_mut().close()?;

    if !cli.quiet {
        eprintln!("\n{} Flashing complete", style("🎉").green().bold());
    }
    Ok(())
}

/// Version command implementation.
pub(crate) fn cmd_version(
    cli: &Cli,
    config: &mut Config,
    no_reset: bool,
    reset_signal: Option<ResetSignal>,
) -> Result<()> {
    let options = FlashOptions {
        no_reset,
        reset_signal,
        ..FlashOptions::default()
    };
    let session = session_config(config, &options)?;
    let port = open_port(cli, config)?;
    let mut programmer = Programmer::new(port, MemoryStore::new(), session);

    programmer.reset_target()?;
    programmer.sync()?;
    let (major, minor) = programmer.bootloader_version()?;
    programmer.app_start()?;
    programmer.port_mut().close()?;

    println!("{major}.{minor}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_open_store_splits_path() {
        let (store, name) = open_store(Path::new("build/Blink.ino.hex")).unwrap();
        assert_eq!(store.root(), Path::new("build"));
        assert_eq!(name, "Blink.ino.hex");

        let (store, name) = open_store(Path::new("Blink.hex")).unwrap();
        assert_eq!(store.root(), Path::new("."));
        assert_eq!(name, "Blink.hex");
    }

    #[test]
    fn test_open_store_rejects_directory_only() {
        assert!(open_store(&PathBuf::from("/")).is_err());
    }

    #[test]
    fn test_session_config_layers() {
        let mut config = Config::default();
        config.flash.page_size = Some(64);
        config.flash.reset_signal = Some(ResetSignal::Rts);

        let session = session_config(&config, &FlashOptions::default()).unwrap();
        assert_eq!(session.page_size, 64);
        assert_eq!(session.reset_signal, ResetSignal::Rts);

        let options = FlashOptions {
            page_size: Some(128),
            no_reset: true,
            ..FlashOptions::default()
        };
        let session = session_config(&config, &options).unwrap();
        assert_eq!(session.page_size, 128);
        assert_eq!(session.reset_signal, ResetSignal::None);
    }

    #[test]
    fn test_session_config_rejects_odd_page_from_file() {
        let mut config = Config::default();
        config.flash.page_size = Some(33);
        assert!(session_config(&config, &FlashOptions::default()).is_err());
    }
}
