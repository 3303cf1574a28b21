//! STK500 programmer session.
//!
//! [`Programmer`] owns the serial port and the image storage and runs one
//! programming cycle at a time:
//!
//! ```text
//! load image -> reset target -> sync -> write pages -> leave progmode -> close image
//! ```
//!
//! Every wait for a target reply is bounded by [`ProgrammerConfig::ack_timeout`]
//! and can be abandoned through a [`CancelToken`] or the global interrupt
//! checker.
//!
//! ## Example
//!
//! ```rust,no_run
//! use stkflash::{MemoryStore, Programmer, ProgrammerConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let port = stkflash::NativePort::open_simple("/dev/ttyACM0", 115200)?;
//!         let store = MemoryStore::new().with_image("blink", ":00000001FF\n");
//!         let mut programmer = Programmer::new(port, store, ProgrammerConfig::default());
//!
//!         programmer.load("blink")?;
//!         for _ in 0..3 {
//!             programmer.program_cycle(|_, _| {})?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::image::{CHUNK_CAPACITY, HexDecoder, ImageStats, ImageStore};
use crate::port::Port;
use crate::protocol::stk500::{
    CRC_EOP, Command, CommandFrame, STK_INSYNC, STK_OK, STK_SW_MAJOR, STK_SW_MINOR,
};
use crate::target::reset::{PortResetLine, ResetSignal, pulse_reset};
use crate::{CancelToken, is_interrupted_requested};
use log::{debug, info, trace, warn};
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

/// Flash page size of ATmega328P-class targets, in bytes.
pub const DEFAULT_PAGE_SIZE: u8 = 128;

const DEFAULT_SYNC_POLL_DELAY: Duration = Duration::from_millis(10);
const DEFAULT_MAX_SYNC_ATTEMPTS: u32 = 100;
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_RESET_PULSES: u32 = 3;
const DEFAULT_RESET_INTERVAL: Duration = Duration::from_millis(500);

/// Tunables of a programming session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgrammerConfig {
    /// Bytes per page write. Must be even and non-zero.
    pub page_size: u8,
    /// Pause between a sync probe and reading its reply.
    pub sync_poll_delay: Duration,
    /// Sync probes sent before giving up.
    pub max_sync_attempts: u32,
    /// Upper bound of every wait for a target reply.
    pub ack_timeout: Duration,
    /// Control line wired to the target's reset pin.
    pub reset_signal: ResetSignal,
    /// Number of low-high reset pulses.
    pub reset_pulses: u32,
    /// Pause after each reset pulse.
    pub reset_interval: Duration,
    /// Prefix sync probes with `GET_SYNC` instead of sending the bare
    /// end-of-packet byte.
    pub get_sync_probe: bool,
}

impl Default for ProgrammerConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            sync_poll_delay: DEFAULT_SYNC_POLL_DELAY,
            max_sync_attempts: DEFAULT_MAX_SYNC_ATTEMPTS,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            reset_signal: ResetSignal::default(),
            reset_pulses: DEFAULT_RESET_PULSES,
            reset_interval: DEFAULT_RESET_INTERVAL,
            get_sync_probe: false,
        }
    }
}

impl ProgrammerConfig {
    /// Set the page size in bytes.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u8) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the reset line.
    #[must_use]
    pub fn with_reset_signal(mut self, signal: ResetSignal) -> Self {
        self.reset_signal = signal;
        self
    }

    /// Set the maximum number of sync probes.
    #[must_use]
    pub fn with_max_sync_attempts(mut self, attempts: u32) -> Self {
        self.max_sync_attempts = attempts;
        self
    }

    /// Set the reply timeout.
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the reset pulse count and spacing.
    #[must_use]
    pub fn with_reset_pulses(mut self, pulses: u32, interval: Duration) -> Self {
        self.reset_pulses = pulses;
        self.reset_interval = interval;
        self
    }

    /// Set the delay between a sync probe and its reply check.
    #[must_use]
    pub fn with_sync_poll_delay(mut self, delay: Duration) -> Self {
        self.sync_poll_delay = delay;
        self
    }

    /// Send `GET_SYNC` probes instead of bare end-of-packet bytes.
    #[must_use]
    pub fn with_get_sync_probe(mut self, enabled: bool) -> Self {
        self.get_sync_probe = enabled;
        self
    }

    /// Check the values a session depends on.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size % 2 != 0 {
            return Err(Error::Config(format!(
                "page size must be even and non-zero, got {}",
                self.page_size
            )));
        }
        if self.max_sync_attempts == 0 {
            return Err(Error::Config("sync attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Word-address increment of one page.
    pub fn page_words(&self) -> u16 {
        u16::from(self.page_size / 2)
    }
}

/// Where a programming cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No cycle running.
    #[default]
    Idle,
    /// Probing for the bootloader.
    Synchronizing,
    /// Bootloader answered; commands may be exchanged.
    Handshaking,
    /// Writing the page at word address `offset`.
    Writing {
        /// Word address of the page in flight.
        offset: u16,
    },
    /// The last page was acknowledged.
    Complete,
}

/// Summary of one image write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct WriteReport {
    /// Page writes acknowledged by the target.
    pub pages: usize,
    /// Image bytes delivered, padding excluded.
    pub bytes: usize,
    /// Image bytes in the last page.
    pub last_page_bytes: usize,
    /// Word address of the last page written.
    pub last_offset: u16,
}

/// STK500 programmer over a port `P`, reading images from a store `S`.
pub struct Programmer<P: Port, S: ImageStore> {
    port: P,
    store: S,
    config: ProgrammerConfig,
    cancel: CancelToken,
    image_name: Option<String>,
    decoder: Option<HexDecoder<S::Reader>>,
    state: SessionState,
}

impl<P: Port, S: ImageStore> Programmer<P, S> {
    /// Create a programmer. No image is loaded yet.
    pub fn new(port: P, store: S, config: ProgrammerConfig) -> Self {
        Self {
            port,
            store,
            config,
            cancel: CancelToken::new(),
            image_name: None,
            decoder: None,
            state: SessionState::Idle,
        }
    }

    /// Use `token` to abandon waits from another thread.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Handle to the cancellation token of this programmer.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the programmer and return the port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// The image storage.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Session configuration.
    pub fn config(&self) -> &ProgrammerConfig {
        &self.config
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Name of the image selected by the last successful [`load`](Self::load).
    pub fn image_name(&self) -> Option<&str> {
        self.image_name.as_deref()
    }

    /// Whether an image is open for decoding.
    pub fn is_image_open(&self) -> bool {
        self.decoder.is_some()
    }

    /// Open image `name` and reset the decoding cursor.
    ///
    /// Any previously open image is closed first. On failure no image is
    /// open and the previous name is forgotten. A missing image is reported
    /// as [`Error::ImageNotFound`], other storage failures pass through.
    pub fn load(&mut self, name: &str) -> Result<()> {
        self.decoder = None;
        self.image_name = None;

        let reader = self.store.open(name).map_err(|e| {
            warn!("Cannot open image {name}: {e}");
            match e {
                Error::Io(io) if io.kind() == ErrorKind::NotFound => {
                    Error::ImageNotFound { name: name.into() }
                },
                other => other,
            }
        })?;

        self.decoder = Some(HexDecoder::new(reader));
        self.image_name = Some(name.to_string());
        debug!("Image {name} loaded");
        Ok(())
    }

    /// Reopen the current image from its beginning.
    pub fn reload(&mut self) -> Result<()> {
        let name = self.image_name.clone().ok_or(Error::NoImageLoaded)?;
        self.load(&name)
    }

    /// Close the open image, keeping its name for the next [`reload`](Self::reload).
    pub fn close_image(&mut self) {
        if self.decoder.take().is_some() {
            debug!("Image closed");
        }
    }

    /// Pulse the configured reset line so the bootloader starts.
    pub fn reset_target(&mut self) -> Result<()> {
        if self.config.reset_signal == ResetSignal::None {
            debug!("Reset line disabled, skipping reset");
            return Ok(());
        }

        info!("Resetting target via {}", self.config.reset_signal);
        let mut line = PortResetLine::new(&mut self.port, self.config.reset_signal);
        pulse_reset(&mut line, self.config.reset_pulses, self.config.reset_interval)
    }

    /// Probe until the bootloader answers `INSYNC` followed by `OK`.
    pub fn sync(&mut self) -> Result<()> {
        self.state = SessionState::Synchronizing;
        let max = self.config.max_sync_attempts;
        let probe = if self.config.get_sync_probe {
            let mut probe = CommandFrame::new(Command::GetSync).build();
            probe.push(CRC_EOP);
            probe
        } else {
            vec![CRC_EOP]
        };

        for attempt in 1..=max {
            if let Err(e) = self.check_cancelled() {
                self.state = SessionState::Idle;
                return Err(e);
            }

            self.port.clear_buffers()?;
            self.port.write_all(&probe)?;
            self.port.flush()?;
            thread::sleep(self.config.sync_poll_delay);

            match self.read_byte_now()? {
                Some(STK_INSYNC) => {
                    if let Err(e) = self.wait_for(STK_OK, "STK_OK") {
                        self.state = SessionState::Idle;
                        return Err(e);
                    }
                    info!("In sync with bootloader (attempt {attempt}/{max})");
                    self.state = SessionState::Handshaking;
                    return Ok(());
                },
                Some(other) => trace!("sync {attempt}/{max}: got 0x{other:02X}"),
                None => trace!("sync {attempt}/{max}: no reply"),
            }
        }

        self.state = SessionState::Idle;
        Err(Error::Timeout(format!(
            "bootloader did not answer {max} sync attempts"
        )))
    }

    /// Query bootloader parameter `id`.
    pub fn get_parameter(&mut self, id: u8) -> Result<u8> {
        self.port.clear_buffers()?;
        self.send_frame(&CommandFrame::get_parameter(id))?;
        self.verify_space()?;
        let value = self.read_reply()?;
        self.wait_for(STK_OK, "STK_OK")?;
        debug!("Parameter 0x{id:02X} = 0x{value:02X}");
        Ok(value)
    }

    /// Bootloader software version as `(major, minor)`.
    pub fn bootloader_version(&mut self) -> Result<(u8, u8)> {
        let major = self.get_parameter(STK_SW_MAJOR)?;
        let minor = self.get_parameter(STK_SW_MINOR)?;
        Ok((major, minor))
    }

    /// Set the word address of the next page write.
    pub fn set_address(&mut self, word: u16) -> Result<()> {
        let frame = CommandFrame::load_address(word);
        self.send_frame(&frame)?;
        self.finish_command(frame.command())
    }

    /// Write one page of `count` bytes taken from the open image.
    ///
    /// Past the end of the image the page is padded with `0xFF`. Returns the
    /// number of image bytes the page carried.
    pub fn send_data(&mut self, count: u8) -> Result<usize> {
        if self.decoder.is_none() {
            return Err(Error::NoImageLoaded);
        }

        let frame = CommandFrame::prog_page(count);
        self.send_frame(&frame)?;
        let decoder = self.decoder.as_mut().ok_or(Error::NoImageLoaded)?;
        let delivered = stream_payload(&mut self.port, decoder, usize::from(count))?;

        self.finish_command(frame.command())?;
        trace!("page of {count} bytes acknowledged ({delivered} from image)");
        Ok(delivered)
    }

    /// Write the whole image from its beginning, one page per word offset.
    ///
    /// `progress` is called after each acknowledged page with the number of
    /// pages written and the expected total.
    pub fn write_image<F>(&mut self, mut progress: F) -> Result<WriteReport>
    where
        F: FnMut(usize, usize),
    {
        self.config.validate()?;
        self.reload()?;

        let page_size = self.config.page_size;
        let page_words = self.config.page_words();
        let total = match &self.image_name {
            Some(name) => match ImageStats::from_store(&self.store, name) {
                Ok(stats) => stats.pages(usize::from(page_size)),
                Err(e) => {
                    warn!("Cannot count pages of {name}: {e}");
                    0
                },
            },
            None => 0,
        };

        let mut report = WriteReport::default();
        if self.decoder_mut()?.is_exhausted()? {
            warn!("Image has no data, nothing to write");
            self.state = SessionState::Complete;
            return Ok(report);
        }

        info!("Writing {total} pages of {page_size} bytes");
        let mut offset: u16 = 0;
        loop {
            self.state = SessionState::Writing { offset };
            self.set_address(offset)?;
            let delivered = self.send_data(page_size)?;

            report.pages += 1;
            report.bytes += delivered;
            report.last_page_bytes = delivered;
            report.last_offset = offset;
            progress(report.pages, total.max(report.pages));

            if self.decoder_mut()?.is_exhausted()? {
                break;
            }
            offset = offset.checked_add(page_words).ok_or_else(|| {
                Error::Protocol("image exceeds the 16-bit word address space".into())
            })?;
        }

        self.state = SessionState::Complete;
        info!(
            "Wrote {} bytes in {} pages (last page {} bytes at word 0x{:04X})",
            report.bytes, report.pages, report.last_page_bytes, report.last_offset
        );
        Ok(report)
    }

    /// Leave programming mode so the target starts the application.
    pub fn app_start(&mut self) -> Result<()> {
        self.port.clear_buffers()?;
        let frame = CommandFrame::leave_progmode();
        self.send_frame(&frame)?;
        self.finish_command(frame.command())?;
        info!("Application started");
        Ok(())
    }

    /// Run one cycle with the loaded image: reset, sync, write, start, close.
    pub fn program_cycle<F>(&mut self, progress: F) -> Result<WriteReport>
    where
        F: FnMut(usize, usize),
    {
        if self.image_name.is_none() {
            return Err(Error::NoImageLoaded);
        }

        self.reset_target()?;
        self.sync()?;
        let report = self.write_image(progress)?;
        self.app_start()?;
        self.close_image();
        self.state = SessionState::Idle;
        Ok(report)
    }

    /// Load `name` and run one programming cycle.
    pub fn program<F>(&mut self, name: &str, progress: F) -> Result<WriteReport>
    where
        F: FnMut(usize, usize),
    {
        self.load(name)?;
        self.program_cycle(progress)
    }

    fn decoder_mut(&mut self) -> Result<&mut HexDecoder<S::Reader>> {
        self.decoder.as_mut().ok_or(Error::NoImageLoaded)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() || is_interrupted_requested() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Read one byte if the port has one within its own timeout.
    fn read_byte_now(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Discard incoming bytes until `expected` arrives.
    fn wait_for(&mut self, expected: u8, what: &str) -> Result<()> {
        let start = Instant::now();

        loop {
            self.check_cancelled()?;
            match self.read_byte_now()? {
                Some(byte) if byte == expected => return Ok(()),
                Some(byte) => trace!("discarding 0x{byte:02X} while waiting for {what}"),
                None => {},
            }
            if start.elapsed() >= self.config.ack_timeout {
                return Err(Error::Timeout(format!(
                    "no {what} (0x{expected:02X}) within {:?}",
                    self.config.ack_timeout
                )));
            }
        }
    }

    /// Wait for the next byte, whatever it is.
    fn read_reply(&mut self) -> Result<u8> {
        let start = Instant::now();

        loop {
            self.check_cancelled()?;
            if let Some(byte) = self.read_byte_now()? {
                return Ok(byte);
            }
            if start.elapsed() >= self.config.ack_timeout {
                return Err(Error::Timeout(format!(
                    "no parameter value within {:?}",
                    self.config.ack_timeout
                )));
            }
        }
    }

    /// Terminate the command and wait for the bootloader to acknowledge it.
    fn verify_space(&mut self) -> Result<()> {
        self.port.write_all(&[CRC_EOP])?;
        self.port.flush()?;
        self.wait_for(STK_INSYNC, "STK_INSYNC")
    }

    /// Close a command: `INSYNC`, then `OK` unless the command has no `OK`.
    fn finish_command(&mut self, command: Command) -> Result<()> {
        self.verify_space()?;
        if command.expects_ok() {
            self.wait_for(STK_OK, "STK_OK")?;
        }
        Ok(())
    }

    fn send_frame(&mut self, frame: &CommandFrame) -> Result<()> {
        let data = frame.build();
        trace!("Sending {:?}: {:02X?}", frame.command(), data);
        self.port.write_all(&data)?;
        self.port.flush()?;
        Ok(())
    }
}

/// Copy `count` image bytes to the port in chunk-sized pieces.
fn stream_payload<P, R>(port: &mut P, decoder: &mut HexDecoder<R>, count: usize) -> Result<usize>
where
    P: Port,
    R: std::io::BufRead,
{
    let mut delivered = 0;
    let mut remaining = count;

    while remaining > 0 {
        let want = remaining.min(CHUNK_CAPACITY);
        let chunk = decoder.decode(want)?;
        port.write_all(&chunk.as_bytes()[..want])?;
        delivered += chunk.delivered();
        remaining -= want;
    }

    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::MemoryStore;
    use crate::port::mock::{LineEvent, MockPort};
    use crate::protocol::stk500::join_word;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Minimal optiboot model: parses complete commands and answers them.
    #[derive(Default)]
    struct FakeBootloader {
        rx: Vec<u8>,
        tx: VecDeque<u8>,
        flash: Vec<u8>,
        address: u16,
        addresses: Vec<u16>,
        page_lengths: Vec<u8>,
        ignore_syncs: usize,
        silent: bool,
        stop_after_pages: Option<usize>,
        version: (u8, u8),
        left_progmode: bool,
        dtr: Vec<bool>,
    }

    impl FakeBootloader {
        fn new() -> Self {
            Self {
                flash: vec![0xFF; 4096],
                version: (8, 3),
                ..Self::default()
            }
        }

        fn ack(&mut self, value: Option<u8>) {
            self.tx.push_back(STK_INSYNC);
            if let Some(v) = value {
                self.tx.push_back(v);
            }
            self.tx.push_back(STK_OK);
        }

        fn process(&mut self) {
            loop {
                let Some(&cmd) = self.rx.first() else { return };
                let needed = match cmd {
                    0x30 | 0x51 => 2,
                    0x41 => 3,
                    0x55 => 4,
                    0x64 => match self.rx.get(2) {
                        Some(&len) => 5 + usize::from(len),
                        None => return,
                    },
                    _ => 1,
                };
                if self.rx.len() < needed {
                    return;
                }
                let frame: Vec<u8> = self.rx.drain(..needed).collect();
                if self.silent || frame[needed - 1] != CRC_EOP {
                    continue;
                }

                match cmd {
                    0x20 | 0x30 => {
                        if self.ignore_syncs > 0 {
                            self.ignore_syncs -= 1;
                        } else {
                            self.ack(None);
                        }
                    },
                    0x41 => {
                        let value = match frame[1] {
                            STK_SW_MAJOR => self.version.0,
                            STK_SW_MINOR => self.version.1,
                            _ => 0x03,
                        };
                        self.ack(Some(value));
                    },
                    0x51 => {
                        self.left_progmode = true;
                        self.tx.push_back(STK_INSYNC);
                    },
                    0x55 => {
                        self.address = join_word(frame[1], frame[2]);
                        self.addresses.push(self.address);
                        self.ack(None);
                    },
                    0x64 => {
                        if self
                            .stop_after_pages
                            .is_some_and(|n| self.page_lengths.len() >= n)
                        {
                            continue;
                        }
                        let len = frame[2];
                        assert_eq!(frame[3], b'F');
                        let start = usize::from(self.address) * 2;
                        self.flash[start..start + usize::from(len)]
                            .copy_from_slice(&frame[4..4 + usize::from(len)]);
                        self.page_lengths.push(len);
                        self.ack(None);
                    },
                    _ => {},
                }
            }
        }
    }

    impl Read for FakeBootloader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.tx.pop_front() {
                Some(byte) if !buf.is_empty() => {
                    buf[0] = byte;
                    Ok(1)
                },
                _ => Err(std::io::Error::new(ErrorKind::TimedOut, "no data")),
            }
        }
    }

    impl Write for FakeBootloader {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.rx.extend_from_slice(buf);
            self.process();
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for FakeBootloader {
        fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn timeout(&self) -> Duration {
            Duration::ZERO
        }

        fn set_baud_rate(&mut self, _baud_rate: u32) -> Result<()> {
            Ok(())
        }

        fn baud_rate(&self) -> u32 {
            115_200
        }

        fn clear_buffers(&mut self) -> Result<()> {
            self.tx.clear();
            Ok(())
        }

        fn name(&self) -> &str {
            "fake-optiboot"
        }

        fn set_dtr(&mut self, level: bool) -> Result<()> {
            self.dtr.push(level);
            Ok(())
        }

        fn set_rts(&mut self, _level: bool) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Intel HEX text carrying `data` in records of up to 16 bytes.
    fn hex_image(data: &[u8]) -> String {
        let mut out = String::new();
        for (i, record) in data.chunks(16).enumerate() {
            let addr = (i * 16) as u16;
            let mut sum = record.len() as u8;
            sum = sum.wrapping_add((addr >> 8) as u8).wrapping_add(addr as u8);
            out.push_str(&format!(":{:02X}{addr:04X}00", record.len()));
            for byte in record {
                out.push_str(&format!("{byte:02X}"));
                sum = sum.wrapping_add(*byte);
            }
            out.push_str(&format!("{:02X}\r\n", sum.wrapping_neg()));
        }
        out.push_str(":00000001FF\r\n");
        out
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn fast_config() -> ProgrammerConfig {
        let _ = env_logger::builder().is_test(true).try_init();
        ProgrammerConfig::default()
            .with_sync_poll_delay(Duration::ZERO)
            .with_ack_timeout(Duration::from_millis(20))
            .with_reset_pulses(3, Duration::ZERO)
    }

    fn programmer_with(
        target: FakeBootloader,
        data: &[u8],
    ) -> Programmer<FakeBootloader, MemoryStore> {
        let store = MemoryStore::new().with_image("sketch.hex", hex_image(data));
        Programmer::new(target, store, fast_config())
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = ProgrammerConfig::default();
        assert_eq!(config.page_size, 128);
        assert_eq!(config.page_words(), 64);
        assert_eq!(config.max_sync_attempts, 100);
        assert_eq!(config.reset_pulses, 3);
        assert_eq!(config.reset_interval, Duration::from_millis(500));
        assert!(config.validate().is_ok());

        assert!(config.clone().with_page_size(0).validate().is_err());
        assert!(config.clone().with_page_size(127).validate().is_err());
        assert!(config.with_max_sync_attempts(0).validate().is_err());
    }

    #[test]
    fn test_sync_after_ignored_probes() {
        let mut target = FakeBootloader::new();
        target.ignore_syncs = 5;
        let mut programmer = programmer_with(target, &[]);

        programmer.sync().unwrap();
        assert_eq!(programmer.state(), SessionState::Handshaking);
    }

    #[test]
    fn test_sync_gives_up() {
        let mut target = FakeBootloader::new();
        target.silent = true;
        let store = MemoryStore::new();
        let mut programmer =
            Programmer::new(target, store, fast_config().with_max_sync_attempts(4));

        let err = programmer.sync().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(programmer.state(), SessionState::Idle);
    }

    #[test]
    fn test_sync_probe_bytes() {
        let mut port = MockPort::new();
        port.reply_after(1, &[STK_INSYNC, STK_OK]);
        let mut programmer = Programmer::new(port, MemoryStore::new(), fast_config());
        programmer.sync().unwrap();
        assert_eq!(programmer.port().written, vec![CRC_EOP]);

        let mut port = MockPort::new();
        port.reply_after(2, &[STK_INSYNC, STK_OK]);
        let config = fast_config().with_get_sync_probe(true);
        let mut programmer = Programmer::new(port, MemoryStore::new(), config);
        programmer.sync().unwrap();
        assert_eq!(programmer.port().written, vec![0x30, CRC_EOP]);
    }

    #[test]
    fn test_sync_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        let mut programmer =
            programmer_with(FakeBootloader::new(), &[]).with_cancel_token(token.clone());

        assert!(matches!(programmer.sync(), Err(Error::Cancelled)));
        token.reset();
        programmer.sync().unwrap();
    }

    #[test]
    fn test_bootloader_version() {
        let mut programmer = programmer_with(FakeBootloader::new(), &[]);
        assert_eq!(programmer.bootloader_version().unwrap(), (8, 3));
    }

    #[test]
    fn test_get_parameter_wire_format() {
        let mut port = MockPort::new();
        port.reply_after(3, &[STK_INSYNC, 0x04, STK_OK]);
        let mut programmer = Programmer::new(port, MemoryStore::new(), fast_config());

        assert_eq!(programmer.get_parameter(STK_SW_MAJOR).unwrap(), 0x04);
        assert_eq!(programmer.port().written, vec![0x41, 0x81, CRC_EOP]);
    }

    #[test]
    fn test_set_address_wire_format() {
        let mut port = MockPort::new();
        port.reply_after(4, &[STK_INSYNC, STK_OK]);
        let mut programmer = Programmer::new(port, MemoryStore::new(), fast_config());

        programmer.set_address(0x0140).unwrap();
        assert_eq!(programmer.port().written, vec![0x55, 0x40, 0x01, CRC_EOP]);
    }

    #[test]
    fn test_set_address_times_out() {
        let mut target = FakeBootloader::new();
        target.silent = true;
        let mut programmer = programmer_with(target, &[]);

        let err = programmer.set_address(0).unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
    }

    #[test]
    fn test_wait_skips_noise_before_insync() {
        let mut port = MockPort::new();
        port.reply_after(4, &[0x00, 0xFE, STK_INSYNC, 0x42, STK_OK]);
        let mut programmer = Programmer::new(port, MemoryStore::new(), fast_config());

        programmer.set_address(0).unwrap();
    }

    #[test]
    fn test_send_data_partial_chunk() {
        let data = pattern(20);
        let mut programmer = programmer_with(FakeBootloader::new(), &data);
        programmer.load("sketch.hex").unwrap();

        assert_eq!(programmer.send_data(20).unwrap(), 20);
        let target = programmer.port();
        assert_eq!(target.page_lengths, vec![20]);
        assert_eq!(&target.flash[..20], data.as_slice());
    }

    #[test]
    fn test_send_data_without_image() {
        let mut programmer = Programmer::new(MockPort::new(), MemoryStore::new(), fast_config());
        assert!(matches!(programmer.send_data(128), Err(Error::NoImageLoaded)));
        assert!(programmer.port().written.is_empty());
    }

    #[test]
    fn test_write_image_partial_last_page() {
        let data = pattern(300);
        let mut programmer = programmer_with(FakeBootloader::new(), &data);
        programmer.load("sketch.hex").unwrap();

        let mut calls = Vec::new();
        let report = programmer
            .write_image(|done, total| calls.push((done, total)))
            .unwrap();

        assert_eq!(report.pages, 3);
        assert_eq!(report.bytes, 300);
        assert_eq!(report.last_page_bytes, 300 % 128);
        assert_eq!(report.last_offset, 128);
        assert_eq!(calls, vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(programmer.state(), SessionState::Complete);

        let target = programmer.port();
        assert_eq!(target.addresses, vec![0, 64, 128]);
        assert_eq!(target.page_lengths, vec![128, 128, 128]);
        assert_eq!(&target.flash[..300], data.as_slice());
        assert!(target.flash[300..384].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_write_image_exact_pages() {
        let data = pattern(256);
        let mut programmer = programmer_with(FakeBootloader::new(), &data);
        programmer.load("sketch.hex").unwrap();

        let report = programmer.write_image(|_, _| {}).unwrap();
        assert_eq!(report.pages, 2);
        assert_eq!(report.last_page_bytes, 128);
        assert_eq!(programmer.port().addresses, vec![0, 64]);
    }

    #[test]
    fn test_write_image_small_pages() {
        let data = pattern(40);
        let mut programmer = programmer_with(FakeBootloader::new(), &data);
        programmer.config.page_size = 16;
        programmer.load("sketch.hex").unwrap();

        let report = programmer.write_image(|_, _| {}).unwrap();
        assert_eq!(report.pages, 3);
        assert_eq!(programmer.port().addresses, vec![0, 8, 16]);
        assert_eq!(&programmer.port().flash[..40], data.as_slice());
    }

    #[test]
    fn test_write_image_record_cut_at_page_boundary() {
        // One full 16-byte record, then a header whose data never arrives.
        let mut text = hex_image(&pattern(16));
        text.truncate(text.find(":00000001FF").unwrap_or(text.len()));
        text.push_str(":10001000");
        let store = MemoryStore::new().with_image("cut.hex", text);
        let mut programmer = Programmer::new(FakeBootloader::new(), store, fast_config());
        programmer.config.page_size = 16;
        programmer.load("cut.hex").unwrap();

        let report = programmer.write_image(|_, _| {}).unwrap();
        assert_eq!(report.pages, 1);
        assert_eq!(report.bytes, 16);
        assert_eq!(report.last_page_bytes, 16);
        assert_eq!(programmer.port().addresses, vec![0]);
    }

    #[test]
    fn test_write_empty_image() {
        let mut programmer = programmer_with(FakeBootloader::new(), &[]);
        programmer.load("sketch.hex").unwrap();

        let report = programmer.write_image(|_, _| {}).unwrap();
        assert_eq!(report, WriteReport::default());
        assert!(programmer.port().addresses.is_empty());
    }

    #[test]
    fn test_write_image_needs_load() {
        let mut programmer = programmer_with(FakeBootloader::new(), &[1, 2]);
        assert!(matches!(
            programmer.write_image(|_, _| {}),
            Err(Error::NoImageLoaded)
        ));
    }

    #[test]
    fn test_write_image_stops_when_target_goes_quiet() {
        let mut target = FakeBootloader::new();
        target.stop_after_pages = Some(1);
        let mut programmer = programmer_with(target, &pattern(300));
        programmer.load("sketch.hex").unwrap();

        assert!(programmer.write_image(|_, _| {}).unwrap_err().is_timeout());
        assert_eq!(programmer.state(), SessionState::Writing { offset: 64 });
    }

    #[test]
    fn test_write_image_survives_failed_page_count() {
        // Serves the image once; the page-count scan then fails.
        struct OneShotStore {
            image: String,
            opens: std::cell::Cell<usize>,
        }

        impl ImageStore for OneShotStore {
            type Reader = std::io::Cursor<Vec<u8>>;

            fn open(&self, _name: &str) -> Result<Self::Reader> {
                let opens = self.opens.get() + 1;
                self.opens.set(opens);
                match opens {
                    1 | 2 => Ok(std::io::Cursor::new(self.image.clone().into_bytes())),
                    _ => Err(Error::Io(std::io::Error::other("device went away"))),
                }
            }
        }

        let store = OneShotStore {
            image: hex_image(&pattern(200)),
            opens: std::cell::Cell::new(0),
        };
        let mut programmer = Programmer::new(FakeBootloader::new(), store, fast_config());
        programmer.load("sketch.hex").unwrap();

        let mut calls = Vec::new();
        let report = programmer
            .write_image(|done, total| calls.push((done, total)))
            .unwrap();
        assert_eq!(report.pages, 2);
        assert_eq!(calls, vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn test_write_image_rejects_malformed_hex() {
        let store = MemoryStore::new().with_image("bad.hex", ":0400000001G20304F0\n");
        let mut programmer = Programmer::new(FakeBootloader::new(), store, fast_config());
        programmer.load("bad.hex").unwrap();

        assert!(matches!(
            programmer.write_image(|_, _| {}),
            Err(Error::MalformedHexDigit { found: 'G', .. })
        ));
    }

    #[test]
    fn test_rewrite_is_identical() {
        let data = pattern(200);
        let mut programmer = programmer_with(FakeBootloader::new(), &data);
        programmer.load("sketch.hex").unwrap();

        let first = programmer.write_image(|_, _| {}).unwrap();
        let flash = programmer.port().flash.clone();
        let second = programmer.write_image(|_, _| {}).unwrap();

        assert_eq!(first, second);
        assert_eq!(programmer.port().flash, flash);
        assert_eq!(programmer.port().addresses, vec![0, 64, 0, 64]);
    }

    #[test]
    fn test_load_missing_image() {
        let mut programmer = programmer_with(FakeBootloader::new(), &[]);
        programmer.load("sketch.hex").unwrap();

        let err = programmer.load("missing.hex").unwrap_err();
        assert!(matches!(err, Error::ImageNotFound { ref name } if name == "missing.hex"));
        assert!(!programmer.is_image_open());
        assert!(programmer.image_name().is_none());
        assert!(matches!(programmer.reload(), Err(Error::NoImageLoaded)));
    }

    #[test]
    fn test_load_passes_storage_errors_through() {
        struct FailingStore(ErrorKind);

        impl ImageStore for FailingStore {
            type Reader = std::io::Cursor<Vec<u8>>;

            fn open(&self, _name: &str) -> Result<Self::Reader> {
                Err(Error::Io(std::io::Error::new(self.0, "storage failure")))
            }
        }

        let store = FailingStore(ErrorKind::PermissionDenied);
        let mut programmer = Programmer::new(MockPort::new(), store, fast_config());
        let err = programmer.load("sketch.hex").unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == ErrorKind::PermissionDenied));
        assert!(!programmer.is_image_open());

        let store = FailingStore(ErrorKind::NotFound);
        let mut programmer = Programmer::new(MockPort::new(), store, fast_config());
        let err = programmer.load("sketch.hex").unwrap_err();
        assert!(matches!(err, Error::ImageNotFound { ref name } if name == "sketch.hex"));
    }

    #[test]
    fn test_app_start_wire_format() {
        let mut port = MockPort::new();
        port.reply_after(2, &[STK_INSYNC]);
        let mut programmer = Programmer::new(port, MemoryStore::new(), fast_config());

        programmer.app_start().unwrap();
        assert_eq!(programmer.port().written, vec![0x51, CRC_EOP]);
        assert_eq!(programmer.port().clears, 1);
    }

    #[test]
    fn test_app_start_discards_stale_input() {
        let mut port = MockPort::new();
        port.inbound.extend([STK_INSYNC, STK_OK]);
        let mut programmer = Programmer::new(port, MemoryStore::new(), fast_config());

        let err = programmer.app_start().unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
        assert_eq!(programmer.port().clears, 1);
        assert_eq!(programmer.port().written, vec![0x51, CRC_EOP]);
    }

    #[test]
    fn test_get_parameter_discards_stale_input() {
        let mut port = MockPort::new();
        port.inbound.extend([STK_INSYNC, 0x99, STK_OK]);
        port.reply_after(3, &[STK_INSYNC, 0x04, STK_OK]);
        let mut programmer = Programmer::new(port, MemoryStore::new(), fast_config());

        assert_eq!(programmer.get_parameter(STK_SW_MAJOR).unwrap(), 0x04);
        assert_eq!(programmer.port().clears, 1);
    }

    #[test]
    fn test_sync_clears_input_before_each_probe() {
        let mut port = MockPort::new();
        port.inbound.extend([STK_INSYNC, STK_OK]);
        let config = fast_config().with_max_sync_attempts(3);
        let mut programmer = Programmer::new(port, MemoryStore::new(), config);

        assert!(programmer.sync().unwrap_err().is_timeout());
        assert_eq!(programmer.port().clears, 3);
        assert_eq!(programmer.port().written, vec![CRC_EOP; 3]);

        let mut port = MockPort::new();
        port.reply_after(1, &[STK_INSYNC, STK_OK]);
        let mut programmer = Programmer::new(port, MemoryStore::new(), fast_config());
        programmer.sync().unwrap();
        assert_eq!(programmer.port().clears, 1);
    }

    #[test]
    fn test_reset_target_pulses_dtr() {
        let mut programmer = Programmer::new(MockPort::new(), MemoryStore::new(), fast_config());
        programmer.reset_target().unwrap();

        let expected: Vec<_> = [LineEvent::Dtr(true), LineEvent::Dtr(false)].repeat(3);
        assert_eq!(programmer.port().lines, expected);

        let config = fast_config().with_reset_signal(ResetSignal::None);
        let mut programmer = Programmer::new(MockPort::new(), MemoryStore::new(), config);
        programmer.reset_target().unwrap();
        assert!(programmer.port().lines.is_empty());
    }

    #[test]
    fn test_program_cycles() {
        let data = pattern(130);
        let mut programmer = programmer_with(FakeBootloader::new(), &data);

        let report = programmer.program("sketch.hex", |_, _| {}).unwrap();
        assert_eq!(report.pages, 2);
        assert_eq!(report.last_page_bytes, 2);
        assert!(!programmer.is_image_open());
        assert_eq!(programmer.image_name(), Some("sketch.hex"));
        assert_eq!(programmer.state(), SessionState::Idle);
        assert!(programmer.port().left_progmode);
        assert_eq!(programmer.port().dtr, [true, false].repeat(3));

        let again = programmer.program_cycle(|_, _| {}).unwrap();
        assert_eq!(again, report);
        assert_eq!(&programmer.port().flash[..130], data.as_slice());
    }
}
