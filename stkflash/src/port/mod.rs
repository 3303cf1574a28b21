//! Transport abstraction for the byte-serial link to the target.
//!
//! The programmer never touches a concrete serial API. It talks to a
//! [`Port`], which keeps the protocol layer testable against scripted
//! transports and portable across platforms.
//!
//! ```text
//! +-------------------+
//! |  Programmer       |   STK500 framing, acknowledgments, page loop
//! +---------+---------+
//!           |
//!           v
//! +---------+---------+
//! |   Port trait      |   write byte / bounded read / clear inbound
//! +---------+---------+
//!           |
//!           v
//! +---------+---------+
//! | NativePort        |   serialport crate (feature "native")
//! +-------------------+
//! ```
//!
//! A single read is bounded by the port timeout. The programmer treats a
//! timed-out or empty read as "no byte available", which is how the
//! non-blocking single-byte read of the wire protocol is expressed here.

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Default data rate of optiboot on 16 MHz boards.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default per-read timeout; kept short so polling loops stay responsive.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Serial port configuration.
///
/// The link is always 8 data bits, no parity, one stop bit and no flow
/// control; only the name, rate and read timeout vary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Timeout of a single read.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Byte-serial link to the target.
pub trait Port: Read + Write + Send {
    /// Set the timeout of a single read.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current read timeout.
    fn timeout(&self) -> Duration;

    /// Set the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard received bytes not read yet.
    ///
    /// Bytes still waiting to go out are kept.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
