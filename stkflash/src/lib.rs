//! # stkflash
//!
//! A standalone programmer for AVR targets running an STK500-compatible
//! bootloader (optiboot).
//!
//! The crate streams an Intel HEX image from storage straight onto the wire:
//!
//! - [`HexReader`] walks the HEX text byte by byte
//! - [`HexDecoder`] turns records into fixed-size payload chunks, crossing
//!   record boundaries transparently
//! - [`Programmer`] drives the STK500 handshake and the page write loop
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via `serialport`
//! - `serde`: Serialization support for report types
//!
//! ## Example
//!
//! ```rust,no_run
//! use stkflash::{DirStore, Programmer, ProgrammerConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let port = stkflash::NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!         let store = DirStore::new("images");
//!         let mut programmer = Programmer::new(port, store, ProgrammerConfig::default());
//!
//!         let report = programmer.program("Blink.hex", |written, total| {
//!             println!("{written}/{total} pages");
//!         })?;
//!         println!("wrote {} bytes", report.bytes);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};

pub mod device;
pub mod error;
pub mod host;
pub mod image;
pub mod port;
pub mod protocol;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

/// Cancellation handle shared between a programmer and whoever may stop it.
///
/// Clones observe the same flag. Every blocking wait inside the programmer
/// polls it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token in the "not cancelled" state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Clear a previous cancellation request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    /// Whether cancellation was requested on this token.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    device::{DetectedPort, DeviceKind, TransportKind},
    error::{Error, Result},
    host::{auto_detect_port, discover_known_ports, discover_ports},
    image::{
        CHUNK_CAPACITY, Chunk, DirStore, HexDecoder, HexReader, ImageStats, ImageStore,
        MemoryStore, SENTINEL,
    },
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::stk500::{Command, CommandFrame, join_word, split_word},
    target::{
        PortResetLine, Programmer, ProgrammerConfig, ResetLine, ResetSignal, SessionState,
        WriteReport, pulse_reset,
    },
};
