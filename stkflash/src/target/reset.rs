//! Reset line handling.
//!
//! Boards with an STK500 bootloader run it for a short window after reset,
//! so every session starts by pulsing the target's reset input.

use crate::error::{Error, Result};
use crate::port::Port;
use log::{debug, trace};
use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

/// A digital output wired to the target's reset input (active low).
pub trait ResetLine {
    /// Drive the line high (`true`) or low (`false`).
    fn set_level(&mut self, high: bool) -> Result<()>;
}

/// Serial control line used as the reset output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ResetSignal {
    /// DTR, the auto-reset line of Arduino-style boards.
    #[default]
    Dtr,
    /// RTS.
    Rts,
    /// Do not touch any line; the target is reset externally.
    None,
}

impl fmt::Display for ResetSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dtr => write!(f, "dtr"),
            Self::Rts => write!(f, "rts"),
            Self::None => write!(f, "none"),
        }
    }
}

impl FromStr for ResetSignal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dtr" => Ok(Self::Dtr),
            "rts" => Ok(Self::Rts),
            "none" | "off" => Ok(Self::None),
            other => Err(Error::Config(format!("unknown reset signal '{other}'"))),
        }
    }
}

/// Reset line driven through a serial control signal.
///
/// Asserting DTR/RTS pulls the physical pin low, so a low level maps to an
/// asserted signal.
pub struct PortResetLine<'a, P: Port + ?Sized> {
    port: &'a mut P,
    signal: ResetSignal,
}

impl<'a, P: Port + ?Sized> PortResetLine<'a, P> {
    /// Drive `signal` on `port`.
    pub fn new(port: &'a mut P, signal: ResetSignal) -> Self {
        Self { port, signal }
    }
}

impl<P: Port + ?Sized> ResetLine for PortResetLine<'_, P> {
    fn set_level(&mut self, high: bool) -> Result<()> {
        match self.signal {
            ResetSignal::Dtr => self.port.set_dtr(!high),
            ResetSignal::Rts => self.port.set_rts(!high),
            ResetSignal::None => Ok(()),
        }
    }
}

/// Pulse `line` low then high `pulses` times, pausing `interval` after each.
pub fn pulse_reset<L: ResetLine + ?Sized>(
    line: &mut L,
    pulses: u32,
    interval: Duration,
) -> Result<()> {
    debug!("Pulsing reset {pulses} times ({interval:?} apart)");
    for n in 1..=pulses {
        line.set_level(false)?;
        line.set_level(true)?;
        trace!("reset pulse {n}/{pulses}");
        thread::sleep(interval);
    }
    Ok(())
}
