//! STK500 (v1) command subset spoken by optiboot.
//!
//! ## Frame Format
//!
//! ```text
//! +-----+------------------+----------+        +---------+--------+
//! | CMD | parameters       | CRC_EOP  |  --->  | INSYNC  | STK_OK |
//! +-----+------------------+----------+  <---  +---------+--------+
//! | 1   | 0..n             | 0x20     |        | 0x14    | 0x10   |
//! +-----+------------------+----------+        +---------+--------+
//! ```
//!
//! `CRC_EOP` is a plain end-of-command marker; no checksum is carried.
//! Commands that return a value put it between `INSYNC` and `STK_OK`.

use byteorder::{ByteOrder, LittleEndian};

/// Command accepted / operation complete.
pub const STK_OK: u8 = 0x10;
/// Target is in sync with the programmer.
pub const STK_INSYNC: u8 = 0x14;
/// End of command.
pub const CRC_EOP: u8 = 0x20;

/// Parameter id of the bootloader's major version.
pub const STK_SW_MAJOR: u8 = 0x81;
/// Parameter id of the bootloader's minor version.
pub const STK_SW_MINOR: u8 = 0x82;

/// Memory type marker of a flash page write (`'F'`).
pub const MEMTYPE_FLASH: u8 = b'F';

/// Commands used by the programmer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Synchronisation probe.
    GetSync = 0x30,
    /// Read one parameter value.
    GetParameter = 0x41,
    /// Leave programming mode and start the application.
    LeaveProgmode = 0x51,
    /// Set the word address of the next page write.
    LoadAddress = 0x55,
    /// Write one page.
    ProgPage = 0x64,
}

impl Command {
    /// Opcode byte.
    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Whether the target sends `STK_OK` after `STK_INSYNC`.
    ///
    /// `LeaveProgmode` is only confirmed with `STK_INSYNC`; the bootloader
    /// jumps to the application right after.
    pub fn expects_ok(self) -> bool {
        !matches!(self, Self::LeaveProgmode)
    }
}

/// Split a word into its (low, high) bytes.
pub fn split_word(word: u16) -> (u8, u8) {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, word);
    (buf[0], buf[1])
}

/// Join (low, high) bytes into a word.
pub fn join_word(lo: u8, hi: u8) -> u16 {
    LittleEndian::read_u16(&[lo, hi])
}

/// Command header builder.
///
/// `build` returns the command byte and its parameters. The programmer adds
/// the payload (page writes only) and `CRC_EOP` itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    cmd: Command,
    params: Vec<u8>,
}

impl CommandFrame {
    /// Create a frame without parameters.
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            params: Vec::new(),
        }
    }

    /// Query parameter `id`.
    pub fn get_parameter(id: u8) -> Self {
        let mut frame = Self::new(Command::GetParameter);
        frame.params.push(id);
        frame
    }

    /// Set the word address of the next page write.
    pub fn load_address(word: u16) -> Self {
        let (lo, hi) = split_word(word);
        let mut frame = Self::new(Command::LoadAddress);
        frame.params.extend_from_slice(&[lo, hi]);
        frame
    }

    /// Header of a flash page write of `count` bytes.
    ///
    /// The length is sent big-endian as two bytes; optiboot pages never
    /// exceed 255 bytes so the high byte is always zero.
    pub fn prog_page(count: u8) -> Self {
        let mut frame = Self::new(Command::ProgPage);
        frame.params.extend_from_slice(&[0x00, count, MEMTYPE_FLASH]);
        frame
    }

    /// Leave programming mode.
    pub fn leave_progmode() -> Self {
        Self::new(Command::LeaveProgmode)
    }

    /// Command byte followed by the parameters.
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.params.len());
        buf.push(self.cmd.opcode());
        buf.extend_from_slice(&self.params);
        buf
    }

    /// Get the command type.
    pub fn command(&self) -> Command {
        self.cmd
    }
}
