//! Bootstrap loader (BSL) core for the C167 CPU of SIMK4x ECUs
//!
//! The boot ROM accepts a single zero byte after a hardware reset with the
//! bootstrap pin held, answers with a variant tag, and then swallows an
//! arbitrary loader image as a raw byte stream. A two-stage upload
//! (bootstrap, then kernel) brings up a monitor kernel whose ABI is:
//! every byte sent is echoed back by the target; a command opcode is
//! acknowledged with 0xAA, a completed data phase with 0xEA; block
//! transfers carry an 8-bit XOR checksum readable with the get-checksum
//! command.
//!
//! This path talks raw serial below KWP2000 entirely; it is the last
//! resort when the flash loader on the ECU is gone.

use std::time::Duration;

use log::{debug, info};

pub mod flash;

pub use flash::{BootSectorLocation, FlashChip, TargetVariant};

/// Loader successfully launched
pub const I_LOADER_STARTED: u8 = 0x01;
/// Application successfully loaded
pub const I_APPLICATION_LOADED: u8 = 0x02;
/// Application successfully launched
pub const I_APPLICATION_STARTED: u8 = 0x03;

/// First acknowledge, sent after a function code
pub const A_ACK1: u8 = 0xAA;
/// Second acknowledge, last byte of a completed data phase
pub const A_ACK2: u8 = 0xEA;

/// Kernel command opcodes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum KernelCommand {
    /// Write a 16-bit word to memory or a register
    WriteWord = 0x82,
    /// Read a 16-bit word from memory or a register
    ReadWord = 0xCD,
    /// Write a memory block to target memory
    WriteBlock = 0x84,
    /// Read a memory block from target memory
    ReadBlock = 0x85,
    /// Set up R8-R15 and call a function, returning 8 register words
    CallFunction = 0x9F,
    /// Checksum of the previously transferred block
    GetChecksum = 0x33,
    /// Execute the EINIT instruction
    Einit = 0x31,
    /// Software reset
    SoftReset = 0x32,
    /// Jump to the user program
    JumpToUser = 0x41,
    /// Communication test
    TestComm = 0x93,
}

/// CPU variant tag returned by the boot ROM hello
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CpuVariant {
    /// Old C167 mask (0xA5)
    C167Old,
    /// SAK-C167CR-LM (0xC5)
    C167Cr,
    /// SAK-C167CS-LM (0xD5)
    C167Cs,
}

impl CpuVariant {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0xA5 => Some(Self::C167Old),
            0xC5 => Some(Self::C167Cr),
            0xD5 => Some(Self::C167Cs),
            _ => None,
        }
    }
}

/// Loader phase, advanced by the connect sequence
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BslPhase {
    /// Nothing uploaded yet
    Idle,
    /// Bootstrap stage accepted by the boot ROM
    BootstrapSent,
    /// Monitor kernel answering on the link
    KernelRunning,
    /// External flash driver resident in kernel RAM
    DriverLoaded,
}

/// Bootstrap loader error
#[derive(Debug, thiserror::Error)]
pub enum BslError {
    /// Serial I/O failed
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The target did not mirror a transmitted byte
    #[error("echo error: sent 0x{sent:02X}, received 0x{received:02X} at position {position}")]
    EchoMismatch {
        /// Byte that was transmitted
        sent: u8,
        /// Byte that came back
        received: u8,
        /// Offset within the transmitted run
        position: usize,
    },
    /// No echo arrived within the timeout
    #[error("no echo from target")]
    EchoMissing,
    /// An expected acknowledge byte never arrived
    #[error("no acknowledge from target (expected 0x{expected:02X})")]
    AckMissing {
        /// The acknowledge byte that was expected
        expected: u8,
    },
    /// A different byte arrived where an acknowledge was expected
    #[error("unexpected acknowledge 0x{got:02X} (expected 0x{expected:02X})")]
    UnexpectedAck {
        /// The acknowledge byte that was expected
        expected: u8,
        /// What actually arrived
        got: u8,
    },
    /// The boot ROM hello went unanswered
    #[error("no response from ECU; is it powered with the bootstrap pin held?")]
    NoHelloResponse,
    /// The hello tag matched no known CPU variant
    #[error("unknown CPU variant tag 0x{tag:02X}")]
    UnknownCpuVariant {
        /// The tag byte the boot ROM sent
        tag: u8,
    },
    /// A stage upload was not acknowledged with the expected info code
    #[error("stage upload rejected: got 0x{got:02X}, expected 0x{expected:02X}")]
    StageRejected {
        /// Info code that was expected
        expected: u8,
        /// Info code that arrived
        got: u8,
    },
    /// A block transfer checksum did not match
    #[error("block checksum mismatch: calculated 0x{calculated:02X}, target reports 0x{reported:02X}")]
    BlockChecksumMismatch {
        /// Locally calculated XOR checksum
        calculated: u8,
        /// Checksum the kernel reported
        reported: u8,
    },
    /// A word write did not read back
    #[error("register at 0x{address:06X} did not accept 0x{wanted:04X} (read back 0x{read_back:04X})")]
    RegisterReadbackMismatch {
        /// Target address
        address: u32,
        /// Value written
        wanted: u16,
        /// Value read back
        read_back: u16,
    },
    /// A flash driver call returned a non-zero status
    #[error("flash driver call failed with status 0x{status:04X}")]
    DriverCallFailed {
        /// Status word from R15
        status: u16,
    },
    /// The probed flash chip is not in the chip table
    #[error("unknown flash chip (manufacturer 0x{manufacturer:04X}, device 0x{device:02X})")]
    ChipUnknown {
        /// Manufacturer ID word
        manufacturer: u16,
        /// Device ID byte
        device: u8,
    },
}

/// Byte-level serial capability the loader drives. Reads block up to the
/// port timeout and may return fewer bytes than asked for.
pub trait BslPort: Send {
    /// Writes all bytes
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), BslError>;
    /// Reads up to `len` bytes, short on timeout
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, BslError>;
    /// Drives the DTR line
    fn set_dtr(&mut self, level: bool) -> Result<(), BslError>;
    /// Drives the RTS line
    fn set_rts(&mut self, level: bool) -> Result<(), BslError>;
    /// Discards pending input
    fn drain_input(&mut self) -> Result<(), BslError>;
}

/// [BslPort] over a plain serial adapter
pub struct SerialBslPort {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialBslPort {
    /// Opens the given serial interface for BSL use (8N1, 3 s timeout)
    pub fn open(interface: &str, baudrate: u32) -> Result<Self, BslError> {
        let port = serialport::new(interface, baudrate)
            .timeout(Duration::from_secs(3))
            .open()
            .map_err(|e| BslError::Io(std::io::Error::other(e.to_string())))?;
        Ok(Self { port })
    }
}

impl BslPort for SerialBslPort {
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), BslError> {
        use std::io::Write;
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, BslError> {
        use std::io::Read;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), BslError> {
        self.port
            .write_data_terminal_ready(level)
            .map_err(|e| BslError::Io(std::io::Error::other(e.to_string())))
    }

    fn set_rts(&mut self, level: bool) -> Result<(), BslError> {
        self.port
            .write_request_to_send(level)
            .map_err(|e| BslError::Io(std::io::Error::other(e.to_string())))
    }

    fn drain_input(&mut self) -> Result<(), BslError> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| BslError::Io(std::io::Error::other(e.to_string())))
    }
}

/// Loader and driver images, loaded from files by the caller. The crate
/// ships no binaries; the blobs come with the adapter tooling.
#[derive(Debug, Clone, Default)]
pub struct BslAssets {
    /// First stage accepted by the boot ROM
    pub bootstrap: Vec<u8>,
    /// Monitor kernel started by the bootstrap
    pub kernel: Vec<u8>,
    /// 29Fx00B flash driver for V6 boards
    pub driver_v6: Vec<u8>,
    /// 29Fx00B flash driver for 2.0L boards (uploaded through the
    /// line-swap transform)
    pub driver_i4: Vec<u8>,
}

/// 8-bit XOR checksum used by kernel block transfers
pub fn block_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

fn address_le(address: u32) -> [u8; 3] {
    [address as u8, (address >> 8) as u8, (address >> 16) as u8]
}

fn word_le(word: u16) -> [u8; 2] {
    [word as u8, (word >> 8) as u8]
}

/// The bootstrap loader session
pub struct BslLoader {
    port: Box<dyn BslPort>,
    phase: BslPhase,
    cpu: Option<CpuVariant>,
}

impl std::fmt::Debug for BslLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BslLoader")
            .field("phase", &self.phase)
            .field("cpu", &self.cpu)
            .finish()
    }
}

impl BslLoader {
    /// Wraps a port into a loader session
    pub fn new(port: Box<dyn BslPort>) -> Self {
        Self {
            port,
            phase: BslPhase::Idle,
            cpu: None,
        }
    }

    /// Current loader phase
    pub fn phase(&self) -> BslPhase {
        self.phase
    }

    pub(crate) fn force_phase(&mut self, phase: BslPhase) {
        self.phase = phase;
    }

    /// CPU variant reported by the boot ROM hello, if one was seen
    pub fn cpu_variant(&self) -> Option<CpuVariant> {
        self.cpu
    }

    /// Pulses DTR and parks DTR/RTS low, waking the CPU into bootstrap
    /// mode through the adapter's reset circuit.
    pub fn reset_adapter(&mut self) -> Result<(), BslError> {
        self.port.set_dtr(true)?;
        std::thread::sleep(Duration::from_millis(100));
        self.port.set_dtr(false)?;
        std::thread::sleep(Duration::from_millis(100));
        self.port.set_rts(false)?;
        std::thread::sleep(Duration::from_millis(100));
        self.port.drain_input()
    }

    /// Writes one byte and consumes its echo
    fn send_byte_with_echo(&mut self, byte: u8) -> Result<(), BslError> {
        self.port.write_bytes(&[byte])?;
        let echo = self.port.read_bytes(1)?;
        match echo.first() {
            None => Err(BslError::EchoMissing),
            Some(e) if *e != byte => Err(BslError::EchoMismatch {
                sent: byte,
                received: *e,
                position: 0,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Writes a run of bytes and consumes the mirrored run
    fn send_data_with_echo(&mut self, data: &[u8]) -> Result<(), BslError> {
        self.port.write_bytes(data)?;
        let echo = self.port.read_bytes(data.len())?;
        if echo.len() != data.len() {
            return Err(BslError::EchoMissing);
        }
        for (position, (sent, received)) in data.iter().zip(echo.iter()).enumerate() {
            if sent != received {
                return Err(BslError::EchoMismatch {
                    sent: *sent,
                    received: *received,
                    position,
                });
            }
        }
        Ok(())
    }

    fn expect_ack(&mut self, expected: u8) -> Result<(), BslError> {
        let ack = self.port.read_bytes(1)?;
        match ack.first() {
            None => Err(BslError::AckMissing { expected }),
            Some(got) if *got != expected => Err(BslError::UnexpectedAck {
                expected,
                got: *got,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Sends a command opcode and waits for the first acknowledge
    fn send_command(&mut self, command: KernelCommand) -> Result<(), BslError> {
        self.send_byte_with_echo(command as u8)?;
        self.expect_ack(A_ACK1)
    }

    /// Sends a data phase and waits for the second acknowledge
    fn send_data(&mut self, data: &[u8]) -> Result<(), BslError> {
        self.send_data_with_echo(data)?;
        self.expect_ack(A_ACK2)
    }

    /// Sends a data phase and reads one 16-bit word followed by the second
    /// acknowledge
    fn get_word(&mut self, data: &[u8]) -> Result<u16, BslError> {
        self.send_data_with_echo(data)?;
        let resp = self.port.read_bytes(3)?;
        if resp.len() != 3 {
            return Err(BslError::AckMissing { expected: A_ACK2 });
        }
        if resp[2] != A_ACK2 {
            return Err(BslError::UnexpectedAck {
                expected: A_ACK2,
                got: resp[2],
            });
        }
        Ok(resp[0] as u16 | (resp[1] as u16) << 8)
    }

    /// Boot ROM hello: a zero byte, answered with 0xAA when the kernel is
    /// already resident or a CPU variant tag out of bootstrap mode.
    /// Returns true if the kernel was already running.
    pub fn hello(&mut self) -> Result<bool, BslError> {
        self.send_data_with_echo(&[0x00])?;
        let byte = self.port.read_bytes(1)?;
        match byte.first() {
            None => Err(BslError::NoHelloResponse),
            Some(&A_ACK1) => {
                info!("kernel already running");
                self.phase = BslPhase::KernelRunning;
                Ok(true)
            }
            Some(tag) => match CpuVariant::from_tag(*tag) {
                Some(cpu) => {
                    info!("got CPU variant {cpu:?} (tag 0x{tag:02X})");
                    self.cpu = Some(cpu);
                    Ok(false)
                }
                None => Err(BslError::UnknownCpuVariant { tag: *tag }),
            },
        }
    }

    fn upload_stage(&mut self, image: &[u8], expected_info: u8) -> Result<(), BslError> {
        self.send_data_with_echo(image)?;
        let byte = self.port.read_bytes(1)?;
        match byte.first() {
            None => Err(BslError::AckMissing {
                expected: expected_info,
            }),
            Some(got) if *got != expected_info => Err(BslError::StageRejected {
                expected: expected_info,
                got: *got,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Full connect sequence: adapter reset, hello, two-stage upload when
    /// the kernel is not yet resident, then the communication test.
    pub fn connect(&mut self, assets: &BslAssets) -> Result<(), BslError> {
        self.reset_adapter()?;
        if !self.hello()? {
            info!("sending SIMK4x bootstrap ({} bytes)", assets.bootstrap.len());
            self.upload_stage(&assets.bootstrap, I_LOADER_STARTED)?;
            self.phase = BslPhase::BootstrapSent;
            info!("sending SIMK4x kernel ({} bytes)", assets.kernel.len());
            self.upload_stage(&assets.kernel, I_APPLICATION_STARTED)?;
            self.phase = BslPhase::KernelRunning;
        }
        self.test_comm()
    }

    /// Communication test: 0x93 answered by the two acknowledge bytes
    pub fn test_comm(&mut self) -> Result<(), BslError> {
        debug!("testing BSL communication");
        self.send_data_with_echo(&[KernelCommand::TestComm as u8])?;
        let resp = self.port.read_bytes(2)?;
        match resp.as_slice() {
            [A_ACK1, A_ACK2] => Ok(()),
            [] | [_] => Err(BslError::AckMissing { expected: A_ACK1 }),
            [got, _] => Err(BslError::UnexpectedAck {
                expected: A_ACK1,
                got: *got,
            }),
            _ => unreachable!(),
        }
    }

    /// Writes a word and verifies it by reading it back
    pub fn write_word(&mut self, address: u32, word: u16) -> Result<(), BslError> {
        self.send_command(KernelCommand::WriteWord)?;
        let mut data = address_le(address).to_vec();
        data.extend_from_slice(&word_le(word));
        self.send_data(&data)?;

        let read_back = self.read_word(address)?;
        if read_back != word {
            return Err(BslError::RegisterReadbackMismatch {
                address,
                wanted: word,
                read_back,
            });
        }
        debug!("set word at 0x{address:06X} = 0x{word:04X}");
        Ok(())
    }

    /// Reads a word from target memory
    pub fn read_word(&mut self, address: u32) -> Result<u16, BslError> {
        self.send_command(KernelCommand::ReadWord)?;
        self.get_word(&address_le(address))
    }

    /// Reads back the XOR checksum of the previous block transfer
    pub fn get_block_checksum(&mut self) -> Result<u8, BslError> {
        self.send_byte_with_echo(KernelCommand::GetChecksum as u8)?;
        let resp = self.port.read_bytes(3)?;
        if resp.len() != 3 {
            return Err(BslError::AckMissing { expected: A_ACK2 });
        }
        if resp[2] != A_ACK2 {
            return Err(BslError::UnexpectedAck {
                expected: A_ACK2,
                got: resp[2],
            });
        }
        Ok(resp[1])
    }

    /// Writes a block to target memory and verifies its checksum
    pub fn write_block(&mut self, address: u32, data: &[u8]) -> Result<(), BslError> {
        self.send_command(KernelCommand::WriteBlock)?;
        let mut payload = address_le(address).to_vec();
        payload.extend_from_slice(&word_le(data.len() as u16));
        payload.extend_from_slice(data);
        self.send_data(&payload)?;

        let reported = self.get_block_checksum()?;
        let calculated = block_checksum(data);
        if reported != calculated {
            return Err(BslError::BlockChecksumMismatch {
                calculated,
                reported,
            });
        }
        Ok(())
    }

    /// Reads a block from target memory, verifying its checksum
    pub fn read_block(&mut self, address: u32, size: usize) -> Result<Vec<u8>, BslError> {
        self.send_command(KernelCommand::ReadBlock)?;
        let mut payload = address_le(address).to_vec();
        payload.extend_from_slice(&word_le(size as u16));
        self.send_data_with_echo(&payload)?;

        let mut resp = self.port.read_bytes(size + 1)?;
        if resp.len() != size + 1 {
            return Err(BslError::AckMissing { expected: A_ACK2 });
        }
        let ack = resp.pop().unwrap_or(0);
        if ack != A_ACK2 {
            return Err(BslError::UnexpectedAck {
                expected: A_ACK2,
                got: ack,
            });
        }

        let reported = self.get_block_checksum()?;
        let calculated = block_checksum(&resp);
        if reported != calculated {
            return Err(BslError::BlockChecksumMismatch {
                calculated,
                reported,
            });
        }
        Ok(resp)
    }

    /// Sets up R8-R15, calls the function at `address` and returns the
    /// eight register words after it comes back.
    pub fn call_function(&mut self, address: u32, registers: [u16; 8]) -> Result<[u16; 8], BslError> {
        self.send_command(KernelCommand::CallFunction)?;
        let mut payload = address_le(address).to_vec();
        for register in registers {
            payload.extend_from_slice(&word_le(register));
        }
        self.send_data_with_echo(&payload)?;

        let resp = self.port.read_bytes(17)?;
        if resp.len() != 17 {
            return Err(BslError::AckMissing { expected: A_ACK2 });
        }
        if resp[16] != A_ACK2 {
            return Err(BslError::UnexpectedAck {
                expected: A_ACK2,
                got: resp[16],
            });
        }
        let mut out = [0u16; 8];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = resp[i * 2] as u16 | (resp[i * 2 + 1] as u16) << 8;
        }
        Ok(out)
    }

    /// Executes the EINIT instruction on the target
    pub fn einit(&mut self) -> Result<(), BslError> {
        self.send_command(KernelCommand::Einit)
    }

    /// Soft-resets the target; the session is over afterwards
    pub fn soft_reset(&mut self) -> Result<(), BslError> {
        self.send_byte_with_echo(KernelCommand::SoftReset as u8)?;
        self.phase = BslPhase::Idle;
        Ok(())
    }

    /// Jumps into the user program; the session is over afterwards
    pub fn jump_to_user(&mut self) -> Result<(), BslError> {
        self.send_byte_with_echo(KernelCommand::JumpToUser as u8)?;
        self.phase = BslPhase::Idle;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted port: echoes everything written and plays back queued
    /// target responses.
    pub struct MockBslPort {
        pub written: Vec<u8>,
        pub responses: VecDeque<u8>,
        echo_queue: VecDeque<u8>,
    }

    impl MockBslPort {
        pub fn new(responses: &[u8]) -> Self {
            Self {
                written: Vec::new(),
                responses: responses.iter().copied().collect(),
                echo_queue: VecDeque::new(),
            }
        }
    }

    impl BslPort for MockBslPort {
        fn write_bytes(&mut self, data: &[u8]) -> Result<(), BslError> {
            self.written.extend_from_slice(data);
            self.echo_queue.extend(data.iter().copied());
            Ok(())
        }

        fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, BslError> {
            let mut out = Vec::with_capacity(len);
            while out.len() < len {
                if let Some(b) = self.echo_queue.pop_front() {
                    out.push(b);
                } else if let Some(b) = self.responses.pop_front() {
                    out.push(b);
                } else {
                    break;
                }
            }
            Ok(out)
        }

        fn set_dtr(&mut self, _level: bool) -> Result<(), BslError> {
            Ok(())
        }

        fn set_rts(&mut self, _level: bool) -> Result<(), BslError> {
            Ok(())
        }

        fn drain_input(&mut self) -> Result<(), BslError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockBslPort;
    use super::*;

    #[test]
    fn xor_checksum_folds_all_bytes() {
        assert_eq!(block_checksum(&[]), 0);
        assert_eq!(block_checksum(&[0x12, 0x34, 0x56]), 0x12 ^ 0x34 ^ 0x56);
    }

    #[test]
    fn hello_with_running_kernel_skips_upload() {
        // 0xAA to hello, then AA EA for the communication test
        let port = MockBslPort::new(&[0xAA, 0xAA, 0xEA]);
        let mut loader = BslLoader::new(Box::new(port));
        loader.connect(&BslAssets::default()).unwrap();
        assert_eq!(loader.phase(), BslPhase::KernelRunning);
        assert_eq!(loader.cpu_variant(), None);
    }

    #[test]
    fn hello_variant_tag_triggers_two_stage_upload() {
        // Tag 0xC5, loader started, application started, then AA EA
        let port = MockBslPort::new(&[0xC5, I_LOADER_STARTED, I_APPLICATION_STARTED, 0xAA, 0xEA]);
        let mut loader = BslLoader::new(Box::new(port));
        let assets = BslAssets {
            bootstrap: vec![0x10, 0x20],
            kernel: vec![0x30, 0x40, 0x50],
            ..Default::default()
        };
        loader.connect(&assets).unwrap();
        assert_eq!(loader.phase(), BslPhase::KernelRunning);
        assert_eq!(loader.cpu_variant(), Some(CpuVariant::C167Cr));
    }

    #[test]
    fn write_word_round_trips_through_readback() {
        // WriteWord: ACK1, data ACK2; ReadWord: ACK1, word lo/hi + ACK2
        let port = MockBslPort::new(&[0xAA, 0xEA, 0xAA, 0xAD, 0xDE, 0xEA]);
        let mut loader = BslLoader::new(Box::new(port));
        loader.write_word(0x00FF12, 0xDEAD).unwrap();
    }

    #[test]
    fn readback_mismatch_is_an_error() {
        let port = MockBslPort::new(&[0xAA, 0xEA, 0xAA, 0x00, 0x00, 0xEA]);
        let mut loader = BslLoader::new(Box::new(port));
        assert!(matches!(
            loader.write_word(0x00FF12, 0xDEAD),
            Err(BslError::RegisterReadbackMismatch { .. })
        ));
    }

    #[test]
    fn block_write_verifies_kernel_checksum() {
        let data = [0x01u8, 0x02, 0x03, 0xF0];
        let cks = block_checksum(&data);
        // WriteBlock ACK1, data ACK2, checksum reply: ACK1, cks, ACK2
        let port = MockBslPort::new(&[0xAA, 0xEA, 0xAA, cks, 0xEA]);
        let mut loader = BslLoader::new(Box::new(port));
        loader.write_block(0x00F600, &data).unwrap();
    }

    #[test]
    fn call_function_returns_eight_registers() {
        let mut responses = vec![0xAA];
        for word in 0u16..8 {
            responses.extend_from_slice(&[word as u8, 0x00]);
        }
        responses.push(0xEA);
        let port = MockBslPort::new(&responses);
        let mut loader = BslLoader::new(Box::new(port));
        let regs = loader.call_function(0x00F640, [0x0006, 0, 0x80, 0x80, 0, 0, 1, 1]).unwrap();
        assert_eq!(regs[1], 0x0001);
        assert_eq!(regs[7], 0x0007);
    }
}
