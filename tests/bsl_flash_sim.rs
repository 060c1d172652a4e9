//! External flash programming against a scripted monitor kernel.
//!
//! The simulator speaks the kernel's byte ABI (echo per byte, 0xAA/0xEA
//! acknowledges, XOR block checksums) and models an AM29F400BB behind the
//! flash driver's call interface, so chip detection, the sector erase walk
//! and the 512-byte program loop run end to end.

use std::collections::VecDeque;

use gkflasher::bsl::flash::{DRIVER_COPY_ADDRESS, EXT_FLASH_ADDRESS};
use gkflasher::bsl::{block_checksum, BslAssets, BslError, BslLoader, BslPort, TargetVariant};
use gkflasher::NullProgress;

const ACK1: u8 = 0xAA;
const ACK2: u8 = 0xEA;

const FC_PROG: u16 = 0x00;
const FC_ERASE: u16 = 0x01;
const FC_GETSTATE: u16 = 0x06;

#[derive(Debug)]
enum Expect {
    Command,
    /// Fixed-length data phase for the given command opcode
    Data(u8, usize),
    /// Write-block header (address + length), before the payload
    BlockHeader,
    /// Write-block payload of known length, prefixed by its header
    BlockPayload(Vec<u8>, usize),
}

/// Kernel-side simulation: echoes input, tracks register words, blocks and
/// driver calls, and answers like the monitor kernel does.
struct KernelSim {
    echo: VecDeque<u8>,
    out: VecDeque<u8>,
    pending: Vec<u8>,
    expect: Expect,
    hello_done: bool,
    last_block: Vec<u8>,
    last_checksum: u8,
    /// Full R8-R15 register image per driver call (function code in R8)
    calls: Vec<[u16; 8]>,
    /// Data programmed per FC_PROG call: (flash offset, bytes)
    programmed: Vec<(u32, Vec<u8>)>,
}

impl KernelSim {
    fn new() -> Self {
        Self {
            echo: VecDeque::new(),
            out: VecDeque::new(),
            pending: Vec::new(),
            expect: Expect::Command,
            hello_done: false,
            last_block: Vec::new(),
            last_checksum: 0,
            calls: Vec::new(),
            programmed: Vec::new(),
        }
    }

    fn feed(&mut self, byte: u8) {
        self.pending.push(byte);
        match &self.expect {
            Expect::Command => {
                let command = self.pending.remove(0);
                if !self.hello_done {
                    // Boot ROM hello: kernel already resident
                    assert_eq!(command, 0x00, "first byte must be the hello");
                    self.hello_done = true;
                    self.out.push_back(ACK1);
                    return;
                }
                match command {
                    0x93 => {
                        self.out.push_back(ACK1);
                        self.out.push_back(ACK2);
                    }
                    0x82 => {
                        self.out.push_back(ACK1);
                        self.expect = Expect::Data(0x82, 5);
                    }
                    0xCD => {
                        self.out.push_back(ACK1);
                        self.expect = Expect::Data(0xCD, 3);
                    }
                    0x84 => {
                        self.out.push_back(ACK1);
                        self.expect = Expect::BlockHeader;
                    }
                    0x9F => {
                        self.out.push_back(ACK1);
                        self.expect = Expect::Data(0x9F, 19);
                    }
                    0x33 => {
                        self.out.push_back(ACK1);
                        self.out.push_back(self.last_checksum);
                        self.out.push_back(ACK2);
                    }
                    other => panic!("kernel sim got unexpected command 0x{other:02X}"),
                }
            }
            Expect::Data(command, len) => {
                if self.pending.len() < *len {
                    return;
                }
                let command = *command;
                let data = std::mem::take(&mut self.pending);
                self.expect = Expect::Command;
                self.handle_data(command, &data);
            }
            Expect::BlockHeader => {
                if self.pending.len() < 5 {
                    return;
                }
                let header = self.pending[..5].to_vec();
                let len = header[3] as usize | (header[4] as usize) << 8;
                self.pending.clear();
                self.expect = Expect::BlockPayload(header, len);
            }
            Expect::BlockPayload(header, len) => {
                if self.pending.len() < *len {
                    return;
                }
                let header = header.clone();
                let data = std::mem::take(&mut self.pending);
                self.expect = Expect::Command;
                self.last_checksum = block_checksum(&data);
                if address_of(&header) == DRIVER_COPY_ADDRESS {
                    self.last_block = data;
                }
                self.out.push_back(ACK2);
            }
        }
    }

    fn handle_data(&mut self, command: u8, data: &[u8]) {
        match command {
            // Word writes are acknowledged and verified by readback; the
            // sim accepts everything and mirrors the last written value.
            0x82 => {
                self.last_block = data[3..5].to_vec();
                self.out.push_back(ACK2);
            }
            0xCD => {
                self.out.push_back(self.last_block.first().copied().unwrap_or(0));
                self.out.push_back(self.last_block.get(1).copied().unwrap_or(0));
                self.out.push_back(ACK2);
            }
            0x9F => {
                let mut registers = [0u16; 8];
                for (i, slot) in registers.iter_mut().enumerate() {
                    *slot = data[3 + i * 2] as u16 | (data[4 + i * 2] as u16) << 8;
                }
                self.calls.push(registers);
                let ret = self.driver_call(registers);
                for word in ret {
                    self.out.push_back(word as u8);
                    self.out.push_back((word >> 8) as u8);
                }
                self.out.push_back(ACK2);
            }
            other => panic!("unexpected data phase for 0x{other:02X}"),
        }
    }

    /// Models the 29Fx00B driver: ID probe answers as an AM29F400BB
    /// (AMD 0x01, device 0xAB, bottom boot), erase and program succeed.
    fn driver_call(&mut self, registers: [u16; 8]) -> [u16; 8] {
        let mut ret = [0u16; 8];
        match registers[0] {
            FC_GETSTATE => {
                ret[1] = match registers[6] {
                    0 => 0x0001,
                    _ => 0x00AB,
                };
            }
            FC_ERASE => {
                ret[7] = 0;
            }
            FC_PROG => {
                let offset =
                    (registers[6] as u32) << 16 | registers[5] as u32;
                self.programmed
                    .push((offset - EXT_FLASH_ADDRESS, self.last_block.clone()));
                ret[7] = 0;
            }
            other => panic!("driver sim got unexpected function code 0x{other:04X}"),
        }
        ret
    }
}

fn address_of(header: &[u8]) -> u32 {
    header[0] as u32 | (header[1] as u32) << 8 | (header[2] as u32) << 16
}

/// Shared handle so the test can inspect the sim after the loader consumed
/// the port.
struct SimPort(std::sync::Arc<std::sync::Mutex<KernelSim>>);

impl BslPort for SimPort {
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), BslError> {
        let mut sim = self.0.lock().unwrap();
        for byte in data {
            sim.echo.push_back(*byte);
            sim.feed(*byte);
        }
        Ok(())
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, BslError> {
        let mut sim = self.0.lock().unwrap();
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            if let Some(b) = sim.echo.pop_front() {
                out.push(b);
            } else if let Some(b) = sim.out.pop_front() {
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

fn assets() -> BslAssets {
    BslAssets {
        bootstrap: vec![0x11; 32],
        kernel: vec![0x22; 64],
        driver_v6: vec![0x33; 128],
        driver_i4: vec![0x44; 128],
    }
}

#[test]
fn write_external_flash_erases_and_programs_non_ff_blocks() {
    let sim = std::sync::Arc::new(std::sync::Mutex::new(KernelSim::new()));
    let mut loader = BslLoader::new(Box::new(SimPort(sim.clone())));
    loader.connect(&assets()).unwrap();

    // Two 512 byte blocks of content, one all-0xFF block between them
    let mut image = vec![0xFF_u8; 0x600];
    image[..0x200].fill(0x5A);
    image[0x400..].fill(0xA5);

    loader
        .write_external_flash(
            &assets(),
            Some(TargetVariant::V6),
            &image,
            &mut NullProgress,
        )
        .unwrap();

    let sim = sim.lock().unwrap();

    // Bottom-boot AM29F400BB: 0x600 bytes fall inside the first 16K sector
    let erase_calls: Vec<_> = sim.calls.iter().filter(|c| c[0] == FC_ERASE).collect();
    assert_eq!(erase_calls.len(), 1);
    assert_eq!(erase_calls[0][6], 0, "first sector erased");

    // The all-0xFF middle block is skipped
    assert_eq!(sim.programmed.len(), 2);
    assert_eq!(sim.programmed[0].0, 0x000);
    assert!(sim.programmed[0].1.iter().all(|b| *b == 0x5A));
    assert_eq!(sim.programmed[1].0, 0x400);
    assert!(sim.programmed[1].1.iter().all(|b| *b == 0xA5));
}

#[test]
fn hw_info_reports_the_probed_chip() {
    let sim = std::sync::Arc::new(std::sync::Mutex::new(KernelSim::new()));
    let mut loader = BslLoader::new(Box::new(SimPort(sim)));
    loader.connect(&assets()).unwrap();

    let (variant, chip) = loader.detect_chip(&assets(), Some(TargetVariant::V6)).unwrap();
    assert_eq!(variant, TargetVariant::V6);
    assert_eq!(chip.name, "AM29F400BB");
    assert_eq!(chip.size_bytes, 1 << 19);
}
