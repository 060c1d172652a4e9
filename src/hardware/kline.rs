//! K-line (ISO14230) serial adapter
//!
//! 8N1, hardware and software flow control off, DTR/RTS driven low. Every
//! byte written to the K-line is mirrored back by the wire itself; the
//! adapter consumes that local echo after each transmission, before the
//! ECU's reply is read.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::channel::{ChannelError, ChannelResult, Kwp2000Channel};
use crate::hardware::{HardwareError, HardwareResult};
use crate::kwp2000::frame;

/// Lists the serial interfaces present on this machine
pub fn list_ports() -> HardwareResult<Vec<String>> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|e| HardwareError::ApiError {
            desc: e.to_string(),
        })
}

/// Checks that the named interface exists, naming the available ones in
/// the error when it does not. Device nodes not enumerated by the serial
/// stack (symlinks, pseudo-terminals) pass if the path exists.
pub fn resolve_port(interface: &str) -> HardwareResult<String> {
    let ports = list_ports()?;
    if ports.iter().any(|p| p == interface) || std::path::Path::new(interface).exists() {
        Ok(interface.to_string())
    } else {
        Err(HardwareError::DeviceNotFound {
            name: format!("{interface} (available: {})", ports.join(", ")),
        })
    }
}

/// Quiet time the bus must have seen before a fast-init waveform
const BUS_IDLE_BEFORE_INIT: Duration = Duration::from_millis(300);
/// LOW and HIGH hold times of the fast-init wake-up pulse. Contract per
/// ISO14230-2; ECUs outside roughly +-5% of this window may not answer.
const WAKE_UP_PULSE: Duration = Duration::from_millis(25);
/// Gap enforced between the end of one exchange and the next request
const INTER_REQUEST_GAP: Duration = Duration::from_millis(50);

/// K-line channel over a serial adapter (FTDI KKL cable or similar)
pub struct KLineChannel {
    interface: String,
    baudrate: u32,
    tx_id: u16,
    rx_id: u16,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
    last_exchange: Option<Instant>,
}

impl std::fmt::Debug for KLineChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KLineChannel")
            .field("interface", &self.interface)
            .field("baudrate", &self.baudrate)
            .field("tx_id", &self.tx_id)
            .field("rx_id", &self.rx_id)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl KLineChannel {
    /// Creates a channel for the given serial interface. Nothing is opened
    /// until [Kwp2000Channel::open] is called.
    pub fn new(interface: &str, baudrate: u32, tx_id: u16, rx_id: u16) -> Self {
        Self {
            interface: interface.to_string(),
            baudrate,
            tx_id,
            rx_id,
            timeout: Duration::from_secs(5),
            port: None,
            last_exchange: None,
        }
    }

    fn port(&mut self) -> ChannelResult<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(ChannelError::InterfaceNotOpen)
    }

    fn map_io(e: std::io::Error) -> ChannelError {
        if e.kind() == std::io::ErrorKind::TimedOut {
            ChannelError::ReadTimeout
        } else {
            ChannelError::IoError(e)
        }
    }

    fn read_exact(&mut self, len: usize) -> ChannelResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.port()?.read_exact(&mut buf).map_err(Self::map_io)?;
        Ok(buf)
    }

    /// Waits out the inter-request gap measured from the previous exchange
    fn respect_request_gap(&mut self) {
        if let Some(last) = self.last_exchange {
            let elapsed = last.elapsed();
            if elapsed < INTER_REQUEST_GAP {
                std::thread::sleep(INTER_REQUEST_GAP - elapsed);
            }
        }
    }

    /// Writes one frame and consumes its local echo
    fn transmit_frame(&mut self, wire: &[u8]) -> ChannelResult<()> {
        let port = self.port()?;
        port.write_all(wire).map_err(Self::map_io)?;
        port.flush().map_err(Self::map_io)?;
        let echo = self.read_exact(wire.len())?;
        if echo != wire {
            // A mismatching echo usually means bus contention; the response
            // read that follows will fail loudly if the frame was mangled.
            warn!("K-line echo mismatch: sent {wire:02X?}, echoed {echo:02X?}");
        }
        Ok(())
    }
}

impl Kwp2000Channel for KLineChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        debug!(
            "opening K-line interface {} at {} baud",
            self.interface, self.baudrate
        );
        let mut port = serialport::new(&self.interface, self.baudrate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open()
            .map_err(|e| ChannelError::ApiError {
                api: "serialport",
                desc: e.to_string(),
            })?;
        port.write_data_terminal_ready(false)
            .map_err(|e| ChannelError::ApiError {
                api: "serialport",
                desc: e.to_string(),
            })?;
        port.write_request_to_send(false)
            .map_err(|e| ChannelError::ApiError {
                api: "serialport",
                desc: e.to_string(),
            })?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.port = None;
        Ok(())
    }

    fn set_baudrate(&mut self, baud: u32) -> ChannelResult<()> {
        debug!("reprogramming K-line baud rate to {baud}");
        self.port()?
            .set_baud_rate(baud)
            .map_err(|e| ChannelError::ApiError {
                api: "serialport",
                desc: e.to_string(),
            })?;
        self.baudrate = baud;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> ChannelResult<()> {
        self.timeout = timeout;
        if let Some(port) = self.port.as_mut() {
            port.set_timeout(timeout).map_err(|e| ChannelError::ApiError {
                api: "serialport",
                desc: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn send_request(&mut self, payload: &[u8]) -> ChannelResult<()> {
        self.respect_request_gap();
        let wire = frame::encode(self.tx_id, payload);
        debug!("K-line TX {wire:02X?}");
        self.transmit_frame(&wire)?;
        self.last_exchange = Some(Instant::now());
        Ok(())
    }

    fn read_response(&mut self) -> ChannelResult<Vec<u8>> {
        // Header first: format byte plus the two address bytes, then the
        // extended length byte if the 6-bit length field is zero.
        let mut wire = self.read_exact(3)?;
        let fmt = wire[0];
        if frame::header_len_after_fmt(fmt) == 3 {
            wire.extend(self.read_exact(1)?);
        }
        let payload_len = frame::announced_payload_len(fmt, wire.get(3).copied())?;
        wire.extend(self.read_exact(payload_len + 1)?);
        debug!("K-line RX {wire:02X?}");

        let decoded = frame::decode(&wire)?;
        if decoded.addr != self.rx_id {
            warn!(
                "response addressed 0x{:04X}, expected 0x{:04X}",
                decoded.addr, self.rx_id
            );
        }
        self.last_exchange = Some(Instant::now());
        Ok(decoded.payload)
    }

    fn drain_input(&mut self) -> ChannelResult<()> {
        self.port()?
            .clear(ClearBuffer::Input)
            .map_err(|e| ChannelError::ApiError {
                api: "serialport",
                desc: e.to_string(),
            })
    }

    fn fast_init(&mut self, payload: &[u8]) -> ChannelResult<()> {
        self.open()?;
        self.drain_input()?;
        debug!("fast-init: idling bus before wake-up pulse");
        std::thread::sleep(BUS_IDLE_BEFORE_INIT);

        let port = self.port()?;
        port.set_break().map_err(|e| ChannelError::ApiError {
            api: "serialport",
            desc: e.to_string(),
        })?;
        std::thread::sleep(WAKE_UP_PULSE);
        port.clear_break().map_err(|e| ChannelError::ApiError {
            api: "serialport",
            desc: e.to_string(),
        })?;
        std::thread::sleep(WAKE_UP_PULSE);

        let wire = frame::encode(self.tx_id, payload);
        debug!("fast-init TX {wire:02X?}");
        self.transmit_frame(&wire)?;
        self.last_exchange = Some(Instant::now());
        Ok(())
    }
}
