//! ISO-TP over socketCAN adapter (Linux only)
//!
//! KWP2000 payloads travel unframed here; segmentation, padding and flow
//! control are ISO-TP's job, below this layer.

use std::time::{Duration, Instant};

use log::debug;
use socketcan_isotp::{
    FlowControlOptions, Id, IsoTpBehaviour, IsoTpOptions, IsoTpSocket, LinkLayerOptions, StandardId,
};

use crate::channel::{ChannelError, ChannelResult, Kwp2000Channel};

/// ISO-TP channel on a socketCAN network interface
pub struct CanIsoTpChannel {
    interface: String,
    tx_id: u16,
    rx_id: u16,
    timeout: Duration,
    socket: Option<IsoTpSocket>,
}

impl std::fmt::Debug for CanIsoTpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanIsoTpChannel")
            .field("interface", &self.interface)
            .field("tx_id", &self.tx_id)
            .field("rx_id", &self.rx_id)
            .field("open", &self.socket.is_some())
            .finish()
    }
}

impl CanIsoTpChannel {
    /// Creates a channel on the given network interface (e.g. `can0`)
    pub fn new(interface: &str, tx_id: u16, rx_id: u16) -> Self {
        Self {
            interface: interface.to_string(),
            tx_id,
            rx_id,
            timeout: Duration::from_secs(5),
            socket: None,
        }
    }

    fn socket(&mut self) -> ChannelResult<&mut IsoTpSocket> {
        self.socket.as_mut().ok_or(ChannelError::InterfaceNotOpen)
    }
}

impl Kwp2000Channel for CanIsoTpChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        debug!(
            "opening ISO-TP socket on {} (tx 0x{:03X}, rx 0x{:03X})",
            self.interface, self.tx_id, self.rx_id
        );
        let opts = IsoTpOptions::new(
            IsoTpBehaviour::CAN_ISOTP_TX_PADDING | IsoTpBehaviour::CAN_ISOTP_RX_PADDING,
            Duration::from_millis(0),
            0,
            0x00,
            0x00,
            0,
        )
        .map_err(|e| ChannelError::ApiError {
            api: "socketCAN",
            desc: e.to_string(),
        })?;

        let tx = Id::Standard(
            StandardId::new(self.tx_id).ok_or(ChannelError::UnsupportedRequest)?,
        );
        let rx = Id::Standard(
            StandardId::new(self.rx_id).ok_or(ChannelError::UnsupportedRequest)?,
        );

        let socket = IsoTpSocket::open_with_opts(
            &self.interface,
            rx,
            tx,
            Some(opts),
            Some(FlowControlOptions::new(8, 20, 0)),
            Some(LinkLayerOptions::default()),
        )
        .map_err(|e| ChannelError::ApiError {
            api: "socketCAN",
            desc: e.to_string(),
        })?;
        socket.set_nonblocking(true).map_err(|e| ChannelError::ApiError {
            api: "socketCAN",
            desc: e.to_string(),
        })?;
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.socket = None;
        Ok(())
    }

    fn set_baudrate(&mut self, baud: u32) -> ChannelResult<()> {
        // The CAN bit rate is a property of the network interface,
        // configured outside this process (`ip link set canX type can ...`);
        // KWP baud negotiation only matters on K-line.
        log::warn!("ignoring baud rate change to {baud} on an ISO-TP channel");
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> ChannelResult<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn send_request(&mut self, payload: &[u8]) -> ChannelResult<()> {
        debug!("ISO-TP TX {payload:02X?}");
        self.socket()?.write(payload).map_err(ChannelError::IoError)
    }

    fn read_response(&mut self) -> ChannelResult<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let socket = self.socket()?;
        loop {
            if let Ok(data) = socket.read() {
                debug!("ISO-TP RX {data:02X?}");
                return Ok(data.to_vec());
            }
            if Instant::now() >= deadline {
                return Err(ChannelError::ReadTimeout);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn drain_input(&mut self) -> ChannelResult<()> {
        let socket = self.socket()?;
        while socket.read().is_ok() {}
        Ok(())
    }
}
