//! Simulated ECU channel for unit testing the layers above the wire
//!
//! A responder callback plays the ECU: it receives each request payload
//! and returns zero or more response payloads, which are queued and handed
//! out by subsequent reads. Returning several responses models the
//! "response pending" pattern (0x7F .. 0x78 frames followed by the real
//! answer).

use std::collections::VecDeque;
use std::time::Duration;

use crate::channel::{ChannelError, ChannelResult, Kwp2000Channel};

/// Scripted [Kwp2000Channel] used by the unit tests
pub struct SimulationChannel {
    responder: Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>,
    rx_queue: VecDeque<Vec<u8>>,
    baudrate: u32,
    timeout: Duration,
}

impl std::fmt::Debug for SimulationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationChannel")
            .field("queued", &self.rx_queue.len())
            .field("baudrate", &self.baudrate)
            .finish()
    }
}

impl SimulationChannel {
    /// Creates a simulated channel around an ECU responder callback
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        Self {
            responder: Box::new(responder),
            rx_queue: VecDeque::new(),
            baudrate: 10400,
            timeout: Duration::from_millis(100),
        }
    }

    /// Link baud the simulated ECU was last switched to
    pub fn baudrate(&self) -> u32 {
        self.baudrate
    }
}

impl Kwp2000Channel for SimulationChannel {
    fn open(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn set_baudrate(&mut self, baud: u32) -> ChannelResult<()> {
        self.baudrate = baud;
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
        for response in (self.responder)(payload) {
            self.rx_queue.push_back(response);
        }
        Ok(())
    }

    fn read_response(&mut self) -> ChannelResult<Vec<u8>> {
        self.rx_queue
            .pop_front()
            .ok_or(ChannelError::ReadTimeout)
    }

    fn drain_input(&mut self) -> ChannelResult<()> {
        self.rx_queue.clear();
        Ok(())
    }

    fn fast_init(&mut self, payload: &[u8]) -> ChannelResult<()> {
        self.send_request(payload)
    }
}
