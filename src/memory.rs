//! Paged memory reads and chunked flash writes
//!
//! Reads partition the requested range into 16 KiB pages and never abort on
//! a bad address: negative responses leave 0xFF in the affected slice and
//! the read moves on, so a partial dump is always produced. Transport
//! timeouts retry the same sub-request; the per-operation timeout of the
//! session engine is the real bound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;

use crate::ecu::Ecu;
use crate::kwp2000::data_transfer::{CompressionType, EncryptionType, MAX_BLOCK_SIZE};
use crate::kwp2000::Kwp2000Protocol;
use crate::{DiagError, DiagServerResult, ProgressSink};

/// Read page granularity
pub const PAGE_SIZE: usize = 16384;

/// Cooperative cancellation flag, checked between sub-requests of paged
/// reads and chunked writes. Cancelling leaves the ECU session valid.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token in the not-cancelled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; the running operation stops at its next
    /// sub-request boundary.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// True once [CancellationToken::cancel] has been called
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    fn check(&self) -> DiagServerResult<()> {
        if self.is_cancelled() {
            Err(DiagError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Rounds `n` up to the nearest multiple of `multiple`
pub fn round_to_multiple(n: usize, multiple: usize) -> usize {
    n.div_ceil(multiple) * multiple
}

/// Length of the payload once trailing 0xFF filler is trimmed, rounded up
/// to the transfer quantum so the last meaningful byte is always included.
/// An all-0xFF payload trims to zero; the caller skips the write entirely.
pub fn dynamic_find_end(payload: &[u8]) -> usize {
    match payload.iter().rposition(|b| *b != 0xFF) {
        Some(last) => round_to_multiple(last + 1, MAX_BLOCK_SIZE).min(payload.len()),
        None => 0,
    }
}

fn read_page(
    kwp: &mut Kwp2000Protocol,
    ecu: &Ecu,
    offset: u32,
    len: usize,
    progress: &mut dyn ProgressSink,
    cancel: &CancellationToken,
) -> DiagServerResult<Vec<u8>> {
    let stop = offset + len as u32;
    let mut payload = vec![0xFF_u8; len];
    let mut address = offset;

    while address < stop {
        cancel.check()?;
        let mut at_a_time = ecu.adjust_read_size(address, MAX_BLOCK_SIZE as u8);
        if (stop - address) < at_a_time as u32 {
            at_a_time = (stop - address) as u8;
        }
        match ecu.read_memory(kwp, address, at_a_time) {
            Ok(fetched) => {
                let start = (address - offset) as usize;
                payload[start..start + fetched.len()].copy_from_slice(&fetched);
            }
            Err(e) if e.is_timeout() => {
                warn!("timeout at 0x{address:06X}, trying again");
                continue;
            }
            Err(DiagError::NegativeResponse { status, .. }) => {
                warn!(
                    "negative response (status 0x{status:02X}) at 0x{address:06X}, \
                     filling the requested slice with 0xFF"
                );
            }
            Err(e) => return Err(e),
        }
        address += at_a_time as u32;
        progress.advance(at_a_time as usize);
    }
    Ok(payload)
}

/// Reads `[address_start, address_stop)` into a contiguous buffer of
/// exactly `address_stop - address_start` bytes. Gaps left by negative
/// responses hold 0xFF.
pub fn read_memory(
    kwp: &mut Kwp2000Protocol,
    ecu: &Ecu,
    address_start: u32,
    address_stop: u32,
    progress: &mut dyn ProgressSink,
    cancel: &CancellationToken,
) -> DiagServerResult<Vec<u8>> {
    let requested = (address_stop - address_start) as usize;
    let pages = requested.div_ceil(PAGE_SIZE);
    let mut buffer = Vec::with_capacity(requested);
    let mut address = address_start;

    progress.begin(requested);
    let mut page = 0;
    while address < address_stop {
        page += 1;
        progress.phase(&format!("Page {page}/{pages}, offset 0x{address:06X}"));
        let len = PAGE_SIZE.min((address_stop - address) as usize);
        let fetched = read_page(kwp, ecu, address, len, progress, cancel)?;
        buffer.extend_from_slice(&fetched);
        address += len as u32;
    }
    Ok(buffer)
}

/// Writes `payload` to flash at `flash_start` as an announced download of
/// 254 byte blocks. Each block retries indefinitely on transport timeout.
pub fn write_memory(
    kwp: &mut Kwp2000Protocol,
    payload: &[u8],
    flash_start: u32,
    progress: &mut dyn ProgressSink,
    cancel: &CancellationToken,
) -> DiagServerResult<()> {
    kwp.request_download(
        flash_start,
        payload.len() as u32,
        CompressionType::Uncompressed,
        EncryptionType::Unencrypted,
    )?;

    let packets = payload.len().div_ceil(MAX_BLOCK_SIZE);
    progress.begin(payload.len());
    for (index, block) in payload.chunks(MAX_BLOCK_SIZE).enumerate() {
        cancel.check()?;
        progress.phase(&format!("Packet {}/{packets}", index + 1));
        loop {
            match kwp.transfer_data(block) {
                Ok(()) => break,
                Err(e) if e.is_timeout() => {
                    warn!("timeout at block {index}, trying again");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        progress.advance(block.len());
    }

    kwp.request_transfer_exit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::ECU_IDENTIFICATION_TABLE;
    use crate::hardware::simulation::SimulationChannel;
    use crate::NullProgress;

    fn kwp_with<F>(responder: F) -> Kwp2000Protocol
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        Kwp2000Protocol::new(Box::new(SimulationChannel::new(responder)))
    }

    #[test]
    fn trim_rounds_to_transfer_quantum() {
        let mut payload = vec![0xFF_u8; 254 * 8];
        payload[1000] = 0x12;
        let end = dynamic_find_end(&payload);
        assert_eq!(end % MAX_BLOCK_SIZE, 0);
        assert_eq!(end, 1016);
        assert!(payload[end..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn trim_keeps_byte_on_quantum_boundary() {
        let mut payload = vec![0xFF_u8; 254 * 8];
        payload[254 * 4] = 0x55;
        let end = dynamic_find_end(&payload);
        assert_eq!(end, 254 * 5);
    }

    #[test]
    fn all_ff_payload_trims_to_nothing() {
        assert_eq!(dynamic_find_end(&[0xFF; 1024]), 0);
        assert_eq!(dynamic_find_end(&[]), 0);
    }

    #[test]
    fn paged_read_fills_bad_window_with_ff() {
        // One 16 KiB page; any request touching [0x91000, 0x91010) is
        // rejected with status 0x11, modelling a dead eeprom page.
        let channel = SimulationChannel::new(|req| {
            if req[0] != 0x23 {
                return vec![];
            }
            let addr = (req[1] as u32) << 16 | (req[2] as u32) << 8 | req[3] as u32;
            let size = req[4] as u32;
            if addr < 0x91010 && addr + size > 0x91000 {
                return vec![vec![0x7F, 0x23, 0x11]];
            }
            let mut resp = vec![0x63];
            resp.extend((0..size).map(|i| (addr + i) as u8));
            vec![resp]
        });
        let mut kwp = Kwp2000Protocol::new(Box::new(channel));
        let ecu = Ecu::from_variant(&ECU_IDENTIFICATION_TABLE[0]);

        let buffer = read_memory(
            &mut kwp,
            &ecu,
            0x90000,
            0x94000,
            &mut NullProgress,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(buffer.len(), 0x4000);
        for i in 0..0x4000u32 {
            let expected = if (0x1000..0x1010).contains(&i) {
                0xFF
            } else {
                (0x90000 + i) as u8
            };
            assert_eq!(buffer[i as usize], expected, "mismatch at 0x{i:04X}");
        }
    }

    #[test]
    fn write_retries_blocks_on_timeout() {
        let mut starved = false;
        let mut kwp = kwp_with(move |req| match req[0] {
            0x34 => vec![vec![0x74]],
            0x36 => {
                // First block transfer gets no answer at all, forcing the
                // engine to retransmit it.
                if !starved {
                    starved = true;
                    vec![]
                } else {
                    vec![vec![0x76]]
                }
            }
            0x37 => vec![vec![0x77]],
            _ => vec![],
        });
        let payload = vec![0xAB_u8; 254 * 2 + 10];
        write_memory(
            &mut kwp,
            &payload,
            0xA0010,
            &mut NullProgress,
            &CancellationToken::new(),
        )
        .unwrap();
    }

    #[test]
    fn cancellation_surfaces_between_blocks() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut kwp = kwp_with(|req| match req[0] {
            0x34 => vec![vec![0x74]],
            _ => vec![],
        });
        let err = write_memory(&mut kwp, &[0u8; 300], 0xA0010, &mut NullProgress, &cancel)
            .unwrap_err();
        assert!(matches!(err, DiagError::Cancelled));
    }
}
