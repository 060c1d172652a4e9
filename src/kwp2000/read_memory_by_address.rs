//! Raw memory access services (read/write by address, write by local id)

use super::{Kwp2000Cmd, Kwp2000Protocol, ServiceId};
use crate::{DiagError, DiagServerResult};

fn address_bytes(address: u32) -> [u8; 3] {
    [(address >> 16) as u8, (address >> 8) as u8, address as u8]
}

impl Kwp2000Protocol {
    /// Reads `size` bytes at a 24-bit physical address. The SIMK4x pads
    /// responses with trailing zero bytes; the result is truncated to the
    /// requested size.
    pub fn read_memory_by_address(&mut self, address: u32, size: u8) -> DiagServerResult<Vec<u8>> {
        let [a1, a2, a3] = address_bytes(address);
        let resp = self.execute(Kwp2000Cmd::new(
            ServiceId::ReadMemoryByAddress,
            &[a1, a2, a3, size],
            true,
        ))?;
        let mut data = resp.into_data();
        if data.len() < size as usize {
            return Err(DiagError::InvalidResponseLength);
        }
        data.truncate(size as usize);
        Ok(data)
    }

    /// Writes up to 255 bytes at a 24-bit physical address
    pub fn write_memory_by_address(&mut self, address: u32, data: &[u8]) -> DiagServerResult<()> {
        if data.is_empty() || data.len() > 0xFF {
            return Err(DiagError::ParameterInvalid);
        }
        let [a1, a2, a3] = address_bytes(address);
        let mut args = vec![a1, a2, a3, data.len() as u8];
        args.extend_from_slice(data);
        self.execute(Kwp2000Cmd::new(ServiceId::WriteMemoryByAddress, &args, true))?;
        Ok(())
    }

    /// Writes a data record by local identifier (e.g. 0x90 for the VIN)
    pub fn write_data_by_local_identifier(
        &mut self,
        identifier: u8,
        data: &[u8],
    ) -> DiagServerResult<()> {
        let mut args = vec![identifier];
        args.extend_from_slice(data);
        self.execute(Kwp2000Cmd::new(
            ServiceId::WriteDataByLocalIdentifier,
            &args,
            true,
        ))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::SimulationChannel;

    #[test]
    fn read_truncates_zero_padding() {
        let channel = SimulationChannel::new(|req| match req {
            [0x23, 0x09, 0x00, 0x40, 0x04] => {
                vec![vec![0x63, b'c', b'a', b'6', b'6', 0x00, 0x00, 0x00]]
            }
            _ => vec![],
        });
        let mut kwp = Kwp2000Protocol::new(Box::new(channel));
        let data = kwp.read_memory_by_address(0x090040, 4).unwrap();
        assert_eq!(data, b"ca66");
    }
}
