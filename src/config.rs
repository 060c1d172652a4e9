//! YAML configuration model (`gkflasher.yml`)

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::DiagServerResult;

/// Wire protocol selection
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// KWP2000 over K-line serial
    Kline,
    /// KWP2000 over ISO-TP on CAN
    Canbus,
}

/// K-line interface parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KLineConfig {
    /// Serial interface (e.g. `/dev/ttyUSB0` or `COM3`)
    pub interface: String,
    /// Initial link baud rate
    #[serde(default = "default_kline_baudrate")]
    pub baudrate: u32,
    /// Request addressing pair (target byte high, source byte low)
    #[serde(default = "default_tx_id")]
    pub tx_id: u16,
    /// Response addressing pair
    #[serde(default = "default_rx_id")]
    pub rx_id: u16,
}

fn default_kline_baudrate() -> u32 {
    10400
}

fn default_tx_id() -> u16 {
    0x11F1
}

fn default_rx_id() -> u16 {
    0xF111
}

/// CAN interface parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanbusConfig {
    /// socketCAN interface name (e.g. `can0`)
    pub interface: String,
    /// Request CAN identifier
    pub tx_id: u16,
    /// Response CAN identifier
    pub rx_id: u16,
}

/// Top level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlasherConfig {
    /// Selected wire protocol
    pub protocol: Protocol,
    /// K-line parameters, required when `protocol` is kline
    pub kline: Option<KLineConfig>,
    /// CAN parameters, required when `protocol` is canbus
    pub canbus: Option<CanbusConfig>,
}

impl FlasherConfig {
    /// Loads the configuration from a YAML file
    pub fn load(path: &Path) -> DiagServerResult<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_config_parses_with_defaults() {
        let cfg: FlasherConfig = serde_yaml::from_str(
            "protocol: kline\nkline:\n  interface: /dev/ttyUSB0\n",
        )
        .unwrap();
        assert_eq!(cfg.protocol, Protocol::Kline);
        let kline = cfg.kline.unwrap();
        assert_eq!(kline.baudrate, 10400);
        assert_eq!(kline.tx_id, 0x11F1);
        assert_eq!(kline.rx_id, 0xF111);
    }

    #[test]
    fn canbus_config_parses() {
        let cfg: FlasherConfig = serde_yaml::from_str(
            "protocol: canbus\ncanbus:\n  interface: can0\n  tx_id: 0x7E0\n  rx_id: 0x7E8\n",
        )
        .unwrap();
        assert_eq!(cfg.protocol, Protocol::Canbus);
        assert_eq!(cfg.canbus.unwrap().tx_id, 0x7E0);
    }
}
