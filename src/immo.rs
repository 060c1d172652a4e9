//! Immobilizer routine sequences
//!
//! Every operation here drives a routine chain from the SIMK4x catalog
//! inside a default diagnostic session. Pins and passwords arrive as
//! arguments; prompting the operator (and double-confirming destructive
//! steps) is the front-end's job. Most changes apply only after the
//! ignition has been off for several seconds.

use log::{info, warn};

use crate::definitions::{BaudrateIndex, Routine};
use crate::kwp2000::security_access::SecurityAlgorithm;
use crate::kwp2000::start_diagnostic_session::SessionKind;
use crate::kwp2000::{Kwp2000Cmd, Kwp2000Protocol};
use crate::{definitions::AccessLevel, DiagServerResult};

/// Status codes shared by the ECU, key and SMARTRA status fields
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ImmoStatus {
    /// Not learnt
    NotLearnt,
    /// Learnt
    Learnt,
    /// Virgin
    Virgin,
    /// Neutral
    Neutral,
    /// Teaching not accepted, locked by wrong data (typically for an hour)
    LockedByWrongData,
    /// Virgin status, no teaching
    VirginNoTeaching,
    /// Invalid key
    InvalidKey,
    /// A code outside the documented table
    Unknown(u8),
}

impl From<u8> for ImmoStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::NotLearnt,
            1 => Self::Learnt,
            2 => Self::Virgin,
            3 => Self::Neutral,
            4 => Self::LockedByWrongData,
            5 => Self::VirginNoTeaching,
            6 => Self::InvalidKey,
            other => Self::Unknown(other),
        }
    }
}

impl std::fmt::Display for ImmoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLearnt => write!(f, "Not learnt"),
            Self::Learnt => write!(f, "Learnt"),
            Self::Virgin => write!(f, "Virgin"),
            Self::Neutral => write!(f, "Neutral"),
            Self::LockedByWrongData => write!(f, "Teaching not accepted (locked by wrong data)"),
            Self::VirginNoTeaching => write!(f, "Virgin status - no teaching"),
            Self::InvalidKey => write!(f, "Invalid key"),
            Self::Unknown(code) => write!(f, "Unknown status {code}"),
        }
    }
}

/// Result of the immobilizer info query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmoInfo {
    /// Number of keys the ECU has learnt
    pub keys_learnt: u8,
    /// ECU-side pairing status
    pub ecu_status: ImmoStatus,
    /// Key-side pairing status
    pub key_status: ImmoStatus,
    /// SMARTRA status, reported by later firmware only
    pub smartra_status: Option<ImmoStatus>,
}

/// Outcome of an immobilizer sequence
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ImmoOutcome {
    /// The sequence completed
    Done,
    /// The ECU rejected further attempts; it stays locked for about an
    /// hour after wrong data was presented
    LockedByWrongData,
}

fn start_default_session(
    kwp: &mut Kwp2000Protocol,
    desired_baudrate: Option<BaudrateIndex>,
) -> DiagServerResult<()> {
    kwp.start_diagnostic_session(SessionKind::Default, desired_baudrate)
}

fn locked(data: &[u8]) -> bool {
    data.get(1).copied().map(ImmoStatus::from) == Some(ImmoStatus::LockedByWrongData)
}

fn pin_bytes(pin: u32) -> [u8; 3] {
    [(pin >> 16) as u8, (pin >> 8) as u8, pin as u8]
}

/// Sends the 6 digit pin with the 0xFF filler bytes the routine expects
fn input_immo_password(kwp: &mut Kwp2000Protocol, pin: u32) -> DiagServerResult<Vec<u8>> {
    let [a, b, c] = pin_bytes(pin);
    kwp.start_routine(
        Routine::ImmoInputPassword,
        &[a, b, c, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
    )
}

/// Queries key count and pairing status. A negative response usually
/// means the immobilizer is simply not fitted; the caller decides how to
/// present that.
pub fn query_info(
    kwp: &mut Kwp2000Protocol,
    desired_baudrate: Option<BaudrateIndex>,
) -> DiagServerResult<ImmoInfo> {
    start_default_session(kwp, desired_baudrate)?;
    let data = kwp.start_routine(Routine::QueryImmoInfo, &[])?;
    Ok(ImmoInfo {
        keys_learnt: data.get(1).copied().unwrap_or(0),
        ecu_status: data.get(2).copied().unwrap_or(0xFF).into(),
        key_status: data.get(3).copied().unwrap_or(0xFF).into(),
        smartra_status: data.get(4).map(|s| (*s).into()),
    })
}

/// Activates limp home mode with the 4 digit password (factory default
/// 2345)
pub fn limp_home(
    kwp: &mut Kwp2000Protocol,
    desired_baudrate: Option<BaudrateIndex>,
    password: u16,
) -> DiagServerResult<ImmoOutcome> {
    start_default_session(kwp, desired_baudrate)?;
    let data = kwp.start_routine(Routine::BeforeLimpHome, &[])?;
    if locked(&data) {
        return Ok(ImmoOutcome::LockedByWrongData);
    }
    let data = kwp.start_routine(
        Routine::ActivateLimpHome,
        &[(password >> 8) as u8, password as u8],
    )?;
    if data.get(1) == Some(&1) {
        info!("limp home activated");
    }
    Ok(ImmoOutcome::Done)
}

/// Resets the immobilizer to virgin state using the 6 digit pin
pub fn immo_reset(
    kwp: &mut Kwp2000Protocol,
    desired_baudrate: Option<BaudrateIndex>,
    pin: u32,
) -> DiagServerResult<ImmoOutcome> {
    start_default_session(kwp, desired_baudrate)?;
    let data = kwp.start_routine(Routine::BeforeImmoReset, &[])?;
    if locked(&data) {
        return Ok(ImmoOutcome::LockedByWrongData);
    }
    input_immo_password(kwp, pin)?;
    kwp.start_routine(Routine::ImmoResetConfirm, &[0x01])?;
    info!("immobilizer reset; turn ignition off for 10 seconds to apply");
    Ok(ImmoOutcome::Done)
}

/// Neutralizes the SMARTRA unit using the 6 digit pin
pub fn smartra_neutralize(
    kwp: &mut Kwp2000Protocol,
    desired_baudrate: Option<BaudrateIndex>,
    pin: u32,
) -> DiagServerResult<ImmoOutcome> {
    start_default_session(kwp, desired_baudrate)?;
    let data = kwp.start_routine(Routine::BeforeSmartraNeutralize, &[])?;
    if locked(&data) {
        return Ok(ImmoOutcome::LockedByWrongData);
    }
    input_immo_password(kwp, pin)?;
    kwp.start_routine(Routine::SmartraNeutralize, &[0x01])?;
    info!("SMARTRA neutralized; turn ignition off for 5 seconds to apply");
    Ok(ImmoOutcome::Done)
}

/// Teaches a single key slot (0-3) after unlocking with the pin
pub fn teach_key(
    kwp: &mut Kwp2000Protocol,
    desired_baudrate: Option<BaudrateIndex>,
    index: u8,
    pin: u32,
) -> DiagServerResult<ImmoOutcome> {
    if index > 3 {
        return Err(crate::DiagError::ParameterInvalid);
    }
    start_default_session(kwp, desired_baudrate)?;
    let data = kwp.start_routine(Routine::BeforeImmoKeyTeaching, &[])?;
    if locked(&data) {
        return Ok(ImmoOutcome::LockedByWrongData);
    }
    input_immo_password(kwp, pin)?;
    info!("teaching immobilizer key {}", index + 1);
    kwp.start_routine_by_id(Routine::ImmoTeachKey1 as u8 + index, &[0x01])?;
    Ok(ImmoOutcome::Done)
}

/// Teaches up to four keys in sequence. Each key slot is confirmed with
/// its own routine identifier, starting at [Routine::ImmoTeachKey1].
pub fn teach_keys(
    kwp: &mut Kwp2000Protocol,
    desired_baudrate: Option<BaudrateIndex>,
    pin: u32,
    count: u8,
) -> DiagServerResult<ImmoOutcome> {
    let count = count.min(4);
    start_default_session(kwp, desired_baudrate)?;
    let data = kwp.start_routine(Routine::BeforeImmoKeyTeaching, &[])?;
    if locked(&data) {
        return Ok(ImmoOutcome::LockedByWrongData);
    }
    input_immo_password(kwp, pin)?;
    for slot in 0..count {
        info!("teaching immobilizer key {}", slot + 1);
        kwp.start_routine_by_id(Routine::ImmoTeachKey1 as u8 + slot, &[0x01])?;
    }
    info!("done; turn ignition off for 10 seconds to apply");
    Ok(ImmoOutcome::Done)
}

/// Teaches (or changes) the limp home password. When the ECU status is
/// already learnt, `current_password` must unlock it first.
pub fn limp_home_teach(
    kwp: &mut Kwp2000Protocol,
    desired_baudrate: Option<BaudrateIndex>,
    current_password: Option<u16>,
    new_password: u16,
) -> DiagServerResult<ImmoOutcome> {
    start_default_session(kwp, desired_baudrate)?;
    let data = kwp.start_routine(Routine::BeforeLimpHomeTeaching, &[])?;
    let status: ImmoStatus = data.get(1).copied().unwrap_or(0xFF).into();
    info!("current ECU status: {status}");

    if status == ImmoStatus::Learnt {
        let Some(current) = current_password else {
            warn!("ECU has a learnt password; the current password is required");
            return Err(crate::DiagError::ParameterInvalid);
        };
        kwp.start_routine(
            Routine::ActivateLimpHome,
            &[(current >> 8) as u8, current as u8],
        )?;
    }

    kwp.start_routine(
        Routine::LimpHomeInputNewPassword,
        &[(new_password >> 8) as u8, new_password as u8],
    )?;
    kwp.start_routine(Routine::LimpHomeConfirmNewPassword, &[0x01])?;
    Ok(ImmoOutcome::Done)
}

/// Reads the VIN through the undocumented service 0x09
pub fn read_vin(
    kwp: &mut Kwp2000Protocol,
    desired_baudrate: Option<BaudrateIndex>,
) -> DiagServerResult<String> {
    start_default_session(kwp, desired_baudrate)?;
    let resp = kwp.execute(Kwp2000Cmd::from_raw(0x09, &[0x02], true))?;
    Ok(String::from_utf8_lossy(resp.data()).into_owned())
}

/// Writes the VIN record. Requires a reprogramming session with security
/// access; no validation is applied to the string.
pub fn write_vin(
    kwp: &mut Kwp2000Protocol,
    desired_baudrate: Option<BaudrateIndex>,
    algorithm: SecurityAlgorithm,
    vin: &str,
) -> DiagServerResult<()> {
    kwp.start_diagnostic_session(SessionKind::FlashReprogramming, desired_baudrate)?;
    kwp.security_access(AccessLevel::Hyundai, algorithm)?;
    kwp.write_data_by_local_identifier(0x90, vin.as_bytes())?;
    info!("VIN changed; turn ignition off for 5 seconds to apply");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::SimulationChannel;

    fn kwp_with<F>(responder: F) -> Kwp2000Protocol
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        Kwp2000Protocol::new(Box::new(SimulationChannel::new(responder)))
    }

    #[test]
    fn query_decodes_status_table() {
        let mut kwp = kwp_with(|req| match req {
            [0x10, 0x81] => vec![vec![0x50, 0x81]],
            [0x31, 0x12] => vec![vec![0x71, 0x12, 0x02, 0x01, 0x03, 0x01]],
            _ => vec![],
        });
        let info = query_info(&mut kwp, None).unwrap();
        assert_eq!(info.keys_learnt, 2);
        assert_eq!(info.ecu_status, ImmoStatus::Learnt);
        assert_eq!(info.key_status, ImmoStatus::Neutral);
        assert_eq!(info.smartra_status, Some(ImmoStatus::Learnt));
    }

    #[test]
    fn locked_ecu_stops_the_reset_sequence() {
        let mut kwp = kwp_with(|req| match req {
            [0x10, 0x81] => vec![vec![0x50, 0x81]],
            [0x31, 0x15] => vec![vec![0x71, 0x15, 0x04]],
            _ => vec![],
        });
        let outcome = immo_reset(&mut kwp, None, 123456).unwrap();
        assert_eq!(outcome, ImmoOutcome::LockedByWrongData);
    }

    #[test]
    fn reset_sends_pin_with_filler() {
        let mut kwp = kwp_with(|req| match req {
            [0x10, 0x81] => vec![vec![0x50, 0x81]],
            [0x31, 0x15] => vec![vec![0x71, 0x15, 0x01]],
            [0x31, 0x1A, 0x01, 0xE2, 0x40, rest @ ..] if rest.iter().all(|b| *b == 0xFF) => {
                vec![vec![0x71, 0x1A]]
            }
            [0x31, 0x20, 0x01] => vec![vec![0x71, 0x20]],
            _ => vec![],
        });
        // 123456 = 0x01E240
        assert_eq!(immo_reset(&mut kwp, None, 123456).unwrap(), ImmoOutcome::Done);
    }
}
