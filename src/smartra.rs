//! SMARTRA2 VIN to immobilizer PIN derivation
//!
//! Applies to Hyundai and KIA models with SMARTRA2; from around 2007 some
//! models moved to SMARTRA3 and a different algorithm.

/// Derives the 6 digit immobilizer PIN from the last six digits of the VIN
pub fn calculate_smartra_pin(last_6_digits_of_vin: u32) -> u32 {
    let mut output = last_6_digits_of_vin;
    for _ in 0..0x28 {
        let carry = output & 0x8000_0000 != 0;
        output <<= 1;
        if carry {
            output ^= 0x7798_2990;
        }
    }
    output % 1_000_000
}

/// Extracts the numeric last six digits from a VIN (or accepts the six
/// digits directly)
pub fn last_6_digits(vin: &str) -> Option<u32> {
    let digits: String = vin.chars().rev().take(6).collect::<Vec<_>>().into_iter().rev().collect();
    if digits.len() < 6 {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_is_pure_and_bounded() {
        for vin in [0u32, 1, 2345, 123456, 387651, 999999] {
            let pin = calculate_smartra_pin(vin);
            assert!(pin < 1_000_000);
            assert_eq!(pin, calculate_smartra_pin(vin));
        }
    }

    #[test]
    fn zero_input_stays_zero() {
        assert_eq!(calculate_smartra_pin(0), 0);
    }

    #[test]
    fn vin_suffix_extraction() {
        assert_eq!(last_6_digits("KMHDN45D22U387651"), Some(387651));
        assert_eq!(last_6_digits("387651"), Some(387651));
        assert_eq!(last_6_digits("12345"), None);
        assert_eq!(last_6_digits("KMHDN45D22UABCDEF"), None);
    }
}
