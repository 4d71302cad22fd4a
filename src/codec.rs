//! Pure functions mapping commands to wire bytes and physical units to
//! controller units.

use crate::consts::{COMMAND_SIZE, REPLY_SIZE};

/// Pack an opcode and its five parameters into a 12-byte command word.
pub fn command(op: u16, values: [u16; 5]) -> [u8; COMMAND_SIZE] {
    let mut buf = [0u8; COMMAND_SIZE];
    buf[0..2].copy_from_slice(&op.to_le_bytes());
    for (i, v) in values.iter().enumerate() {
        let offset = 2 + i * 2;
        buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Decode an 8-byte realtime reply into its four little-endian words.
pub fn reply_words(raw: &[u8; REPLY_SIZE]) -> [u16; 4] {
    [
        u16::from_le_bytes([raw[0], raw[1]]),
        u16::from_le_bytes([raw[2], raw[3]]),
        u16::from_le_bytes([raw[4], raw[5]]),
        u16::from_le_bytes([raw[6], raw[7]]),
    ]
}

/// Convert mm/s to the controller's galvos-per-ms unit, clamped to u16.
pub fn speed_to_galvo(mm_per_s: f64, galvos_per_mm: f64) -> u16 {
    let galvo = (mm_per_s * galvos_per_mm.abs() / 1000.0).round();
    if galvo >= 65535.0 {
        0xFFFF
    } else if galvo <= 0.0 {
        0
    } else {
        galvo as u16
    }
}

/// Q-switch period for a fiber source: 20000 / frequency in kHz.
pub fn freq_to_qperiod(khz: f64) -> u16 {
    ((20000.0 / khz).round() as i64 & 0xFFFF) as u16
}

/// Power percentage as a 12-bit ratio (100% = 0xFFF).
pub fn power_to_ratio(percent: f64) -> u16 {
    (percent * 0xFFF as f64 / 100.0).round() as u16
}

/// CO2 mark-frequency word: half the fiber period, 10000 / kHz.
pub fn co2_mark_freq(khz: f64) -> u16 {
    ((10000.0 / khz).round() as i64 & 0xFFFF) as u16
}

/// CO2 power ratio: the duty portion of the 20000/kHz period.
pub fn co2_power_ratio(percent: f64, khz: f64) -> u16 {
    (percent / 100.0 * 20000.0 / khz).round() as u16
}

/// CO2 first-pulse-killer word: fpk percent of the 20000/kHz period.
pub fn co2_fpk(fpk_percent: f64, khz: f64) -> u16 {
    (fpk_percent / 100.0 * 20000.0 / khz).round() as u16
}

/// Split a signed delay into (magnitude, sign word). Non-positive delays
/// carry the 0x8000 sign word.
pub fn delay_words(delay: f64) -> (u16, u16) {
    let magnitude = delay.abs().round();
    let magnitude = if magnitude >= 65535.0 {
        0xFFFF
    } else {
        magnitude as u16
    };
    (magnitude, if delay > 0.0 { 0x0000 } else { 0x8000 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::LIST_JUMP_TO;

    #[test]
    fn command_packs_little_endian() {
        let word = command(LIST_JUMP_TO, [0x5000, 0xA000, 0, 0x1234, 0]);
        assert_eq!(
            word,
            [0x01, 0x80, 0x00, 0x50, 0x00, 0xA0, 0x00, 0x00, 0x34, 0x12, 0x00, 0x00]
        );
    }

    #[test]
    fn reply_decodes_four_words() {
        let raw = [0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x20, 0x00];
        assert_eq!(reply_words(&raw), [1, 2, 3, 0x20]);
    }

    #[test]
    fn speed_conversion() {
        assert_eq!(speed_to_galvo(100.0, 500.0), 50);
        assert_eq!(speed_to_galvo(100.0, -500.0), 50);
        assert_eq!(speed_to_galvo(1_000_000.0, 500.0), 0xFFFF);
    }

    #[test]
    fn qswitch_period() {
        assert_eq!(freq_to_qperiod(20.0), 1000);
        assert_eq!(freq_to_qperiod(40.0), 500);
    }

    #[test]
    fn power_ratio() {
        assert_eq!(power_to_ratio(100.0), 0xFFF);
        assert_eq!(power_to_ratio(0.0), 0);
    }

    #[test]
    fn co2_conversions_match_known_boards() {
        // (kHz, power%, fpk%) vectors observed on CO2 sources.
        assert_eq!(co2_mark_freq(10.0), 0x03E8);
        assert_eq!(co2_mark_freq(20.0), 0x01F4);
        assert_eq!(co2_mark_freq(30.0), 0x014D);
        assert_eq!(co2_mark_freq(80.0), 0x007D);
        assert_eq!(co2_power_ratio(20.0, 10.0), 0x0190);
        assert_eq!(co2_power_ratio(30.0, 20.0), 0x012C);
        assert_eq!(co2_power_ratio(40.0, 30.0), 0x010B);
        assert_eq!(co2_power_ratio(50.0, 80.0), 0x007D);
        assert_eq!(co2_fpk(10.0, 10.0), 0x00C8);
        assert_eq!(co2_fpk(10.0, 20.0), 0x0064);
        assert_eq!(co2_fpk(10.0, 30.0), 0x0043);
        assert_eq!(co2_fpk(10.0, 80.0), 0x0019);
    }

    #[test]
    fn signed_delays() {
        assert_eq!(delay_words(5.0), (5, 0x0000));
        assert_eq!(delay_words(-5.0), (5, 0x8000));
        assert_eq!(delay_words(0.0), (0, 0x8000));
    }
}
