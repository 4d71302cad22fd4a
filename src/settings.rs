//! Controller configuration and the optional JSON settings file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The laser source attached to the controller. The source decides which
/// parameter words `set()` emits: fiber sources take a Q-switch period and
/// a mark current, CO2 sources take period-derived frequency, power and
/// first-pulse-killer words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaserSource {
    #[default]
    Fiber,
    Co2,
}

/// Full configuration of a [`GalvoController`](crate::GalvoController).
///
/// All fields have working defaults; a settings file only needs the keys it
/// wants to override.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Initial pen position in galvo units.
    pub x: u16,
    pub y: u16,

    /// Laser-on movement speed in mm/s.
    pub mark_speed: f64,
    /// Laser-off movement speed in mm/s.
    pub travel_speed: f64,
    /// Power in percent.
    pub power: f64,
    /// Pulse frequency in kHz.
    pub frequency: f64,
    /// Fiber (YLPM) pulse width; 4 is a typical value.
    pub pulse_width: Option<u16>,

    /// Overrides travel speed for plain `goto` moves when set.
    pub goto_speed: Option<f64>,
    /// Overrides travel speed for guide-beam `light` moves when set.
    pub light_speed: Option<f64>,
    /// Overrides travel speed for guide-beam `dark` moves when set.
    pub dark_speed: Option<f64>,

    pub light_pin: u8,
    pub foot_pin: u8,
    pub laser_pin: u8,

    /// Galvo units per millimetre of field.
    pub galvos_per_mm: f64,
    /// Optional .cor lens correction file.
    pub cor_file: Option<PathBuf>,

    pub first_pulse_killer: u16,
    pub pwm_pulse_width: u16,
    pub pwm_half_period: u16,
    pub standby_p1: u16,
    pub standby_p2: u16,
    pub timing_mode: u16,
    pub delay_mode: u16,
    pub laser_mode: u16,
    pub control_mode: u16,
    pub fpk2_max_voltage: u16,
    pub fpk2_min_voltage: u16,
    pub fpk2_t1: u16,
    pub fpk2_t2: u16,
    pub fly_resolution_1: u16,
    pub fly_resolution_2: u16,
    pub fly_resolution_3: u16,
    pub fly_resolution_4: u16,

    /// Delays in microseconds.
    pub delay_laser_on: f64,
    pub delay_laser_off: f64,
    pub delay_polygon: f64,
    pub delay_end: f64,
    /// Settle time after opening the MO gate, in ms.
    pub delay_open_mo: f64,
    pub delay_jump_short: f64,
    pub delay_jump_long: f64,

    /// Consecutive matching polls required by `wait_for_input`.
    pub input_passes_required: u32,

    pub source: LaserSource,
    /// CO2 first-pulse-killer, percent of the pulse period.
    pub fpk: f64,

    /// Use the in-memory transport instead of USB.
    pub mock: bool,
    /// Which attached board to drive when several are present.
    pub machine_index: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            x: 0x8000,
            y: 0x8000,
            mark_speed: 100.0,
            travel_speed: 2000.0,
            power: 50.0,
            frequency: 30.0,
            pulse_width: None,
            goto_speed: None,
            light_speed: None,
            dark_speed: None,
            light_pin: 8,
            foot_pin: 15,
            laser_pin: 0,
            galvos_per_mm: 500.0,
            cor_file: None,
            first_pulse_killer: 200,
            pwm_pulse_width: 125,
            pwm_half_period: 125,
            standby_p1: 2000,
            standby_p2: 20,
            timing_mode: 1,
            delay_mode: 1,
            laser_mode: 1,
            control_mode: 0,
            fpk2_max_voltage: 0xFFB,
            fpk2_min_voltage: 1,
            fpk2_t1: 409,
            fpk2_t2: 100,
            fly_resolution_1: 0,
            fly_resolution_2: 99,
            fly_resolution_3: 1000,
            fly_resolution_4: 25,
            delay_laser_on: 100.0,
            delay_laser_off: 100.0,
            delay_polygon: 100.0,
            delay_end: 300.0,
            delay_open_mo: 8.0,
            delay_jump_short: 8.0,
            delay_jump_long: 200.0,
            input_passes_required: 3,
            source: LaserSource::Fiber,
            fpk: 10.0,
            mock: false,
            machine_index: 0,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Keys present in the file override
    /// the defaults; everything else keeps its built-in value.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_merges_over_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"power": 20.0, "frequency": 10.0, "source": "co2"}"#)
                .unwrap();
        assert_eq!(settings.power, 20.0);
        assert_eq!(settings.frequency, 10.0);
        assert_eq!(settings.source, LaserSource::Co2);
        // untouched defaults
        assert_eq!(settings.travel_speed, 2000.0);
        assert_eq!(settings.light_pin, 8);
        assert_eq!(settings.fpk2_max_voltage, 0xFFB);
    }

    #[test]
    fn empty_object_is_all_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.x, 0x8000);
        assert_eq!(settings.source, LaserSource::Fiber);
        assert!(!settings.mock);
    }
}
