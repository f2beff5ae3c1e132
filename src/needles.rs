// src/needles.rs - Needle window computation and solenoid frame encoding
use crate::config::MachineConfig;

/// Inclusive range of needle IDs currently reachable by the carriage
/// magnets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedleWindow {
    pub min: i32,
    pub max: i32,
}

/// Computes the actuation window for a carriage position and travel
/// direction. The window trails the carriage: moving left-to-right it
/// lies `active_window_offset` needles behind the carriage, mirrored
/// for right-to-left travel.
pub fn needle_window(
    machine: &MachineConfig,
    carriage_position: i32,
    left_to_right: bool,
) -> NeedleWindow {
    let offset = machine.active_window_offset;
    let size = machine.active_window_size;
    if left_to_right {
        let max = carriage_position - offset;
        NeedleWindow {
            min: max - size + 1,
            max,
        }
    } else {
        let min = carriage_position + offset;
        NeedleWindow {
            min,
            max: min + size - 1,
        }
    }
}

/// Sets the actuation bit for one needle in the 2-byte shift-register
/// frame. Needles 16 apart share a solenoid; the belt phase shifts the
/// mapping by half a solenoid bank.
pub fn actuate_solenoid(machine: &MachineConfig, frame: &mut [u8; 2], belt_phase: bool, needle_id: u32) {
    let mut bit = needle_id % machine.solenoid_count;
    if belt_phase {
        bit = (bit + machine.belt_phase_offset) % machine.solenoid_count;
    }
    frame[(bit / 8) as usize] |= 1 << (bit % 8);
}

/// Operator-facing needle name. The bed is split into a yellow half
/// (IDs 0..100, counted 100 down to 1) and a green half (IDs 100..200,
/// counted 1 up to 100).
pub fn needle_name(needle_id: u32) -> String {
    if needle_id < 100 {
        format!("Yellow {}", 100 - needle_id)
    } else if needle_id < 200 {
        format!("Green {}", needle_id - 99)
    } else {
        format!("Unknown {needle_id}")
    }
}

/// Inverse of [`needle_name`]: `('y', 100)` is needle 0, `('g', 1)` is
/// needle 100. Returns `None` for an unknown half letter.
pub fn needle_id_from_name(letter: char, number: u32) -> Option<i32> {
    match letter.to_ascii_lowercase() {
        'y' => Some(100 - number as i32),
        'g' => Some(99 + number as i32),
        _ => None,
    }
}
