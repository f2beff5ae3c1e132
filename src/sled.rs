// src/sled.rs - Carriage position tracking from quadrature and reference sensors
use async_trait::async_trait;
use std::sync::Mutex;

use crate::config::MachineConfig;
use crate::debounce::{DebouncedEdge, DebouncedEdgeHandler};
use crate::hardware::Line;

/// Downstream consumer of needle-granularity carriage movement.
#[async_trait]
pub trait SledHandler: Send + Sync {
    async fn sled_moved(&self, position: i32, belt_phase: bool);
}

/// Quadrature pulses per needle position.
const PULSES_PER_NEEDLE: i32 = 4;

/// Sentinel meaning "no position reported yet".
const UNREPORTED: i32 = i32::MIN;

#[derive(Debug)]
struct CarriageState {
    raw_pulse_count: i32,
    last_quadrature_code: u8,
    position_valid: bool,
    belt_phase: bool,
    skipped_needle_count: u32,
    last_reported_position: i32,
    v1: bool,
    v2: bool,
}

impl Default for CarriageState {
    fn default() -> Self {
        Self {
            raw_pulse_count: 0,
            // Out-of-range previous code: the first decoded transition
            // is judged against it like any other.
            last_quadrature_code: 0xff,
            position_valid: false,
            belt_phase: false,
            skipped_needle_count: 0,
            last_reported_position: UNREPORTED,
            v1: false,
            v2: false,
        }
    }
}

/// Reconstructs the absolute carriage position from debounced encoder
/// and reference-sensor edges, and reports needle-granularity movement
/// downstream.
pub struct SledTracker {
    state: Mutex<CarriageState>,
    left_stop_pulses: i32,
    right_stop_pulses: i32,
    handler: std::sync::Arc<dyn SledHandler>,
}

impl SledTracker {
    pub fn new(machine: &MachineConfig, handler: std::sync::Arc<dyn SledHandler>) -> Self {
        Self {
            state: Mutex::new(CarriageState::default()),
            left_stop_pulses: machine.left_stop_pulses,
            right_stop_pulses: machine.right_stop_pulses,
            handler,
        }
    }

    pub fn skipped_needles(&self) -> u32 {
        self.state.lock().unwrap().skipped_needle_count
    }

    pub fn position_valid(&self) -> bool {
        self.state.lock().unwrap().position_valid
    }

    /// Applies one debounced edge; returns a report when the
    /// needle-granularity position changed and the tracker is valid.
    fn apply_edge(&self, edge: DebouncedEdge) -> Option<(i32, bool)> {
        let mut state = self.state.lock().unwrap();
        match edge.line {
            Line::LeftHall => {
                if !edge.value {
                    self.recalibrate(&mut state, self.left_stop_pulses, edge.belt_phase, "left");
                }
            }
            Line::RightHall => {
                if !edge.value {
                    self.recalibrate(&mut state, self.right_stop_pulses, !edge.belt_phase, "right");
                }
            }
            Line::EncoderV1 => {
                state.v1 = edge.value;
                quadrature_step(&mut state);
            }
            Line::EncoderV2 => {
                state.v2 = edge.value;
                quadrature_step(&mut state);
            }
            Line::BeltPhase => {}
        }

        let position = state.raw_pulse_count / PULSES_PER_NEEDLE;
        if state.position_valid && position != state.last_reported_position {
            state.last_reported_position = position;
            Some((position, state.belt_phase))
        } else {
            None
        }
    }

    fn recalibrate(&self, state: &mut CarriageState, pulses: i32, belt_phase: bool, side: &str) {
        let deviation = state.raw_pulse_count - pulses;
        tracing::debug!(
            side,
            previous = state.raw_pulse_count,
            deviation,
            deviation_needles = (deviation + 2) / PULSES_PER_NEEDLE,
            belt_phase,
            "reference sensor triggered, recalibrating"
        );
        state.raw_pulse_count = pulses;
        state.belt_phase = belt_phase;
        state.skipped_needle_count = 0;
        state.position_valid = true;
    }
}

/// Decodes the latest 2-bit quadrature code against the previous one.
/// The encoder's sequence is non-standard: codes 2 and 3 are swapped
/// before comparison. A transition that is not a single step in either
/// direction is counted as a skipped needle and the position is left
/// alone.
fn quadrature_step(state: &mut CarriageState) {
    let mut code = (state.v2 as u8) << 1 | state.v1 as u8;
    if code == 3 {
        code = 2;
    } else if code == 2 {
        code = 3;
    }

    if code == (state.last_quadrature_code.wrapping_add(1)) % 4 {
        state.raw_pulse_count -= 1;
    } else if code == (state.last_quadrature_code.wrapping_add(3)) % 4 {
        state.raw_pulse_count += 1;
    } else {
        state.skipped_needle_count += 1;
    }
    state.last_quadrature_code = code;
}

#[async_trait]
impl DebouncedEdgeHandler for SledTracker {
    async fn debounced_edge(&self, edge: DebouncedEdge) {
        if let Some((position, belt_phase)) = self.apply_edge(edge) {
            self.handler.sled_moved(position, belt_phase).await;
        }
    }
}
