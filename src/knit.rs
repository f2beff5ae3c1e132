// src/knit.rs - Knitting state machine driving the solenoid engine
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Duration;

use crate::config::MachineConfig;
use crate::hardware::SolenoidSink;
use crate::needles::{actuate_solenoid, needle_name, needle_window};
use crate::pattern::{Pattern, PatternError};
use crate::sled::SledHandler;
use crate::sync::{InterruptibleWait, WaitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatMode {
    OneShot,
    Repeat,
    Manual,
}

impl RepeatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RepeatMode::OneShot => "oneshot",
            RepeatMode::Repeat => "repeat",
            RepeatMode::Manual => "manual",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "oneshot" => Some(RepeatMode::OneShot),
            "repeat" => Some(RepeatMode::Repeat),
            "manual" => Some(RepeatMode::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum KnitError {
    #[error("no pattern is set")]
    NoPattern,
    #[error("carriage position is not valid, move the carriage over a reference sensor first")]
    NoValidPosition,
    #[error(
        "cannot determine movement direction: carriage at {position} is inside the pattern span {left}..={right}"
    )]
    AmbiguousDirection {
        position: i32,
        left: i32,
        right: i32,
    },
    #[error("row {0} is out of bounds for the pattern")]
    RowOutOfBounds(i32),
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

/// All mutable server state. A single logical owner: every execution
/// context reaches it through the one mutex in [`KnitEngine`], held
/// for the whole of any read-modify-write sequence.
#[derive(Debug)]
pub struct KnittingState {
    pub knitting_mode: bool,
    pub repeat_mode: RepeatMode,
    pub even_rows_left_to_right: bool,
    pub carriage_position_valid: bool,
    pub belt_phase: bool,
    pub carriage_position: i32,
    pub pattern_row: i32,
    pub pattern_offset: i32,
    pub pattern: Option<Pattern>,
}

impl Default for KnittingState {
    fn default() -> Self {
        Self {
            knitting_mode: false,
            repeat_mode: RepeatMode::OneShot,
            even_rows_left_to_right: false,
            carriage_position_valid: false,
            belt_phase: false,
            carriage_position: 0,
            pattern_row: 0,
            pattern_offset: 0,
            pattern: None,
        }
    }
}

/// Snapshot of the observable state for `status` responses.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub knitting_mode: bool,
    pub repeat_mode: RepeatMode,
    pub carriage_position_valid: bool,
    pub even_rows_left_to_right: bool,
    pub carriage_position: i32,
    pub pattern_row: i32,
    pub pattern_offset: i32,
    pub pattern_min_x: i32,
    pub pattern_min_y: i32,
    pub pattern_max_x: i32,
    pub pattern_max_y: i32,
    pub pattern_width: u32,
    pub pattern_height: u32,
}

pub struct KnitEngine {
    state: Mutex<KnittingState>,
    notifier: InterruptibleWait,
    machine: MachineConfig,
    sink: Arc<dyn SolenoidSink>,
}

impl KnitEngine {
    pub fn new(machine: MachineConfig, sink: Arc<dyn SolenoidSink>) -> Self {
        Self {
            state: Mutex::new(KnittingState::default()),
            notifier: InterruptibleWait::new(),
            machine,
            sink,
        }
    }

    /// Blocks until any state change notification or the timeout,
    /// whichever comes first. Wakeups may be spurious; callers get the
    /// current state afterwards either way.
    pub async fn wait_for_change(&self, timeout: Duration) -> WaitOutcome {
        self.notifier.wait_for(timeout).await
    }

    pub async fn status(&self) -> StatusSnapshot {
        let state = self.state.lock().await;
        StatusSnapshot {
            knitting_mode: state.knitting_mode,
            repeat_mode: state.repeat_mode,
            carriage_position_valid: state.carriage_position_valid,
            even_rows_left_to_right: state.even_rows_left_to_right,
            carriage_position: state.carriage_position,
            pattern_row: state.pattern_row,
            pattern_offset: state.pattern_offset,
            pattern_min_x: state.pattern.as_ref().map_or(0, |p| p.min_x()),
            pattern_min_y: state.pattern.as_ref().map_or(0, |p| p.min_y()),
            pattern_max_x: state.pattern.as_ref().map_or(-1, |p| p.max_x()),
            pattern_max_y: state.pattern.as_ref().map_or(-1, |p| p.max_y()),
            pattern_width: state.pattern.as_ref().map_or(0, |p| p.width()),
            pattern_height: state.pattern.as_ref().map_or(0, |p| p.height()),
        }
    }

    /// Clone of the active pattern for encoding outside the lock.
    pub async fn pattern_snapshot(&self) -> Option<Pattern> {
        self.state.lock().await.pattern.clone()
    }

    /// Carriage update entry point: store position and phase, evaluate
    /// row advance (never on the first valid update), recompute the
    /// actuation frame and wake status waiters.
    pub async fn on_carriage_update(&self, position: i32, belt_phase: bool) {
        let mut state = self.state.lock().await;
        state.carriage_position = position;
        state.belt_phase = belt_phase;
        if state.carriage_position_valid {
            self.check_for_next_row(&mut state);
        }
        state.carriage_position_valid = true;
        self.refresh_outputs(&mut state).await;
        self.notifier.interrupt();
    }

    /// Replaces (or merges into) the active pattern: knitting stops,
    /// the row resets and the pattern is centered over the bed. On a
    /// failed merge nothing changes.
    pub async fn set_pattern(&self, new_pattern: Pattern, merge: bool) -> Result<(), KnitError> {
        let mut state = self.state.lock().await;
        let pattern = match (&state.pattern, merge) {
            (Some(existing), true) => existing.merge(&new_pattern)?,
            _ => new_pattern,
        };
        state.pattern = Some(pattern);
        set_knitting_mode(&mut state, false);
        state.pattern_row = 0;
        center_pattern(&mut state, &self.machine);
        self.refresh_outputs(&mut state).await;
        self.notifier.interrupt();
        Ok(())
    }

    pub async fn clear_pattern(&self) {
        let mut state = self.state.lock().await;
        state.pattern = None;
        state.pattern_offset = 0;
        self.refresh_outputs(&mut state).await;
        self.notifier.interrupt();
    }

    pub async fn trim_pattern(&self) -> Result<(), KnitError> {
        let mut state = self.state.lock().await;
        let pattern = state.pattern.as_ref().ok_or(KnitError::NoPattern)?;
        tracing::debug!(
            width = pattern.width(),
            height = pattern.height(),
            "trimming pattern"
        );
        let trimmed = pattern.trim()?;
        if state.pattern_row >= trimmed.height() as i32 {
            state.pattern_row = trimmed.height() as i32 - 1;
        }
        state.pattern = Some(trimmed);
        self.refresh_outputs(&mut state).await;
        self.notifier.interrupt();
        Ok(())
    }

    pub async fn center_pattern(&self) -> Result<(), KnitError> {
        let mut state = self.state.lock().await;
        if state.pattern.is_none() {
            return Err(KnitError::NoPattern);
        }
        center_pattern(&mut state, &self.machine);
        self.refresh_outputs(&mut state).await;
        self.notifier.interrupt();
        Ok(())
    }

    /// Jumps to an explicit row, re-deriving the travel direction.
    /// Fails without mutating state when the row is out of bounds or
    /// the direction is ambiguous.
    pub async fn set_row(&self, row: i32) -> Result<(), KnitError> {
        let mut state = self.state.lock().await;
        let height = state
            .pattern
            .as_ref()
            .map(|p| p.height() as i32)
            .ok_or(KnitError::NoPattern)?;
        if row < 0 || row >= height {
            return Err(KnitError::RowOutOfBounds(row));
        }
        let previous_row = state.pattern_row;
        state.pattern_row = row;
        if let Err(err) = determine_movement_direction(&mut state) {
            state.pattern_row = previous_row;
            return Err(err);
        }
        self.refresh_outputs(&mut state).await;
        self.notifier.interrupt();
        Ok(())
    }

    pub async fn set_offset(&self, offset: i32) -> Result<i32, KnitError> {
        let mut state = self.state.lock().await;
        state.pattern_offset = offset;
        self.refresh_outputs(&mut state).await;
        self.notifier.interrupt();
        Ok(offset)
    }

    /// Turns knitting on or off. Turning on requires an unambiguous
    /// carriage position outside the pattern span.
    pub async fn set_knit_mode(&self, on: bool) -> Result<bool, KnitError> {
        let mut state = self.state.lock().await;
        if on {
            determine_movement_direction(&mut state)?;
            set_knitting_mode(&mut state, true);
        } else {
            set_knitting_mode(&mut state, false);
        }
        self.refresh_outputs(&mut state).await;
        self.notifier.interrupt();
        Ok(state.knitting_mode)
    }

    pub async fn set_repeat_mode(&self, mode: RepeatMode) {
        let mut state = self.state.lock().await;
        state.repeat_mode = mode;
        self.notifier.interrupt();
    }

    /// Test-harness position injection; uses the same update path as
    /// real carriage movement. Gating against real hardware happens in
    /// the command layer.
    pub async fn mock_set_position(&self, position: i32) {
        self.on_carriage_update(position, false).await;
    }

    /// Row-advance decision: while knitting, the carriage is expected
    /// to exit past the pattern edge on the side the current parity
    /// dictates, with a margin against boundary noise.
    fn check_for_next_row(&self, state: &mut KnittingState) {
        if !state.knitting_mode {
            return;
        }
        let Some(pattern) = &state.pattern else {
            return;
        };

        let margin = self.machine.row_advance_margin;
        let is_even_row = state.pattern_row % 2 == 0;
        if state.even_rows_left_to_right == is_even_row {
            let rightmost = pattern.max_x() + state.pattern_offset + margin;
            if state.carriage_position >= rightmost {
                next_row(state);
            }
        } else {
            let leftmost = pattern.min_x() + state.pattern_offset - margin;
            if state.carriage_position <= leftmost {
                next_row(state);
            }
        }
    }

    /// Recomputes the solenoid frame and output-enable from the
    /// current state and pushes both to the sink. Losing the pattern
    /// or position validity forces knitting off.
    async fn refresh_outputs(&self, state: &mut KnittingState) {
        if state.pattern.is_none() || !state.carriage_position_valid {
            set_knitting_mode(state, false);
        }
        let frame = if state.knitting_mode {
            compute_frame(&self.machine, state)
        } else {
            [0, 0]
        };
        self.sink.write_frame(frame).await;
        self.sink.set_output_enable(state.knitting_mode).await;
    }
}

#[async_trait]
impl SledHandler for KnitEngine {
    async fn sled_moved(&self, position: i32, belt_phase: bool) {
        self.on_carriage_update(position, belt_phase).await;
    }
}

fn direction_left_to_right(state: &KnittingState) -> bool {
    state.even_rows_left_to_right == (state.pattern_row % 2 == 0)
}

fn set_knitting_mode(state: &mut KnittingState, on: bool) {
    if state.knitting_mode == on {
        return;
    }
    state.knitting_mode = on;
    tracing::trace!(enabled = on, "knitting mode changed");
}

fn center_pattern(state: &mut KnittingState, machine: &MachineConfig) {
    let Some(pattern) = &state.pattern else {
        return;
    };
    let actual_width = pattern.max_x() - pattern.min_x() + 1;
    state.pattern_offset = if actual_width > 0 {
        (machine.needle_count as i32 / 2) - (actual_width / 2)
    } else {
        0
    };
}

/// Advances to the next row at the end of a carriage sweep. Manual
/// mode only reverses direction; the automatic modes wrap at the last
/// row, where one-shot turns knitting off and repeat keeps the
/// boustrophedon parity consistent for odd-height patterns.
fn next_row(state: &mut KnittingState) {
    if state.repeat_mode == RepeatMode::Manual {
        state.even_rows_left_to_right = !state.even_rows_left_to_right;
        return;
    }
    let height = state.pattern.as_ref().map_or(0, |p| p.height() as i32);
    if state.pattern_row + 1 < height {
        state.pattern_row += 1;
    } else {
        state.pattern_row = 0;
        if state.repeat_mode == RepeatMode::OneShot {
            set_knitting_mode(state, false);
        } else if height % 2 == 1 {
            state.even_rows_left_to_right = !state.even_rows_left_to_right;
        }
    }
}

/// Infers the travel direction from the carriage resting position:
/// parked at or left of the pattern the next pass runs rightwards,
/// parked at or right of it leftwards. Inside the span the direction
/// is ambiguous and the carriage must be moved out first.
fn determine_movement_direction(state: &mut KnittingState) -> Result<(), KnitError> {
    let pattern = state.pattern.as_ref().ok_or(KnitError::NoPattern)?;
    if !state.carriage_position_valid {
        return Err(KnitError::NoValidPosition);
    }
    let left = pattern.min_x() + state.pattern_offset;
    let right = pattern.max_x() + state.pattern_offset;
    if state.carriage_position <= left {
        state.even_rows_left_to_right = state.pattern_row % 2 == 0;
    } else if state.carriage_position >= right {
        state.even_rows_left_to_right = state.pattern_row % 2 != 0;
    } else {
        return Err(KnitError::AmbiguousDirection {
            position: state.carriage_position,
            left,
            right,
        });
    }
    Ok(())
}

/// Computes the 2-byte actuation frame for the current carriage
/// position. Pure over its inputs: needles inside the active window
/// whose pattern column holds a non-background color get their
/// solenoid bit set.
fn compute_frame(machine: &MachineConfig, state: &KnittingState) -> [u8; 2] {
    let mut frame = [0u8; 2];
    let Some(pattern) = &state.pattern else {
        return frame;
    };
    if state.pattern_row < 0 || state.pattern_row >= pattern.height() as i32 {
        return frame;
    }

    let window = needle_window(
        machine,
        state.carriage_position,
        direction_left_to_right(state),
    );
    let min = window.min.max(0);
    let max = window.max.min(machine.needle_count as i32 - 1);
    for needle_id in min..=max {
        let color = pattern.color_at(needle_id - state.pattern_offset, state.pattern_row);
        if color != 0 {
            tracing::trace!(
                position = state.carriage_position,
                needle = %needle_name(needle_id as u32),
                "actuating needle"
            );
            actuate_solenoid(machine, &mut frame, state.belt_phase, needle_id as u32);
        }
    }
    frame
}
