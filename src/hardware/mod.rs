// src/hardware/mod.rs - Hardware boundary traits and line identifiers
pub mod mock;

use async_trait::async_trait;
use tokio::time::{Duration, Instant};

/// The physical input lines the machine exposes.
///
/// V1/V2 are the quadrature encoder phases, the hall sensors are the
/// absolute references at either end of the bed, and the belt phase
/// line reports which interleaved needle sub-group the carriage
/// magnets currently address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Line {
    EncoderV1,
    EncoderV2,
    LeftHall,
    RightHall,
    BeltPhase,
}

impl Line {
    pub const ALL: [Line; 5] = [
        Line::EncoderV1,
        Line::EncoderV2,
        Line::LeftHall,
        Line::RightHall,
        Line::BeltPhase,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Line::EncoderV1 => 0,
            Line::EncoderV2 => 1,
            Line::LeftHall => 2,
            Line::RightHall => 3,
            Line::BeltPhase => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Line::EncoderV1 => "ENCODER_V1",
            Line::EncoderV2 => "ENCODER_V2",
            Line::LeftHall => "LEFT_HALL",
            Line::RightHall => "RIGHT_HALL",
            Line::BeltPhase => "BELT_PHASE",
        }
    }
}

/// A raw, bounce-prone transition reported by the edge source.
#[derive(Debug, Clone, Copy)]
pub struct RawEdge {
    pub line: Line,
    pub value: bool,
    pub at: Instant,
}

/// Source of raw input transitions.
///
/// Implementations block up to `timeout` so the reader loop can
/// periodically re-evaluate shutdown.
#[async_trait]
pub trait EdgeSource: Send + Sync {
    async fn wait_edge(&self, timeout: Duration) -> Option<RawEdge>;
}

/// Sink for the 2-byte solenoid actuation frame shifted out to the
/// driver, plus its output-enable signal.
#[async_trait]
pub trait SolenoidSink: Send + Sync {
    async fn write_frame(&self, frame: [u8; 2]);
    async fn set_output_enable(&self, enabled: bool);
}
