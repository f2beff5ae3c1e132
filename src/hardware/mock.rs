// src/hardware/mock.rs - Channel-backed hardware used in --no-hardware mode
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use super::{EdgeSource, Line, RawEdge, SolenoidSink};

/// Edge source fed by an in-process channel instead of real sensors.
pub struct MockEdgeSource {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RawEdge>>,
}

/// Handle used by tests and harnesses to inject synthetic edges.
#[derive(Clone)]
pub struct EdgeInjector {
    tx: mpsc::UnboundedSender<RawEdge>,
}

impl MockEdgeSource {
    pub fn new() -> (Self, EdgeInjector) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: tokio::sync::Mutex::new(rx),
            },
            EdgeInjector { tx },
        )
    }
}

impl EdgeInjector {
    pub fn inject(&self, line: Line, value: bool) {
        let _ = self.tx.send(RawEdge {
            line,
            value,
            at: Instant::now(),
        });
    }
}

#[async_trait]
impl EdgeSource for MockEdgeSource {
    async fn wait_edge(&self, timeout: Duration) -> Option<RawEdge> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(edge) => edge,
            Err(_) => None,
        }
    }
}

/// Records every frame instead of shifting it out to hardware.
#[derive(Default)]
pub struct MockSolenoidSink {
    state: Mutex<MockSinkState>,
}

#[derive(Default, Clone)]
struct MockSinkState {
    frames: Vec<[u8; 2]>,
    output_enabled: bool,
}

impl MockSolenoidSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_frame(&self) -> Option<[u8; 2]> {
        self.state.lock().unwrap().frames.last().copied()
    }

    pub fn frames(&self) -> Vec<[u8; 2]> {
        self.state.lock().unwrap().frames.clone()
    }

    pub fn output_enabled(&self) -> bool {
        self.state.lock().unwrap().output_enabled
    }
}

#[async_trait]
impl SolenoidSink for MockSolenoidSink {
    async fn write_frame(&self, frame: [u8; 2]) {
        self.state.lock().unwrap().frames.push(frame);
    }

    async fn set_output_enable(&self, enabled: bool) {
        self.state.lock().unwrap().output_enabled = enabled;
    }
}
