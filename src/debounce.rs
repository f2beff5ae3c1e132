// src/debounce.rs - Per-line edge debouncing with a single scan task
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};

use crate::config::DebounceConfig;
use crate::hardware::Line;
use crate::sync::InterruptibleWait;

/// A transition that survived its debounce window.
#[derive(Debug, Clone, Copy)]
pub struct DebouncedEdge {
    pub line: Line,
    pub value: bool,
    /// Commit time, shared by every edge committed in the same scan
    /// pass so simultaneous commits cannot skew against each other.
    pub at: Instant,
    /// Raw belt phase line reading sampled at commit time.
    pub belt_phase: bool,
}

/// Downstream consumer of debounced transitions.
#[async_trait]
pub trait DebouncedEdgeHandler: Send + Sync {
    async fn debounced_edge(&self, edge: DebouncedEdge);
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    target: bool,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct LineState {
    stable: bool,
    initialized: bool,
    last_raw: bool,
    pending: Option<Pending>,
}

/// Debounce state for all lines. Kept free of clocks and tasks so the
/// timing behavior is directly testable; [`Debouncer`] wraps it with
/// the background scan loop.
#[derive(Debug)]
pub struct DebounceTable {
    lines: [LineState; Line::ALL.len()],
    windows: [Duration; Line::ALL.len()],
}

/// Upper bound on how long the scan task sleeps without a deadline.
const IDLE_SCAN_INTERVAL: Duration = Duration::from_secs(1);

impl DebounceTable {
    pub fn new(config: &DebounceConfig) -> Self {
        let mut windows = [Duration::ZERO; Line::ALL.len()];
        for line in Line::ALL {
            windows[line.index()] = config.window_for(line);
        }
        Self {
            lines: [LineState::default(); Line::ALL.len()],
            windows,
        }
    }

    /// Feeds one raw transition. Returns true when the scan task must
    /// be woken to recompute its deadline.
    pub fn record_edge(&mut self, line: Line, value: bool, now: Instant) -> bool {
        let window = self.windows[line.index()];
        let state = &mut self.lines[line.index()];
        state.last_raw = value;

        if !state.initialized {
            // First report for this line: adopt silently.
            state.stable = value;
            state.initialized = true;
            return false;
        }

        if value == state.stable {
            // Bounce back to the old value is noise, not a commit. The
            // window restarts from scratch on the next reversal.
            state.pending = None;
            return false;
        }

        // Differing value: track (or overwrite) the one pending change.
        state.pending = Some(Pending {
            target: value,
            deadline: now + window,
        });
        true
    }

    /// Commits every pending change whose deadline has elapsed, all
    /// stamped with the same `now`.
    pub fn commit_elapsed(&mut self, now: Instant) -> Vec<DebouncedEdge> {
        let belt_phase = self.lines[Line::BeltPhase.index()].last_raw;
        let mut committed = Vec::new();
        for line in Line::ALL {
            let state = &mut self.lines[line.index()];
            if let Some(pending) = state.pending {
                if pending.deadline <= now {
                    state.stable = pending.target;
                    state.pending = None;
                    committed.push(DebouncedEdge {
                        line,
                        value: pending.target,
                        at: now,
                        belt_phase,
                    });
                }
            }
        }
        committed
    }

    /// Next wakeup: the earliest outstanding deadline, capped at one
    /// idle interval from now.
    pub fn next_deadline(&self, now: Instant) -> Instant {
        let mut deadline = now + IDLE_SCAN_INTERVAL;
        for state in &self.lines {
            if let Some(pending) = state.pending {
                deadline = deadline.min(pending.deadline);
            }
        }
        deadline
    }

    /// Post-debounce value of a line, `None` before the first report.
    pub fn stable_value(&self, line: Line) -> Option<bool> {
        let state = &self.lines[line.index()];
        state.initialized.then_some(state.stable)
    }
}

/// Owns the debounce table and the background task committing pending
/// changes when their windows elapse.
pub struct Debouncer {
    table: Mutex<DebounceTable>,
    wakeup: InterruptibleWait,
}

impl Debouncer {
    pub fn new(config: &DebounceConfig) -> Self {
        Self {
            table: Mutex::new(DebounceTable::new(config)),
            wakeup: InterruptibleWait::new(),
        }
    }

    /// Entry point for the raw edge reader.
    pub fn input(&self, line: Line, value: bool, at: Instant) {
        let needs_wake = self
            .table
            .lock()
            .unwrap()
            .record_edge(line, value, at);
        if needs_wake {
            self.wakeup.interrupt();
        }
    }

    pub fn stable_value(&self, line: Line) -> Option<bool> {
        self.table.lock().unwrap().stable_value(line)
    }

    /// Spawns the scan task. Each pass commits elapsed changes under
    /// the table lock, then emits callbacks outside it, then sleeps
    /// until the next deadline or an input interrupt.
    pub fn spawn(
        self: Arc<Self>,
        handler: Arc<dyn DebouncedEdgeHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (committed, deadline) = {
                    let mut table = self.table.lock().unwrap();
                    let now = Instant::now();
                    (table.commit_elapsed(now), table.next_deadline(now))
                };
                for edge in committed {
                    tracing::trace!(
                        line = edge.line.name(),
                        value = edge.value,
                        "debounced edge committed"
                    );
                    handler.debounced_edge(edge).await;
                }
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::debug!("debounce task shutting down");
                        break;
                    }
                    _ = self.wakeup.wait_until(deadline) => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_window(ms: u64) -> DebounceTable {
        let config = DebounceConfig {
            encoder_v1_ms: ms,
            encoder_v2_ms: ms,
            left_hall_ms: ms,
            right_hall_ms: ms,
            belt_phase_ms: 0,
        };
        DebounceTable::new(&config)
    }

    fn init_line(table: &mut DebounceTable, line: Line, value: bool, now: Instant) {
        assert!(!table.record_edge(line, value, now));
        assert_eq!(table.stable_value(line), Some(value));
    }

    #[tokio::test(start_paused = true)]
    async fn first_report_adopts_value_without_commit() {
        let mut table = table_with_window(10);
        let now = Instant::now();
        assert!(!table.record_edge(Line::LeftHall, true, now));
        assert!(table.commit_elapsed(now + Duration::from_secs(1)).is_empty());
        assert_eq!(table.stable_value(Line::LeftHall), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn bounce_within_window_commits_once_at_window_end() {
        let mut table = table_with_window(10);
        let t0 = Instant::now();
        init_line(&mut table, Line::LeftHall, false, t0);

        // Real transition followed by sub-window bounce noise ending on
        // the new value.
        table.record_edge(Line::LeftHall, true, t0);
        table.record_edge(Line::LeftHall, false, t0 + Duration::from_millis(2));
        table.record_edge(Line::LeftHall, true, t0 + Duration::from_millis(3));

        // Nothing commits before the (restarted) window elapses.
        assert!(table
            .commit_elapsed(t0 + Duration::from_millis(12))
            .is_empty());
        let committed = table.commit_elapsed(t0 + Duration::from_millis(13));
        assert_eq!(committed.len(), 1);
        assert!(committed[0].value);
        assert_eq!(committed[0].at, t0 + Duration::from_millis(13));
        assert_eq!(table.stable_value(Line::LeftHall), Some(true));

        // No second commit afterwards.
        assert!(table
            .commit_elapsed(t0 + Duration::from_secs(1))
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bounce_back_to_old_value_cancels_entirely() {
        let mut table = table_with_window(10);
        let t0 = Instant::now();
        init_line(&mut table, Line::RightHall, false, t0);

        table.record_edge(Line::RightHall, true, t0);
        table.record_edge(Line::RightHall, false, t0 + Duration::from_millis(4));

        assert!(table.commit_elapsed(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(table.stable_value(Line::RightHall), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_window_line_commits_on_next_scan() {
        let mut table = table_with_window(0);
        let t0 = Instant::now();
        init_line(&mut table, Line::EncoderV1, false, t0);

        assert!(table.record_edge(Line::EncoderV1, true, t0));
        let committed = table.commit_elapsed(t0);
        assert_eq!(committed.len(), 1);
        assert!(committed[0].value);
    }

    #[tokio::test(start_paused = true)]
    async fn commits_in_one_pass_share_a_timestamp() {
        let mut table = table_with_window(5);
        let t0 = Instant::now();
        init_line(&mut table, Line::LeftHall, true, t0);
        init_line(&mut table, Line::RightHall, true, t0);

        table.record_edge(Line::LeftHall, false, t0);
        table.record_edge(Line::RightHall, false, t0 + Duration::from_millis(1));

        let now = t0 + Duration::from_millis(20);
        let committed = table.commit_elapsed(now);
        assert_eq!(committed.len(), 2);
        assert!(committed.iter().all(|edge| edge.at == now));
    }

    #[tokio::test(start_paused = true)]
    async fn next_deadline_tracks_earliest_pending() {
        let mut table = table_with_window(10);
        let t0 = Instant::now();
        init_line(&mut table, Line::LeftHall, false, t0);
        init_line(&mut table, Line::RightHall, false, t0);

        // Idle: capped at one second.
        assert_eq!(table.next_deadline(t0), t0 + IDLE_SCAN_INTERVAL);

        table.record_edge(Line::RightHall, true, t0 + Duration::from_millis(3));
        table.record_edge(Line::LeftHall, true, t0);
        assert_eq!(
            table.next_deadline(t0 + Duration::from_millis(4)),
            t0 + Duration::from_millis(10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn committed_edge_carries_belt_phase_sample() {
        let mut table = table_with_window(10);
        let t0 = Instant::now();
        init_line(&mut table, Line::LeftHall, true, t0);
        table.record_edge(Line::BeltPhase, true, t0);
        table.record_edge(Line::LeftHall, false, t0);

        let committed = table.commit_elapsed(t0 + Duration::from_millis(10));
        assert_eq!(committed.len(), 1);
        assert!(committed[0].belt_phase);
    }

    struct Collector {
        edges: Mutex<Vec<DebouncedEdge>>,
        seen: InterruptibleWait,
    }

    #[async_trait]
    impl DebouncedEdgeHandler for Collector {
        async fn debounced_edge(&self, edge: DebouncedEdge) {
            self.edges.lock().unwrap().push(edge);
            self.seen.interrupt();
        }
    }

    #[tokio::test]
    async fn scan_task_commits_after_window() {
        let config = DebounceConfig {
            left_hall_ms: 5,
            ..DebounceConfig::default()
        };
        let debouncer = Arc::new(Debouncer::new(&config));
        let collector = Arc::new(Collector {
            edges: Mutex::new(Vec::new()),
            seen: InterruptibleWait::new(),
        });
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = debouncer
            .clone()
            .spawn(collector.clone(), shutdown_tx.subscribe());

        let now = Instant::now();
        debouncer.input(Line::LeftHall, true, now);
        debouncer.input(Line::LeftHall, false, now);

        // Wait for the commit callback rather than sleeping blind.
        let deadline = Instant::now() + Duration::from_secs(2);
        while collector.edges.lock().unwrap().is_empty() {
            if collector.seen.wait_until(deadline).await == crate::sync::WaitOutcome::TimedOut {
                break;
            }
        }

        let edges = collector.edges.lock().unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].line, Line::LeftHall);
        assert!(!edges[0].value);

        drop(edges);
        let _ = shutdown_tx.send(());
        let _ = task.await;
    }
}
