//! Calibrated progress tracking for one in-flight workflow submission.
//!
//! A [`ProgressTracker`] consumes the lifecycle events of a single
//! submission (execution start, cached nodes, executing/executed nodes,
//! sampler step counters, completion, error) and pushes a
//! [`ProgressUpdate`] to its [`ProgressSink`] after every relevant event.
//!
//! Guarantees per submission (until the next `ExecutionStarted` reset):
//!
//! - emitted percentages never decrease (the progress floor ratchet);
//! - non-terminal percentages stay within `0..=99`, only completion is 100;
//! - each normalized node id contributes its weight at most once.
//!
//! The tracker is a synchronous state machine. It must be driven by one
//! task at a time; it holds no locks.

use std::collections::HashSet;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::Timestamp;
use crate::workflow_graph::{normalize_node_id, WeightedGraph, DEFAULT_NODE_WEIGHT};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Highest percentage a non-terminal update may carry.
pub const MAX_RUNNING_PERCENT: u8 = 99;

/// Percentage carried by the completion update.
pub const COMPLETE_PERCENT: u8 = 100;

/// Stage label emitted on execution start.
pub const STAGE_STARTING: &str = "Starting...";

/// Stage label emitted for cached-node batches (no single node to name).
pub const STAGE_PROCESSING: &str = "Processing...";

/// Stage label emitted on completion.
pub const STAGE_COMPLETE: &str = "Complete";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Lifecycle event kinds understood by the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEventKind {
    /// The backend began executing the submission. Resets all state.
    ExecutionStarted,

    /// These nodes were skipped because cached outputs were reused.
    NodesCached(Vec<String>),

    /// This node is now executing. Later step counters belong to it.
    NodeExecuting(String),

    /// This node finished executing.
    NodeExecuted(String),

    /// Step counter of the node currently sampling.
    ///
    /// `node_id` is set when the backend names the node; otherwise the
    /// most recent `NodeExecuting` node is assumed.
    StepProgress {
        current: u32,
        max: u32,
        node_id: Option<String>,
    },

    /// The backend reported the whole submission finished.
    ExecutionCompleted,

    /// The backend reported a terminal failure. Never reaches the sink.
    ExecutionError { message: String },
}

/// An event addressed to a submission.
///
/// `submission_id` is `None` for events the backend does not address
/// (older ComfyUI builds send step progress without a prompt id); such
/// events are accepted by whichever tracker receives them.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionEvent {
    pub submission_id: Option<String>,
    pub kind: ExecutionEventKind,
}

impl ExecutionEvent {
    pub fn new(submission_id: impl Into<String>, kind: ExecutionEventKind) -> Self {
        Self {
            submission_id: Some(submission_id.into()),
            kind,
        }
    }

    pub fn unaddressed(kind: ExecutionEventKind) -> Self {
        Self {
            submission_id: None,
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// One progress emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    /// Completion percentage, `0..=100`.
    pub progress_percent: u8,
    /// Human-readable description of the current stage.
    pub stage: String,
    /// Whole seconds since execution started.
    pub elapsed_secs: i64,
    /// Linear extrapolation of the total run time; 0 at the boundaries.
    pub estimated_total_secs: i64,
    /// `estimated_total_secs - elapsed_secs`, never negative.
    pub estimated_remaining_secs: i64,
}

/// Receiver of progress updates, invoked synchronously as each update is
/// computed.
pub trait ProgressSink {
    fn on_progress(&self, update: &ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressUpdate),
{
    fn on_progress(&self, update: &ProgressUpdate) {
        self(update)
    }
}

/// Sink that forwards updates over an unbounded channel, for handing them
/// to an async consumer (e.g. a task that persists them).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.tx.send(update.clone());
    }
}

/// What the tracker did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDisposition {
    /// Addressed to another submission, or arrived after completion.
    Ignored,
    /// A non-terminal update was emitted.
    Progress(ProgressUpdate),
    /// The completion update was emitted; the tracker is finished.
    Completed(ProgressUpdate),
    /// The backend reported a failure; nothing was emitted.
    Failed(String),
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Progress state for one submission.
pub struct ProgressTracker<S> {
    submission_id: String,
    graph: WeightedGraph,
    sink: S,
    completed_nodes: HashSet<String>,
    completed_weight: u64,
    progress_floor: u8,
    start_time: Option<Timestamp>,
    current_node: Option<String>,
    finished: bool,
}

impl<S: ProgressSink> ProgressTracker<S> {
    /// Bind a tracker to a submission. Timing starts at `ExecutionStarted`.
    pub fn new(submission_id: impl Into<String>, graph: WeightedGraph, sink: S) -> Self {
        Self {
            submission_id: submission_id.into(),
            graph,
            sink,
            completed_nodes: HashSet::new(),
            completed_weight: 0,
            progress_floor: 0,
            start_time: None,
            current_node: None,
            finished: false,
        }
    }

    pub fn submission_id(&self) -> &str {
        &self.submission_id
    }

    /// Sum of the weights of nodes accounted as completed.
    pub fn completed_weight(&self) -> u64 {
        self.completed_weight
    }

    /// Highest percentage emitted since the last reset.
    pub fn progress_floor(&self) -> u8 {
        self.progress_floor
    }

    /// Normalized id of the node most recently reported as executing.
    pub fn current_node(&self) -> Option<&str> {
        self.current_node.as_deref()
    }

    /// `true` once the submission has been seen running, even if no node
    /// has reported yet.
    pub fn is_started(&self) -> bool {
        self.start_time.is_some() || self.current_node.is_some() || self.progress_floor > 0
    }

    /// `true` once the completion update has been emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Handle an event using the wall clock.
    pub fn handle(&mut self, event: ExecutionEvent) -> EventDisposition {
        self.handle_at(event, Utc::now())
    }

    /// Handle an event as if it arrived at `now`.
    pub fn handle_at(&mut self, event: ExecutionEvent, now: Timestamp) -> EventDisposition {
        if let Some(id) = event.submission_id.as_deref() {
            if id != self.submission_id {
                return EventDisposition::Ignored;
            }
        }
        if self.finished && event.kind != ExecutionEventKind::ExecutionStarted {
            return EventDisposition::Ignored;
        }

        match event.kind {
            ExecutionEventKind::ExecutionStarted => {
                self.reset(now);
                self.emit_running(0.0, STAGE_STARTING.to_string(), now)
            }
            ExecutionEventKind::NodesCached(node_ids) => {
                for node_id in &node_ids {
                    self.mark_completed(node_id);
                }
                let candidate = self.candidate_percent(0.0);
                self.emit_running(candidate, STAGE_PROCESSING.to_string(), now)
            }
            ExecutionEventKind::NodeExecuting(node_id) => {
                let stage = self.graph.stage_label_of(&node_id);
                self.current_node = Some(normalize_node_id(&node_id).to_string());
                let candidate = self.candidate_percent(0.0);
                self.emit_running(candidate, stage, now)
            }
            ExecutionEventKind::NodeExecuted(node_id) => {
                self.mark_completed(&node_id);
                let stage = self.graph.stage_label_of(&node_id);
                let candidate = self.candidate_percent(0.0);
                self.emit_running(candidate, stage, now)
            }
            ExecutionEventKind::StepProgress {
                current,
                max,
                node_id,
            } => {
                let contribution = self.step_contribution(current, max, node_id.as_deref());
                let candidate = self.candidate_percent(contribution);
                self.emit_running(candidate, format!("Generating (step {current}/{max})"), now)
            }
            ExecutionEventKind::ExecutionCompleted => {
                self.finished = true;
                self.progress_floor = COMPLETE_PERCENT;
                let update = self.build_update(COMPLETE_PERCENT, STAGE_COMPLETE.to_string(), now);
                self.sink.on_progress(&update);
                EventDisposition::Completed(update)
            }
            ExecutionEventKind::ExecutionError { message } => EventDisposition::Failed(message),
        }
    }

    // ---- private helpers ----

    fn reset(&mut self, now: Timestamp) {
        self.completed_nodes.clear();
        self.completed_weight = 0;
        self.progress_floor = 0;
        self.start_time = Some(now);
        self.current_node = None;
        self.finished = false;
    }

    /// Account a node's weight unless it was already accounted.
    fn mark_completed(&mut self, node_id: &str) {
        let normalized = normalize_node_id(node_id);
        if self.completed_nodes.insert(normalized.to_string()) {
            self.completed_weight += u64::from(self.graph.weight_of(normalized));
        }
    }

    /// Weight contributed by the partially sampled node.
    ///
    /// A node that is already accounted as completed contributes nothing.
    fn step_contribution(&self, current: u32, max: u32, node_id: Option<&str>) -> f64 {
        if max == 0 {
            return 0.0;
        }
        let sampling = node_id.map(normalize_node_id).or(self.current_node.as_deref());
        let weight = match sampling {
            Some(id) if self.completed_nodes.contains(id) => return 0.0,
            Some(id) => self.graph.weight_of(id),
            None => DEFAULT_NODE_WEIGHT,
        };
        let fraction = (f64::from(current) / f64::from(max)).clamp(0.0, 1.0);
        f64::from(weight) * fraction
    }

    /// Raw percentage (before floor and clamp) for the current state plus
    /// an in-progress contribution.
    fn candidate_percent(&self, in_progress_weight: f64) -> f64 {
        let total = self.graph.total_weight();
        if total > 0 {
            (self.completed_weight as f64 + in_progress_weight) / total as f64 * 100.0
        } else {
            let node_count = self.graph.node_count();
            if node_count == 0 {
                0.0
            } else {
                self.completed_nodes.len() as f64 / node_count as f64 * 100.0
            }
        }
    }

    fn emit_running(&mut self, candidate: f64, stage: String, now: Timestamp) -> EventDisposition {
        let clamped = candidate.round().clamp(0.0, f64::from(MAX_RUNNING_PERCENT)) as u8;
        let percent = clamped.max(self.progress_floor);
        self.progress_floor = percent;
        let update = self.build_update(percent, stage, now);
        self.sink.on_progress(&update);
        EventDisposition::Progress(update)
    }

    fn build_update(&self, percent: u8, stage: String, now: Timestamp) -> ProgressUpdate {
        let elapsed_secs = self
            .start_time
            .map(|start| (now - start).num_seconds().max(0))
            .unwrap_or(0);
        let (estimated_total_secs, estimated_remaining_secs) = estimate_times(elapsed_secs, percent);
        ProgressUpdate {
            progress_percent: percent,
            stage,
            elapsed_secs,
            estimated_total_secs,
            estimated_remaining_secs,
        }
    }
}

/// Linear extrapolation of total and remaining time from elapsed time and
/// the emitted percentage.
///
/// Both estimates are 0 at 0% and 100%.
pub fn estimate_times(elapsed_secs: i64, percent: u8) -> (i64, i64) {
    if percent == 0 || percent >= COMPLETE_PERCENT {
        return (0, 0);
    }
    let total = (elapsed_secs as f64 / f64::from(percent) * 100.0).round() as i64;
    (total, (total - elapsed_secs).max(0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use assert_matches::assert_matches;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;
    use crate::workflow_graph::{ExecutionGraph, NodeCostTable};

    const PROMPT: &str = "prompt-1";

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn graph() -> WeightedGraph {
        let workflow = json!({
            "1": {"class_type": "CheckpointLoaderSimple", "inputs": {}},
            "2": {"class_type": "KSampler", "inputs": {}},
            "3": {"class_type": "VAEDecode", "inputs": {}},
        });
        WeightedGraph::new(
            ExecutionGraph::from_workflow(&workflow).unwrap(),
            NodeCostTable::default(),
        )
    }

    type Recorded = Rc<RefCell<Vec<ProgressUpdate>>>;

    fn tracker() -> (ProgressTracker<impl ProgressSink>, Recorded) {
        let log: Recorded = Rc::new(RefCell::new(Vec::new()));
        let sink_log = Rc::clone(&log);
        let sink = move |u: &ProgressUpdate| sink_log.borrow_mut().push(u.clone());
        (ProgressTracker::new(PROMPT, graph(), sink), log)
    }

    fn ev(kind: ExecutionEventKind) -> ExecutionEvent {
        ExecutionEvent::new(PROMPT, kind)
    }

    #[test]
    fn start_emits_zero_with_starting_label() {
        let (mut tracker, log) = tracker();
        let d = tracker.handle_at(ev(ExecutionEventKind::ExecutionStarted), t0());
        assert_matches!(d, EventDisposition::Progress(ref u) if u.progress_percent == 0);
        assert_eq!(log.borrow()[0].stage, STAGE_STARTING);
        assert_eq!(log.borrow()[0].estimated_total_secs, 0);
    }

    #[test]
    fn start_alone_counts_as_started() {
        let (mut tracker, _log) = tracker();
        assert!(!tracker.is_started());
        tracker.handle_at(ev(ExecutionEventKind::ExecutionStarted), t0());
        assert!(tracker.is_started());
        assert_eq!(tracker.current_node(), None);
        assert_eq!(tracker.progress_floor(), 0);
    }

    #[test]
    fn foreign_start_does_not_count() {
        let (mut tracker, _log) = tracker();
        tracker.handle_at(
            ExecutionEvent::new("someone-else", ExecutionEventKind::ExecutionStarted),
            t0(),
        );
        assert!(!tracker.is_started());
    }

    #[test]
    fn other_submissions_are_ignored() {
        let (mut tracker, log) = tracker();
        let d = tracker.handle_at(
            ExecutionEvent::new("someone-else", ExecutionEventKind::NodeExecuted("2".into())),
            t0(),
        );
        assert_eq!(d, EventDisposition::Ignored);
        assert!(log.borrow().is_empty());
        assert_eq!(tracker.completed_weight(), 0);
    }

    #[test]
    fn unaddressed_events_are_accepted() {
        let (mut tracker, _log) = tracker();
        tracker.handle_at(ev(ExecutionEventKind::ExecutionStarted), t0());
        let d = tracker.handle_at(
            ExecutionEvent::unaddressed(ExecutionEventKind::NodeExecuted("1".into())),
            t0(),
        );
        assert_matches!(d, EventDisposition::Progress(_));
        assert_eq!(tracker.completed_weight(), 15);
    }

    #[test]
    fn weight_is_counted_once_per_node() {
        let (mut tracker, _log) = tracker();
        tracker.handle_at(ev(ExecutionEventKind::NodeExecuted("2".into())), t0());
        tracker.handle_at(ev(ExecutionEventKind::NodesCached(vec!["2".into()])), t0());
        tracker.handle_at(ev(ExecutionEventKind::NodeExecuted("2:7".into())), t0());
        assert_eq!(tracker.completed_weight(), 60);
    }

    #[test]
    fn step_progress_uses_executing_node_weight() {
        let (mut tracker, _log) = tracker();
        tracker.handle_at(ev(ExecutionEventKind::ExecutionStarted), t0());
        tracker.handle_at(ev(ExecutionEventKind::NodesCached(vec!["1".into()])), t0());
        tracker.handle_at(ev(ExecutionEventKind::NodeExecuting("2".into())), t0());
        let d = tracker.handle_at(
            ExecutionEvent::unaddressed(ExecutionEventKind::StepProgress {
                current: 10,
                max: 20,
                node_id: None,
            }),
            t0(),
        );
        // (15 + 60 * 0.5) / 83 * 100 = 54.2
        assert_matches!(d, EventDisposition::Progress(ref u) if u.progress_percent == 54);
        assert_matches!(d, EventDisposition::Progress(ref u) if u.stage == "Generating (step 10/20)");
    }

    #[test]
    fn step_progress_with_zero_max_adds_nothing() {
        let (mut tracker, _log) = tracker();
        tracker.handle_at(ev(ExecutionEventKind::NodeExecuting("2".into())), t0());
        let d = tracker.handle_at(
            ev(ExecutionEventKind::StepProgress {
                current: 3,
                max: 0,
                node_id: None,
            }),
            t0(),
        );
        assert_matches!(d, EventDisposition::Progress(ref u) if u.progress_percent == 0);
    }

    #[test]
    fn step_progress_for_completed_node_adds_nothing() {
        let (mut tracker, _log) = tracker();
        tracker.handle_at(ev(ExecutionEventKind::NodeExecuted("2".into())), t0());
        let d = tracker.handle_at(
            ev(ExecutionEventKind::StepProgress {
                current: 19,
                max: 20,
                node_id: Some("2".into()),
            }),
            t0(),
        );
        // 60 / 83 = 72.3
        assert_matches!(d, EventDisposition::Progress(ref u) if u.progress_percent == 72);
    }

    #[test]
    fn floor_absorbs_regressing_steps() {
        let (mut tracker, log) = tracker();
        tracker.handle_at(ev(ExecutionEventKind::NodeExecuting("2".into())), t0());
        for (current, max) in [(10, 20), (4, 20), (12, 20), (1, 20)] {
            tracker.handle_at(
                ev(ExecutionEventKind::StepProgress {
                    current,
                    max,
                    node_id: None,
                }),
                t0(),
            );
        }
        let percents: Vec<u8> = log.borrow().iter().map(|u| u.progress_percent).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
        assert_eq!(tracker.progress_floor(), *percents.last().unwrap());
    }

    #[test]
    fn all_nodes_done_is_clamped_to_99() {
        let (mut tracker, _log) = tracker();
        let d = tracker.handle_at(
            ev(ExecutionEventKind::NodesCached(vec!["1".into(), "2".into(), "3".into()])),
            t0(),
        );
        assert_matches!(d, EventDisposition::Progress(ref u) if u.progress_percent == 99);
    }

    #[test]
    fn completion_emits_100_and_finishes() {
        let (mut tracker, log) = tracker();
        tracker.handle_at(ev(ExecutionEventKind::ExecutionStarted), t0());
        let d = tracker.handle_at(
            ev(ExecutionEventKind::ExecutionCompleted),
            t0() + Duration::seconds(42),
        );
        assert_matches!(d, EventDisposition::Completed(ref u) if u.progress_percent == 100);
        let last = log.borrow().last().cloned().unwrap();
        assert_eq!(last.stage, STAGE_COMPLETE);
        assert_eq!(last.elapsed_secs, 42);
        assert_eq!(last.estimated_total_secs, 0);
        assert_eq!(last.estimated_remaining_secs, 0);

        assert!(tracker.is_finished());
        let after = tracker.handle_at(ev(ExecutionEventKind::NodeExecuted("3".into())), t0());
        assert_eq!(after, EventDisposition::Ignored);
    }

    #[test]
    fn error_is_not_emitted_to_sink() {
        let (mut tracker, log) = tracker();
        let d = tracker.handle_at(
            ev(ExecutionEventKind::ExecutionError {
                message: "CUDA out of memory".into(),
            }),
            t0(),
        );
        assert_eq!(d, EventDisposition::Failed("CUDA out of memory".into()));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn restart_resets_weight_and_floor() {
        let (mut tracker, _log) = tracker();
        tracker.handle_at(ev(ExecutionEventKind::NodeExecuted("2".into())), t0());
        assert!(tracker.progress_floor() > 0);
        let d = tracker.handle_at(ev(ExecutionEventKind::ExecutionStarted), t0());
        assert_matches!(d, EventDisposition::Progress(ref u) if u.progress_percent == 0);
        assert_eq!(tracker.completed_weight(), 0);
        assert_eq!(tracker.progress_floor(), 0);
        assert_eq!(tracker.current_node(), None);
    }

    #[test]
    fn eta_extrapolates_linearly() {
        let (mut tracker, _log) = tracker();
        tracker.handle_at(ev(ExecutionEventKind::ExecutionStarted), t0());
        // CheckpointLoaderSimple: 15 / 83 = 18.07 -> 18%
        let d = tracker.handle_at(
            ev(ExecutionEventKind::NodeExecuted("1".into())),
            t0() + Duration::seconds(9),
        );
        let update = match d {
            EventDisposition::Progress(u) => u,
            other => panic!("Expected Progress, got {other:?}"),
        };
        assert_eq!(update.progress_percent, 18);
        assert_eq!(update.elapsed_secs, 9);
        assert_eq!(update.estimated_total_secs, 50);
        assert_eq!(update.estimated_remaining_secs, 41);
    }

    #[test]
    fn estimate_times_boundaries() {
        assert_eq!(estimate_times(30, 0), (0, 0));
        assert_eq!(estimate_times(30, 100), (0, 0));
        assert_eq!(estimate_times(30, 50), (60, 30));
        assert_eq!(estimate_times(0, 10), (0, 0));
    }

    #[test]
    fn elapsed_is_zero_before_start() {
        let (mut tracker, _log) = tracker();
        let d = tracker.handle_at(ev(ExecutionEventKind::NodeExecuted("1".into())), t0());
        assert_matches!(d, EventDisposition::Progress(ref u) if u.elapsed_secs == 0);
    }

    #[test]
    fn empty_graph_emits_zero() {
        let sink = |_: &ProgressUpdate| {};
        let empty = WeightedGraph::new(ExecutionGraph::default(), NodeCostTable::default());
        let mut tracker = ProgressTracker::new(PROMPT, empty, sink);
        let d = tracker.handle_at(ev(ExecutionEventKind::NodeExecuted("1".into())), t0());
        assert_matches!(d, EventDisposition::Progress(ref u) if u.progress_percent == 0);
    }

    #[tokio::test]
    async fn channel_sink_forwards_updates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = ProgressTracker::new(PROMPT, graph(), ChannelSink::new(tx));
        tracker.handle_at(ev(ExecutionEventKind::ExecutionStarted), t0());
        tracker.handle_at(ev(ExecutionEventKind::ExecutionCompleted), t0());

        assert_eq!(rx.recv().await.unwrap().progress_percent, 0);
        assert_eq!(rx.recv().await.unwrap().progress_percent, 100);
    }
}
