//! The shipped text-to-image template, rendered for a job and tracked
//! through a recorded ComfyUI session.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::stream;
use genq_comfyui::execution::{run_execution, ExecutionOutcome};
use genq_core::progress::{ProgressTracker, ProgressUpdate};
use genq_core::workflow_graph::{ExecutionGraph, NodeCostTable, WeightedGraph};
use genq_db::models::job::GenerationParams;
use genq_worker::config::parse_weight_overrides;
use genq_worker::workflow::WorkflowTemplate;
use serde_json::json;
use tokio_tungstenite::tungstenite::{self, Message};

const PROMPT: &str = "5e0c1a7d-91f2-4c55-8e3a-0b6d2f4a9c10";

fn shipped_template() -> WorkflowTemplate {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../workflows/text_to_image.json");
    WorkflowTemplate::load(&path).unwrap()
}

fn executing(node: Option<&str>) -> Result<Message, tungstenite::Error> {
    Ok(Message::Text(
        json!({"type": "executing", "data": {"node": node, "prompt_id": PROMPT}}).to_string(),
    ))
}

fn session() -> Vec<Result<Message, tungstenite::Error>> {
    let mut frames = vec![Ok(Message::Text(
        json!({"type": "execution_start", "data": {"prompt_id": PROMPT}}).to_string(),
    ))];
    for node in ["4", "5", "6", "7", "3"] {
        frames.push(executing(Some(node)));
    }
    for step in 1..=25 {
        frames.push(Ok(Message::Text(
            json!({"type": "progress", "data": {"value": step, "max": 25, "prompt_id": PROMPT, "node": "3"}})
                .to_string(),
        )));
    }
    frames.push(executing(Some("8")));
    frames.push(executing(Some("9")));
    frames.push(executing(None));
    frames
}

#[test]
fn rendered_template_carries_job_parameters() {
    let params = GenerationParams {
        prompt: "isometric city at night, neon".into(),
        width: Some(832),
        height: Some(1216),
        seed: Some(99),
        ..Default::default()
    };
    let rendered = shipped_template().render(&params);

    assert_eq!(rendered.workflow["6"]["inputs"]["text"], "isometric city at night, neon");
    assert_eq!(rendered.workflow["7"]["inputs"]["text"], "blurry, low quality, watermark");
    assert_eq!(rendered.workflow["5"]["inputs"]["width"], 832);
    assert_eq!(rendered.workflow["5"]["inputs"]["height"], 1216);
    assert_eq!(rendered.workflow["3"]["inputs"]["seed"], 99);
}

#[tokio::test]
async fn recorded_session_reaches_completion_through_sampler_weighting() {
    let rendered = shipped_template().render(&GenerationParams {
        prompt: "a lighthouse".into(),
        ..Default::default()
    });
    let graph = WeightedGraph::new(
        ExecutionGraph::from_workflow(&rendered.workflow).unwrap(),
        NodeCostTable::default(),
    );
    assert_eq!(graph.total_weight(), 91);

    let log: Arc<Mutex<Vec<ProgressUpdate>>> = Arc::default();
    let sink_log = Arc::clone(&log);
    let mut tracker = ProgressTracker::new(PROMPT, graph, move |u: &ProgressUpdate| {
        sink_log.lock().unwrap().push(u.clone())
    });

    let mut ws = stream::iter(session());
    let outcome = run_execution(&mut ws, &mut tracker).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed);

    let updates = log.lock().unwrap();
    let at_stage = |stage: &str| {
        updates
            .iter()
            .find(|u| u.stage == stage)
            .map(|u| u.progress_percent)
    };
    // Loaders and encoders done: 20 of 91.
    assert_eq!(at_stage("Generating image"), Some(22));
    // Plus the full sampler weight: 80 of 91.
    assert_eq!(at_stage("Generating (step 25/25)"), Some(88));
    assert_eq!(at_stage("Decoding image"), Some(88));

    let percents: Vec<u8> = updates.iter().map(|u| u.progress_percent).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    assert_eq!(percents[percents.len() - 2], 99);
    assert_eq!(percents[percents.len() - 1], 100);
}

#[tokio::test]
async fn weight_overrides_shift_the_curve() {
    let overrides = parse_weight_overrides("KSampler=20").unwrap();
    let costs = NodeCostTable::default().with_weight_overrides(overrides).unwrap();
    let rendered = shipped_template().render(&GenerationParams {
        prompt: "a lighthouse".into(),
        ..Default::default()
    });
    let graph = WeightedGraph::new(
        ExecutionGraph::from_workflow(&rendered.workflow).unwrap(),
        costs,
    );
    assert_eq!(graph.total_weight(), 51);

    let mut tracker = ProgressTracker::new(PROMPT, graph, |_: &ProgressUpdate| {});
    let mut ws = stream::iter(session());
    run_execution(&mut ws, &mut tracker).await.unwrap();

    assert!(tracker.is_finished());
    assert_eq!(tracker.completed_weight(), 51);
}
