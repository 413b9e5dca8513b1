//! End-to-end coverage: pipelines driven through the public API, observed
//! over the push hub, exercising real subprocess workers where possible.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use marketpipe::config::{Paths, Settings};
use marketpipe::errors::StageError;
use marketpipe::hub::events::{Event, EventKind};
use marketpipe::hub::PushHub;
use marketpipe::pipeline::state::{Mode, PipelineRequest, PipelineStatus, StageStatus};
use marketpipe::pipeline::PipelineManager;
use marketpipe::progress::MetricsStore;
use marketpipe::registry::{RetryPolicy, StageDefinition, StageRegistry};
use marketpipe::runner::worker::{StageWorker, WorkerContext};

struct StepWorker {
    items: u64,
    fail_attempts: Mutex<u32>,
    hang_after: Option<u64>,
}

impl StepWorker {
    fn ok(items: u64) -> Arc<Self> {
        Arc::new(Self {
            items,
            fail_attempts: Mutex::new(0),
            hang_after: None,
        })
    }

    fn failing_first(items: u64) -> Arc<Self> {
        Arc::new(Self {
            items,
            fail_attempts: Mutex::new(1),
            hang_after: None,
        })
    }

    fn hanging_after(progress: u64) -> Arc<Self> {
        Arc::new(Self {
            items: 10,
            fail_attempts: Mutex::new(0),
            hang_after: Some(progress),
        })
    }
}

#[async_trait]
impl StageWorker for StepWorker {
    async fn run(&self, ctx: &WorkerContext) -> Result<(), StageError> {
        {
            let mut remaining = self.fail_attempts.lock().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StageError::NonZeroExit { code: 1 });
            }
        }
        for n in 1..=self.items {
            ctx.sink
                .progress(n, Some(self.items), format!("item {n}"))
                .await;
            if self.hang_after == Some(n) {
                ctx.cancel.cancelled().await;
                return Err(StageError::Cancelled);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }
}

fn retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        max_backoff: Duration::from_millis(200),
    }
}

fn manager_for(
    registry: StageRegistry,
    dir: &std::path::Path,
) -> (Arc<PipelineManager>, Arc<PushHub>) {
    let hub = Arc::new(PushHub::new(8192));
    let manager = Arc::new(PipelineManager::new(
        Arc::new(registry),
        hub.clone(),
        Arc::new(MetricsStore::new(dir.join("metrics"))),
        Arc::new(Paths::resolve(Some(dir)).unwrap()),
        Arc::new(Settings::default()),
    ));
    (manager, hub)
}

fn request(id: &str) -> PipelineRequest {
    PipelineRequest {
        pipeline_id: id.into(),
        mode: Mode::Accumulative,
        from_date: None,
        to_date: None,
        config: serde_json::Map::new(),
        idempotency_key: None,
    }
}

/// Drain hub events until `pipeline_complete` (or time out).
async fn collect_events(rx: &mut tokio::sync::mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for pipeline_complete")
            .expect("hub closed the observer early");
        let done = matches!(event.kind, EventKind::PipelineComplete { .. });
        events.push(event);
        if done {
            return events;
        }
    }
}

fn stage_statuses(events: &[Event], stage: &str) -> Vec<StageStatus> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::StageStatus {
                stage: s, status, ..
            } if s == stage => Some(*status),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn happy_path_chain_completes_with_causally_ordered_events() {
    let dir = tempfile::tempdir().unwrap();
    let registry = StageRegistry::new();
    registry
        .register(StageDefinition::new("a", "A", StepWorker::ok(10)).with_retry(retry(1)))
        .unwrap();
    registry
        .register(
            StageDefinition::new("b", "B", StepWorker::ok(5))
                .depends_on(&["a"])
                .with_retry(retry(1)),
        )
        .unwrap();
    registry
        .register(
            StageDefinition::new("c", "C", StepWorker::ok(2))
                .depends_on(&["b"])
                .with_retry(retry(1)),
        )
        .unwrap();

    let (manager, hub) = manager_for(registry, dir.path());
    let mut sub = hub.subscribe();

    let id = manager.start(request("p-happy")).unwrap();
    let events = collect_events(&mut sub.rx).await;

    // Pipeline went running before anything else.
    match &events[0].kind {
        EventKind::PipelineStatus {
            pipeline_id,
            status,
        } => {
            assert_eq!(pipeline_id, &id);
            assert_eq!(*status, PipelineStatus::Running);
        }
        other => panic!("expected pipeline_status first, got {other:?}"),
    }

    // Per-stage causal order: running then completed, and stage b only
    // starts after stage a's terminal event.
    for stage in ["a", "b", "c"] {
        let statuses = stage_statuses(&events, stage);
        assert_eq!(
            statuses,
            vec![StageStatus::Running, StageStatus::Completed],
            "stage {stage}"
        );
    }
    let a_completed_pos = events
        .iter()
        .position(|e| {
            matches!(&e.kind, EventKind::StageStatus { stage, status, .. }
                if stage == "a" && *status == StageStatus::Completed)
        })
        .unwrap();
    let b_running_pos = events
        .iter()
        .position(|e| {
            matches!(&e.kind, EventKind::StageStatus { stage, status, .. }
                if stage == "b" && *status == StageStatus::Running)
        })
        .unwrap();
    assert!(a_completed_pos < b_running_pos);

    // Progress for stage a is monotonically non-decreasing.
    let a_progress: Vec<u64> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Progress { stage, current, .. } if stage == "a" => Some(*current),
            _ => None,
        })
        .collect();
    assert!(a_progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(a_progress.last(), Some(&10));

    // Final state.
    let state = manager.status(&id).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Completed);
    for stage in &state.stages {
        assert_eq!(stage.status, StageStatus::Completed);
        assert_eq!(stage.progress, 100);
    }

    // Each stage gained one timing record.
    let store = MetricsStore::new(dir.path().join("metrics"));
    for stage in ["a", "b", "c"] {
        assert_eq!(store.history(stage).len(), 1, "stage {stage}");
    }
}

#[tokio::test]
async fn retry_then_succeed_is_visible_in_events() {
    let dir = tempfile::tempdir().unwrap();
    let registry = StageRegistry::new();
    registry
        .register(
            StageDefinition::new("b", "B", StepWorker::failing_first(3)).with_retry(retry(3)),
        )
        .unwrap();

    let (manager, hub) = manager_for(registry, dir.path());
    let mut sub = hub.subscribe();

    let id = manager.start(request("p-retry")).unwrap();
    let events = collect_events(&mut sub.rx).await;

    // running (attempt 1) -> failed (attempt 1) -> running (attempt 2) ->
    // completed; the retry error appears as a recoverable error event too.
    let statuses = stage_statuses(&events, "b");
    assert_eq!(
        statuses,
        vec![
            StageStatus::Running,
            StageStatus::Failed,
            StageStatus::Running,
            StageStatus::Completed
        ]
    );
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::Error {
            recoverable: true, ..
        }
    )));

    let state = manager.status(&id).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Completed);
    assert_eq!(state.stage("b").unwrap().attempt, 2);
}

#[tokio::test]
async fn stop_mid_stage_cancels_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let registry = StageRegistry::new();
    registry
        .register(
            StageDefinition::new("a", "A", StepWorker::hanging_after(3)).with_retry(retry(1)),
        )
        .unwrap();
    registry
        .register(
            StageDefinition::new("b", "B", StepWorker::ok(1))
                .depends_on(&["a"])
                .with_retry(retry(1)),
        )
        .unwrap();
    registry
        .register(
            StageDefinition::new("c", "C", StepWorker::ok(1))
                .depends_on(&["b"])
                .with_retry(retry(1)),
        )
        .unwrap();

    let (manager, hub) = manager_for(registry, dir.path());
    let mut sub = hub.subscribe();

    let id = manager.start(request("p-stop")).unwrap();

    // Wait until stage a reports 3/10, then stop.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let EventKind::Progress { current: 3, .. } = event.kind {
            break;
        }
    }
    manager.cancel(&id).await.unwrap();

    let events = collect_events(&mut sub.rx).await;
    let terminal = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::PipelineStatus { status, .. } => Some(*status),
            _ => None,
        })
        .next_back()
        .unwrap();
    assert_eq!(terminal, PipelineStatus::Cancelled);

    let state = manager.status(&id).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Cancelled);
    assert_eq!(state.stage("a").unwrap().status, StageStatus::Cancelled);
    for stage in ["b", "c"] {
        let s = state.stage(stage).unwrap();
        assert_eq!(s.status, StageStatus::Cancelled);
        assert!(s.started_at.is_none(), "{stage} must never have run");
    }
}

#[tokio::test]
async fn slow_observer_is_dropped_while_others_receive_everything() {
    let hub = Arc::new(PushHub::new(64));

    // One slow observer that never drains.
    let _slow = hub.subscribe();

    // Healthy observers drain concurrently and count what they see.
    let mut counters = Vec::new();
    let mut drains = Vec::new();
    for _ in 0..20 {
        let mut sub = hub.subscribe();
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        counters.push(counter.clone());
        drains.push(tokio::spawn(async move {
            let mut expected = 0u64;
            while let Some(event) = sub.rx.recv().await {
                if let EventKind::Progress { current, .. } = event.kind {
                    // FIFO per observer: events arrive in publish order.
                    assert_eq!(current, expected);
                    expected += 1;
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            }
        }));
    }

    const TOTAL: u64 = 5000;
    for n in 0..TOTAL {
        // Yield inside each sub-capacity burst so healthy observers drain;
        // the slow one still overflows and gets dropped.
        if n % 32 == 0 {
            tokio::task::yield_now().await;
        }
        hub.publish(Event::new(EventKind::Progress {
            pipeline_id: "p".into(),
            stage: "a".into(),
            current: n,
            total: TOTAL,
            percentage: 0,
            message: String::new(),
            eta_seconds: None,
            eta_kind: marketpipe::hub::events::EtaKind::Calculating,
            details: None,
        }));
    }

    // Only the slow observer was dropped.
    assert_eq!(hub.observer_count(), 20);

    hub.shutdown("test over");
    for drain in drains {
        drain.await.unwrap();
    }
    for counter in counters {
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), TOTAL);
    }
}

#[tokio::test]
async fn real_subprocess_plan_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Arc::new(Paths::resolve(Some(dir.path())).unwrap());

    // Stand-in workers: tiny shell scripts speaking the tagged protocol.
    let mut settings = Settings::default();
    settings.workers.harvest = vec![
        "sh".into(),
        "-c".into(),
        concat!(
            r#"echo '[WEBSOCKET_PROGRESS] {"current": 1, "total": 1, "message": "downloaded"}'; "#,
            "touch {downloads}/2025-06-02.xlsx"
        )
        .into(),
    ];
    settings.workers.convert = vec![
        "sh".into(),
        "-c".into(),
        concat!(
            "printf 'ticker,close\\nAAA,12.5\\n' > {reports}/2025-06-02.csv && ",
            "printf 'ticker,close\\nAAA,13.0\\n' > {reports}/2025-06-05.csv && ",
            r#"echo '[WEBSOCKET_STATUS] {"status": "converted", "message": "2 files"}'"#
        )
        .into(),
    ];
    settings.workers.indices = vec![
        "sh".into(),
        "-c".into(),
        "printf 'index,value\\nMAIN,100\\n' > {indices}/index.csv".into(),
    ];
    let settings = Arc::new(settings);

    let registry = marketpipe::plan::build_registry(&settings).unwrap();
    let hub = Arc::new(PushHub::new(8192));
    let manager = Arc::new(PipelineManager::new(
        registry,
        hub.clone(),
        Arc::new(MetricsStore::new(paths.metrics.clone())),
        paths.clone(),
        settings,
    ));
    let mut sub = hub.subscribe();

    let mut req = request("p-real");
    req.mode = Mode::Initial;
    req.from_date = Some("2025-06-01".parse().unwrap());
    req.to_date = Some("2025-06-05".parse().unwrap());

    let id = manager.start(req).unwrap();
    let events = collect_events(&mut sub.rx).await;

    let state = manager.status(&id).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Completed, "state: {state:?}");

    // Forward-fill bridged the 06-03/06-04 gap from the 06-02 report.
    for day in ["2025-06-03", "2025-06-04"] {
        assert!(paths.reports.join(format!("{day}.csv")).exists());
    }
    assert!(paths.indices.join("index.csv").exists());

    // The fills surfaced as data_update events.
    let created: Vec<&str> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::DataUpdate { data, .. } => Some(data.filename.as_str()),
            _ => None,
        })
        .collect();
    assert!(created.contains(&"2025-06-03.csv"));
    assert!(created.contains(&"2025-06-04.csv"));
}
