//! Registry, buffer bindings, owner counting and local work.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anchor_analyzer::{
    AckKind, Analyzable, AnalysisOutcome, BufferOptions, OrchestratorConfig, Priority, WorkKey,
};
use anchor_types::{BufferId, TextBuffer};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::common::{harness, scratch, settle};

#[tokio::test(start_paused = true)]
async fn one_document_per_path() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let first = orchestrator.analyze_file(scratch("same")).await.unwrap();
    let second = orchestrator.analyze_file(scratch("same")).await.unwrap();
    let other = orchestrator.analyze_file(scratch("other")).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_ne!(first.file_id(), other.file_id());
    assert_eq!(mock.requests("addFile").len(), 2);
    assert_eq!(mock.requests("addFile")[0].params, json!({"path": "<same>"}));
    assert_eq!(orchestrator.documents().len(), 2);
    assert!(orchestrator.get_document(&scratch("missing")).is_none());
}

#[tokio::test(start_paused = true)]
async fn buffer_ids_reuse_the_lowest_free_slot() {
    let (orchestrator, _mock) = harness(OrchestratorConfig::default());
    let path = scratch("views");
    let a = TextBuffer::new("a");
    let b = TextBuffer::new("b");
    let c = TextBuffer::new("c");

    let bind_a = orchestrator
        .monitor(&a, path.clone(), BufferOptions::default())
        .await
        .unwrap();
    let bind_b = orchestrator
        .monitor(&b, path.clone(), BufferOptions::default())
        .await
        .unwrap();
    assert_eq!(bind_a.buffer_id(), BufferId::new(0));
    assert_eq!(bind_b.buffer_id(), BufferId::new(1));
    assert_eq!(bind_a.document().default_buffer(), Some(BufferId::new(0)));

    orchestrator.unmonitor(bind_a).await;
    let bind_c = orchestrator
        .monitor(&c, path, BufferOptions::default())
        .await
        .unwrap();
    assert_eq!(bind_c.buffer_id(), BufferId::new(0));
    assert_eq!(
        bind_c.document().buffers(),
        vec![BufferId::new(0), BufferId::new(1)]
    );
}

#[tokio::test(start_paused = true)]
async fn last_unmonitor_unloads_the_document() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let buffer = TextBuffer::new("x = 1\n");
    let first = orchestrator
        .monitor(&buffer, scratch("shared"), BufferOptions::default())
        .await
        .unwrap();
    let second = orchestrator
        .monitor(&buffer, scratch("shared"), BufferOptions::default())
        .await
        .unwrap();
    assert_eq!(first.buffer_id(), second.buffer_id());
    settle().await;

    orchestrator.unmonitor(first).await;
    assert!(orchestrator.get_document(&scratch("shared")).is_some());
    assert!(mock.requests("unloadFile").is_empty());

    orchestrator.unmonitor(second).await;
    assert!(orchestrator.get_document(&scratch("shared")).is_none());
    assert_eq!(mock.requests("unloadFile")[0].params, json!({"fileId": 1}));
    assert_eq!(orchestrator.pending_syncs(), 0);

    // Nothing is sent for a document that is gone.
    let updates = mock.updates().len();
    buffer.insert(0, "y = 0\n").unwrap();
    settle().await;
    assert_eq!(mock.updates().len(), updates);
}

#[tokio::test(start_paused = true)]
async fn detaching_a_buffer_settles_its_pending_syncs() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let main = TextBuffer::new("main\n");
    let side = TextBuffer::new("side\n");
    let bind_main = orchestrator
        .monitor(&main, scratch("detach"), BufferOptions::default())
        .await
        .unwrap();
    let bind_side = orchestrator
        .monitor(&side, scratch("detach"), BufferOptions::default())
        .await
        .unwrap();
    settle().await;
    assert!(orchestrator.pending_syncs() > 0);

    mock.parsed(1, 0, 0).await;
    settle().await;
    assert_eq!(orchestrator.pending_syncs(), 1);

    // The side buffer's version 0 will never be parsed now.
    orchestrator.unmonitor(bind_side).await;
    assert_eq!(orchestrator.pending_syncs(), 0);

    mock.auto_ack.store(true, Ordering::SeqCst);
    main.insert(5, "more\n").unwrap();
    settle().await;
    assert_eq!(orchestrator.pending_syncs(), 0);
    assert_eq!(
        bind_main
            .document()
            .acknowledged_version(bind_main.buffer_id(), AckKind::Parse),
        Some(1)
    );
}

#[tokio::test(start_paused = true)]
async fn reopening_a_buffer_settles_its_pending_syncs() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let before = TextBuffer::new("");
    for i in 0..5 {
        before.insert(i, "x").unwrap();
    }
    let binding = orchestrator
        .monitor(&before, scratch("reopen"), BufferOptions::default())
        .await
        .unwrap();
    settle().await;
    assert_eq!(mock.updates()[0]["updates"][0]["version"], json!(5));
    assert_eq!(orchestrator.pending_syncs(), 1);

    mock.auto_ack.store(true, Ordering::SeqCst);
    let after = TextBuffer::new("fresh\n");
    assert!(binding.document().replace_buffer(binding.buffer_id(), &after));
    settle().await;

    assert_eq!(orchestrator.pending_syncs(), 0);
    let document = binding.document();
    assert_eq!(
        document.acknowledged_version(binding.buffer_id(), AckKind::Analysis),
        Some(0)
    );
    assert!(!document.is_analyzing());
}

#[tokio::test(start_paused = true)]
async fn cookie_follows_the_default_buffer() {
    let (orchestrator, _mock) = harness(OrchestratorConfig::default());
    let main = TextBuffer::new("main");
    let preview = TextBuffer::new("preview");
    let binding = orchestrator
        .monitor(&main, scratch("cookie"), BufferOptions::default())
        .await
        .unwrap();
    orchestrator
        .monitor(&preview, scratch("cookie"), BufferOptions::default())
        .await
        .unwrap();
    settle().await;

    let document = binding.document();
    assert_eq!(document.analysis_cookie(), Some(main.current()));
    preview.insert(0, "\n").unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(document.analysis_cookie(), Some(main.current()));
}

#[tokio::test(start_paused = true)]
async fn options_change_resends_everything() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let buffer = TextBuffer::new("match x:\n");
    orchestrator
        .monitor(&buffer, scratch("options"), BufferOptions::default())
        .await
        .unwrap();
    settle().await;

    orchestrator
        .notify_options_changed(Some("cpython".to_string()), Some("3.12".to_string()))
        .await;
    assert_eq!(
        mock.notifications("optionsChanged"),
        vec![json!({"interpreterId": "cpython", "languageVersion": "3.12"})]
    );
    let updates = mock.updates();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1]["updates"][0]["kind"], json!("reset"));
}

#[tokio::test(start_paused = true)]
async fn last_owner_tears_down() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let buffer = TextBuffer::new("");
    orchestrator
        .monitor(&buffer, scratch("owned"), BufferOptions::default())
        .await
        .unwrap();
    settle().await;

    assert!(orchestrator.acquire());
    orchestrator.release().await;
    assert!(orchestrator.is_running());
    assert!(!mock.shut_down.load(Ordering::SeqCst));

    orchestrator.release().await;
    assert!(!orchestrator.is_running());
    assert!(mock.shut_down.load(Ordering::SeqCst));
    assert!(orchestrator.documents().is_empty());
    assert!(!orchestrator.acquire());
    assert!(orchestrator.analyze_file(scratch("late")).await.is_none());
}

struct Counted {
    key: WorkKey,
    runs: Arc<AtomicUsize>,
}

impl Analyzable for Counted {
    fn key(&self) -> WorkKey {
        self.key.clone()
    }

    fn analyze(&self, _cancel: &CancellationToken) -> AnalysisOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        AnalysisOutcome::Completed
    }
}

#[tokio::test]
async fn local_work_runs_on_the_queue() {
    let (orchestrator, _mock) = harness(OrchestratorConfig::default());
    let runs = Arc::new(AtomicUsize::new(0));
    for name in ["a", "b", "a"] {
        orchestrator.enqueue_local(
            Arc::new(Counted {
                key: WorkKey::new(name),
                runs: Arc::clone(&runs),
            }),
            Priority::Normal,
        );
    }
    assert!(orchestrator.queue().wait_until_idle(Duration::from_secs(5)));
    assert!((2..=3).contains(&runs.load(Ordering::SeqCst)));
    assert!(orchestrator.wait_for_complete_analysis(Duration::from_secs(1)).await);
    orchestrator.release().await;
}
