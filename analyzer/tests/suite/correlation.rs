//! Acknowledgements from the analyzer and what they do to document state.

use std::time::Duration;

use anchor_analyzer::{AckKind, BufferBinding, BufferOptions, OrchestratorConfig, StopReason};
use anchor_types::{Location, SourceSpan, TextBuffer};
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;

use crate::common::{harness, scratch, settle};

/// Monitor a buffer that syncs on every edit, then make `edits` edits so
/// versions `0..=edits` have all been sent.
async fn synced_versions(
    orchestrator: &anchor_analyzer::AnalysisOrchestrator,
    edits: usize,
) -> (std::sync::Arc<TextBuffer>, BufferBinding) {
    let buffer = TextBuffer::new("");
    let options = BufferOptions {
        sync_immediately: true,
        ..BufferOptions::default()
    };
    let binding = orchestrator
        .monitor(&buffer, scratch("acks"), options)
        .await
        .unwrap();
    settle().await;
    for i in 0..edits {
        buffer.insert(i, "x").unwrap();
        settle().await;
    }
    (buffer, binding)
}

#[tokio::test(start_paused = true)]
async fn acknowledgements_never_move_backwards() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let (_buffer, binding) = synced_versions(&orchestrator, 3).await;
    let document = binding.document();
    let mut parsed = document.on_parse_complete();

    mock.parsed(1, 0, 3).await;
    mock.parsed(1, 0, 2).await;
    settle().await;

    assert_eq!(
        document.acknowledged_version(binding.buffer_id(), AckKind::Parse),
        Some(3)
    );
    assert_eq!(orchestrator.stale_responses(), 1);
    assert_eq!(parsed.try_recv().unwrap().version, 3);
    assert_eq!(parsed.try_recv().unwrap_err(), TryRecvError::Empty);
}

#[tokio::test(start_paused = true)]
async fn analysis_implies_parse() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let (_buffer, binding) = synced_versions(&orchestrator, 2).await;
    let document = binding.document();
    let mut parsed = document.on_parse_complete();
    let mut analyzed = orchestrator.on_analysis_complete(document);

    mock.analyzed(1, 0, 2).await;
    settle().await;

    assert_eq!(analyzed.try_recv().unwrap().version, 2);
    assert_eq!(parsed.try_recv().unwrap().version, 2);
    assert_eq!(
        document.acknowledged_version(binding.buffer_id(), AckKind::Parse),
        Some(2)
    );
    assert!(!document.is_analyzing());
}

#[tokio::test(start_paused = true)]
async fn versions_never_sent_are_rejected() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let (_buffer, binding) = synced_versions(&orchestrator, 1).await;
    let document = binding.document();
    let mut analyzed = document.on_analysis_complete();

    mock.analyzed(1, 0, 42).await;
    mock.analyzed(1, 7, 0).await;
    mock.parsed(99, 0, 0).await;
    settle().await;

    assert_eq!(
        document.acknowledged_version(binding.buffer_id(), AckKind::Analysis),
        None
    );
    assert_eq!(analyzed.try_recv().unwrap_err(), TryRecvError::Empty);
    assert!(document.is_analyzing());
}

#[tokio::test(start_paused = true)]
async fn skipped_versions_are_consumed() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let (_buffer, binding) = synced_versions(&orchestrator, 4).await;
    assert_eq!(orchestrator.pending_syncs(), 5);

    mock.parsed(1, 0, 4).await;
    settle().await;
    assert_eq!(orchestrator.pending_syncs(), 0);

    mock.parsed(1, 0, 1).await;
    settle().await;
    assert_eq!(orchestrator.stale_responses(), 1);
    assert_eq!(
        binding
            .document()
            .acknowledged_version(binding.buffer_id(), AckKind::Parse),
        Some(4)
    );
}

#[tokio::test(start_paused = true)]
async fn analyzed_versions_can_be_reanchored() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let buffer = TextBuffer::new("ab\n");
    let binding = orchestrator
        .monitor(&buffer, scratch("anchor"), BufferOptions::default())
        .await
        .unwrap();
    settle().await;
    mock.analyzed(1, 0, 0).await;
    settle().await;

    let current = buffer.insert(0, "\n\n").unwrap();
    let span = SourceSpan::new(Location::new(0, 1), Location::new(0, 2));
    let document = binding.document();
    assert_eq!(
        document.translate_span(binding.buffer_id(), span, 0, &current),
        SourceSpan::new(Location::new(2, 1), Location::new(2, 2))
    );
    // Versions that cannot be resolved keep line and column.
    assert_eq!(
        document.translate_span(binding.buffer_id(), span, 7, &current),
        span
    );
}

#[tokio::test(start_paused = true)]
async fn crash_settles_pending_syncs_and_forces_reset() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let mut exited = orchestrator.on_analyzer_exited();
    let buffer = TextBuffer::new("print(1)\n");
    let binding = orchestrator
        .monitor(&buffer, scratch("crash"), BufferOptions::default())
        .await
        .unwrap();
    settle().await;
    buffer.insert(9, "print(2)\n").unwrap();
    settle().await;
    assert_eq!(orchestrator.pending_syncs(), 2);

    mock.crash().await;
    settle().await;
    assert_eq!(orchestrator.pending_syncs(), 0);
    let event = exited.try_recv().unwrap();
    assert!(matches!(event.reason, StopReason::Exited { code: Some(1), .. }));
    assert!(binding.document().last_sent(binding.buffer_id()).is_none());

    buffer.insert(18, "print(3)\n").unwrap();
    settle().await;
    let updates = mock.updates();
    let last = &updates.last().unwrap()["updates"][0];
    assert_eq!(last["kind"], json!("reset"));
    assert_eq!(last["content"], json!("print(1)\nprint(2)\nprint(3)\n"));
}

#[tokio::test(start_paused = true)]
async fn crash_during_a_sync_rolls_it_back() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    mock.hold_updates();
    let buffer = TextBuffer::new("print(1)\n");
    let binding = orchestrator
        .monitor(&buffer, scratch("held"), BufferOptions::default())
        .await
        .unwrap();
    settle().await;
    assert_eq!(mock.updates().len(), 1);
    assert_eq!(orchestrator.pending_syncs(), 1);

    mock.crash().await;
    settle().await;
    assert_eq!(orchestrator.pending_syncs(), 0);
    assert!(binding.document().last_sent(binding.buffer_id()).is_none());

    mock.release_updates(8);
    buffer.insert(9, "print(2)\n").unwrap();
    settle().await;
    let updates = mock.updates();
    assert_eq!(updates.len(), 2);
    assert_eq!(
        updates[1]["updates"],
        json!([{"kind": "reset", "bufferId": 0, "version": 1, "content": "print(1)\nprint(2)\n"}])
    );
    assert_eq!(mock.text(1, 0).unwrap(), "print(1)\nprint(2)\n");
    assert_eq!(orchestrator.pending_syncs(), 1);
}

#[tokio::test(start_paused = true)]
async fn waiting_for_analysis() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let (_buffer, _binding) = synced_versions(&orchestrator, 1).await;
    assert!(orchestrator.is_analyzing());
    assert!(
        !orchestrator
            .wait_for_complete_analysis(Duration::from_millis(200))
            .await
    );

    let waiter = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .wait_for_complete_analysis(Duration::from_secs(5))
                .await
        })
    };
    settle().await;
    mock.analyzed(1, 0, 1).await;
    assert!(waiter.await.unwrap());
    assert!(!orchestrator.is_analyzing());
}
