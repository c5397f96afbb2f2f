//! Positional queries: tagging with the sent version and re-anchoring the
//! answers to the caller's snapshot.

use std::sync::atomic::Ordering;

use anchor_analyzer::{BufferOptions, DocumentPath, OrchestratorConfig};
use anchor_types::{FileId, Location, SourceSpan, TextBuffer};
use serde_json::json;

use crate::common::{harness, scratch, settle};

fn span_json(line: usize, start: usize, end: usize) -> serde_json::Value {
    json!({
        "start": {"line": line, "column": start},
        "end": {"line": line, "column": end},
    })
}

#[tokio::test(start_paused = true)]
async fn completions_are_reanchored_to_the_callers_snapshot() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let buffer = TextBuffer::new("import os\nos.pa\n");
    let binding = orchestrator
        .monitor(&buffer, scratch("complete"), BufferOptions::default())
        .await
        .unwrap();
    settle().await;

    // The caller still looks at version 0; meanwhile a line was added on top.
    let seen = buffer.current();
    buffer.insert(0, "import sys\n").unwrap();

    mock.reply_with(
        "completions",
        json!({
            "version": 1,
            "span": span_json(2, 3, 5),
            "completions": [{"name": "path"}, {"name": "pardir", "kind": "constant"}],
        }),
    );
    let completions = orchestrator
        .get_completions(&binding, &seen, Location::new(1, 5))
        .await
        .unwrap();

    let request = &mock.requests("completions")[0].params;
    assert_eq!(request["version"], json!(1));
    assert_eq!(request["location"], json!({"line": 2, "column": 5}));
    assert_eq!(
        completions.span,
        Some(SourceSpan::new(Location::new(1, 3), Location::new(1, 5)))
    );
    assert_eq!(completions.items.len(), 2);
    assert_eq!(completions.items[1].kind.as_deref(), Some("constant"));

    // The query flushed the pending edit first.
    let updates = mock.updates();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1]["updates"][0]["version"], json!(1));
}

#[tokio::test(start_paused = true)]
async fn signatures_and_quick_info() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let buffer = TextBuffer::new("print(1, 2)\n");
    let binding = orchestrator
        .monitor(&buffer, scratch("sig"), BufferOptions::default())
        .await
        .unwrap();
    settle().await;
    let snapshot = buffer.current();

    mock.reply_with(
        "signatures",
        json!({
            "version": 0,
            "span": span_json(0, 0, 11),
            "activeParameter": 1,
            "signatures": [{
                "name": "print",
                "parameters": [{"name": "*values"}, {"name": "sep"}],
            }],
        }),
    );
    let signatures = orchestrator
        .get_signatures(&binding, &snapshot, Location::new(0, 9))
        .await
        .unwrap();
    assert_eq!(signatures.active_parameter, Some(1));
    assert_eq!(signatures.signatures[0].parameters.len(), 2);
    assert_eq!(
        signatures.span,
        Some(SourceSpan::new(Location::new(0, 0), Location::new(0, 11)))
    );

    mock.reply_with(
        "quickInfo",
        json!({"version": 0, "span": span_json(0, 0, 5), "text": "print(*values, sep=' ')"}),
    );
    let info = orchestrator
        .get_quick_info(&binding, &snapshot, Location::new(0, 2))
        .await
        .unwrap();
    assert_eq!(info.text, "print(*values, sep=' ')");
    assert_eq!(mock.requests("quickInfo")[0].params["location"], json!({"line": 0, "column": 2}));
}

#[tokio::test(start_paused = true)]
async fn definitions_in_other_files_are_not_translated() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let library = TextBuffer::new("def helper():\n    pass\n");
    orchestrator
        .monitor(
            &library,
            DocumentPath::File("/work/lib.py".into()),
            BufferOptions::default(),
        )
        .await
        .unwrap();
    let buffer = TextBuffer::new("helper()\n");
    let binding = orchestrator
        .monitor(&buffer, scratch("main"), BufferOptions::default())
        .await
        .unwrap();
    settle().await;
    let seen = buffer.current();
    buffer.insert(0, "\n").unwrap();

    mock.reply_with(
        "definitions",
        json!({
            "version": 1,
            "definitions": [
                {"fileId": 1, "span": span_json(0, 4, 10), "name": "helper"},
                {"fileId": 2, "span": span_json(1, 0, 6)},
            ],
        }),
    );
    let definitions = orchestrator
        .get_definitions(&binding, &seen, Location::new(0, 1))
        .await
        .unwrap();

    assert_eq!(definitions.len(), 2);
    assert_eq!(definitions[0].file_id, FileId::new(1));
    assert_eq!(
        definitions[0].path,
        Some(DocumentPath::File("/work/lib.py".into()))
    );
    assert_eq!(
        definitions[0].span,
        SourceSpan::new(Location::new(0, 4), Location::new(0, 10))
    );
    assert_eq!(
        definitions[1].span,
        SourceSpan::new(Location::new(0, 0), Location::new(0, 6))
    );
}

#[tokio::test(start_paused = true)]
async fn queries_fail_soft_when_the_buffer_cannot_sync() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    mock.fail_updates.store(true, Ordering::SeqCst);
    let buffer = TextBuffer::new("x");
    let binding = orchestrator
        .monitor(&buffer, scratch("offline"), BufferOptions::default())
        .await
        .unwrap();
    settle().await;

    let snapshot = buffer.current();
    assert!(
        orchestrator
            .get_completions(&binding, &snapshot, Location::new(0, 1))
            .await
            .is_none()
    );
    assert!(mock.requests("completions").is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_answers_become_none() {
    let (orchestrator, mock) = harness(OrchestratorConfig::default());
    let buffer = TextBuffer::new("x");
    let binding = orchestrator
        .monitor(&buffer, scratch("garbled"), BufferOptions::default())
        .await
        .unwrap();
    settle().await;

    mock.reply_with("quickInfo", json!({"text": 5}));
    let snapshot = buffer.current();
    assert!(
        orchestrator
            .get_quick_info(&binding, &snapshot, Location::new(0, 0))
            .await
            .is_none()
    );
}
