//! End-to-end upload scenarios against the assembled component stack

use bytes::Bytes;
use ingestd::auth::Principal;
use ingestd::bus::SubscriberQueue;
use ingestd::config::{Config, RetryConfig};
use ingestd::error::Error;
use ingestd::events::UploadEvent;
use ingestd::types::{DigestAlgorithm, FileMetadata};
use ingestd::AppState;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const CHUNK: u64 = 1024;

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.uploads_path = tmp.path().to_path_buf();
    config.chunk_size = CHUNK;
    config.retry = RetryConfig {
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        max_attempts: 3,
    };
    config.jwt_secret = "test-secret".into();
    config
}

fn test_state(tmp: &TempDir) -> AppState {
    let verifier = Arc::new(ingestd::auth::SharedSecretVerifier::new("test-secret"));
    let (state, retry_rx) = ingestd::build_state(test_config(tmp), verifier);
    ingestd::spawn_background_tasks(&state, retry_rx);
    state
}

fn alice() -> Principal {
    Principal {
        id: "alice".into(),
        role: "user".into(),
    }
}

fn bob() -> Principal {
    Principal {
        id: "bob".into(),
        role: "user".into(),
    }
}

fn metadata(name: &str, size: u64) -> FileMetadata {
    FileMetadata {
        name: name.into(),
        size,
        content_type: None,
        tool_resource: None,
        agent_id: None,
    }
}

fn chunk_bytes(index: u32, len: u64) -> Bytes {
    Bytes::from(vec![b'a' + (index % 26) as u8; len as usize])
}

async fn recv_event(queue: &Arc<SubscriberQueue>) -> UploadEvent {
    tokio::time::timeout(Duration::from_secs(2), queue.recv())
        .await
        .expect("expected an event within 2s")
        .expect("subscriber queue closed unexpectedly")
}

// ---------------------------------------------------------------------------
// Scenario: happy path small file, chunks arriving out of order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_out_of_order_chunks() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();
    let subscriber = state.bus.subscribe(&principal.id);

    state
        .sessions
        .init(&principal, "f1", metadata("f1.bin", 3 * CHUNK))
        .await
        .unwrap();

    for index in [2u32, 0, 1] {
        let outcome = state
            .sessions
            .upload_chunk(&principal, "f1", index, chunk_bytes(index, CHUNK), None)
            .await
            .unwrap();
        assert!(!outcome.already_received);
        assert_eq!(outcome.total, 3);
    }

    let outcome = state
        .sessions
        .complete(&principal, "f1", "out/f1.bin")
        .await
        .unwrap();
    assert_eq!(outcome.size, 3 * CHUNK);

    // Assembled bytes equal the concatenation in index order
    let assembled = tokio::fs::read(tmp.path().join("out/f1.bin")).await.unwrap();
    let mut expected = Vec::new();
    for index in 0..3 {
        expected.extend_from_slice(&chunk_bytes(index, CHUNK));
    }
    assert_eq!(assembled, expected);

    // Event stream: started first, completed last, progress monotonic
    let first = recv_event(&subscriber.queue).await;
    assert_eq!(first.event_type(), "upload_started");

    let mut last_progress = 0.0f64;
    let mut saw_three_chunks = false;
    loop {
        let event = recv_event(&subscriber.queue).await;
        match event {
            UploadEvent::UploadProgress {
                progress,
                received_chunks,
                ..
            } => {
                assert!(progress >= last_progress, "progress regressed");
                last_progress = progress;
                if received_chunks == Some(3) {
                    saw_three_chunks = true;
                }
            }
            UploadEvent::UploadCompleted { size, .. } => {
                assert_eq!(size, Some(3 * CHUNK));
                break;
            }
            other => panic!("unexpected event {:?}", other.event_type()),
        }
    }
    assert!(saw_three_chunks, "expected a Progress(3/3) event");
}

// ---------------------------------------------------------------------------
// Scenario: resumed transfer after client restart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resume_reports_exact_gaps() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();

    state
        .sessions
        .init(&principal, "f2", metadata("f2.bin", 5 * CHUNK))
        .await
        .unwrap();

    for index in [0u32, 2, 4] {
        state
            .sessions
            .upload_chunk(&principal, "f2", index, chunk_bytes(index, CHUNK), None)
            .await
            .unwrap();
    }

    // Client restarts; resume reconciles against the chunk store
    let resumed = state.sessions.resume(&principal, "f2").await.unwrap();
    assert_eq!(resumed.total_chunks, 5);
    assert_eq!(resumed.received, vec![0, 2, 4]);
    assert_eq!(resumed.missing, vec![1, 3]);
    assert!((resumed.progress - 0.6).abs() < 1e-9);

    for index in [1u32, 3] {
        state
            .sessions
            .upload_chunk(&principal, "f2", index, chunk_bytes(index, CHUNK), None)
            .await
            .unwrap();
    }

    let outcome = state
        .sessions
        .complete(&principal, "f2", "out/f2.bin")
        .await
        .unwrap();
    assert_eq!(outcome.size, 5 * CHUNK);
}

// ---------------------------------------------------------------------------
// Scenario: checksum mismatch rejects the chunk without recording it
// ---------------------------------------------------------------------------

#[tokio::test]
async fn checksum_mismatch_then_correct_digest() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();

    state
        .sessions
        .init(&principal, "f3", metadata("f3.bin", CHUNK))
        .await
        .unwrap();

    let bytes = chunk_bytes(0, CHUNK);
    let err = state
        .sessions
        .upload_chunk(
            &principal,
            "f3",
            0,
            bytes.clone(),
            Some("deadbeefdeadbeefdeadbeefdeadbeef".into()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { index: 0, .. }));

    // Chunk was not recorded
    let resumed = state.sessions.resume(&principal, "f3").await.unwrap();
    assert_eq!(resumed.missing, vec![0]);

    // Correct digest succeeds
    let digest = DigestAlgorithm::Md5.digest_hex(&bytes);
    let outcome = state
        .sessions
        .upload_chunk(&principal, "f3", 0, bytes, Some(digest))
        .await
        .unwrap();
    assert_eq!(outcome.received, 1);
    assert!(state.sessions.validate(&principal, "f3").await.unwrap());
}

// ---------------------------------------------------------------------------
// Idempotence: re-uploading an accepted chunk is a no-op
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_chunk_upload_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();

    state
        .sessions
        .init(&principal, "f4", metadata("f4.bin", 2 * CHUNK))
        .await
        .unwrap();

    let bytes = chunk_bytes(0, CHUNK);
    let first = state
        .sessions
        .upload_chunk(&principal, "f4", 0, bytes.clone(), None)
        .await
        .unwrap();
    assert!(!first.already_received);
    assert_eq!(first.received, 1);

    let second = state
        .sessions
        .upload_chunk(&principal, "f4", 0, bytes, None)
        .await
        .unwrap();
    assert!(second.already_received);
    assert_eq!(second.received, 1);
    assert_eq!(second.progress, first.progress);
}

// ---------------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chunk_index_equal_to_total_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();

    state
        .sessions
        .init(&principal, "f5", metadata("f5.bin", 3 * CHUNK))
        .await
        .unwrap();

    let err = state
        .sessions
        .upload_chunk(&principal, "f5", 3, chunk_bytes(3, CHUNK), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadIndex { index: 3, total: 3 }));
}

#[tokio::test]
async fn size_limit_boundary() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();
    let limit = CHUNK * 1000;

    // Exactly at the limit is accepted
    state
        .sessions
        .init(&principal, "exact", metadata("exact.bin", limit))
        .await
        .unwrap();

    // One byte over is rejected
    let err = state
        .sessions
        .init(&principal, "over", metadata("over.bin", limit + 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SizeExceeded { .. }));
}

#[tokio::test]
async fn zero_byte_file_completes_immediately() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();

    let outcome = state
        .sessions
        .init(&principal, "empty", metadata("empty.bin", 0))
        .await
        .unwrap();
    assert_eq!(outcome.total_chunks, 0);

    let assembled = state
        .sessions
        .complete(&principal, "empty", "out/empty.bin")
        .await
        .unwrap();
    assert_eq!(assembled.size, 0);
    assert_eq!(
        tokio::fs::metadata(tmp.path().join("out/empty.bin"))
            .await
            .unwrap()
            .len(),
        0
    );
}

#[tokio::test]
async fn upload_after_cancel_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();

    state
        .sessions
        .init(&principal, "f6", metadata("f6.bin", 2 * CHUNK))
        .await
        .unwrap();
    state
        .sessions
        .upload_chunk(&principal, "f6", 0, chunk_bytes(0, CHUNK), None)
        .await
        .unwrap();

    state.sessions.cancel(&principal, "f6").await.unwrap();

    let err = state
        .sessions
        .upload_chunk(&principal, "f6", 1, chunk_bytes(1, CHUNK), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Session lifecycle rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_init_conflicts_until_terminal() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();

    state
        .sessions
        .init(&principal, "f7", metadata("f7.bin", CHUNK))
        .await
        .unwrap();

    let err = state
        .sessions
        .init(&principal, "f7", metadata("f7.bin", CHUNK))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // Finish the upload; a terminal session with the same id is reset
    state
        .sessions
        .upload_chunk(&principal, "f7", 0, chunk_bytes(0, CHUNK), None)
        .await
        .unwrap();
    state
        .sessions
        .complete(&principal, "f7", "out/f7.bin")
        .await
        .unwrap();

    state
        .sessions
        .init(&principal, "f7", metadata("f7.bin", CHUNK))
        .await
        .expect("terminal session should be reset by init");
}

#[tokio::test]
async fn foreign_principal_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);

    state
        .sessions
        .init(&alice(), "f8", metadata("f8.bin", CHUNK))
        .await
        .unwrap();

    let err = state
        .sessions
        .upload_chunk(&bob(), "f8", 0, chunk_bytes(0, CHUNK), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));

    let err = state.sessions.cancel(&bob(), "f8").await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));
}

#[tokio::test]
async fn concurrent_complete_has_exactly_one_winner() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();

    state
        .sessions
        .init(&principal, "f9", metadata("f9.bin", 2 * CHUNK))
        .await
        .unwrap();
    for index in 0..2 {
        state
            .sessions
            .upload_chunk(&principal, "f9", index, chunk_bytes(index, CHUNK), None)
            .await
            .unwrap();
    }

    let (a, b) = tokio::join!(
        state.sessions.complete(&principal, "f9", "out/f9-a.bin"),
        state.sessions.complete(&principal, "f9", "out/f9-b.bin"),
    );
    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1, "exactly one assemble must win");
    for result in [a, b] {
        if let Err(err) = result {
            assert!(matches!(err, Error::Conflict(_)));
        }
    }
}

#[tokio::test]
async fn incomplete_upload_cannot_complete() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();

    state
        .sessions
        .init(&principal, "f10", metadata("f10.bin", 3 * CHUNK))
        .await
        .unwrap();
    state
        .sessions
        .upload_chunk(&principal, "f10", 0, chunk_bytes(0, CHUNK), None)
        .await
        .unwrap();

    let err = state
        .sessions
        .complete(&principal, "f10", "out/f10.bin")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn final_path_is_confined_to_uploads_root() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();

    state
        .sessions
        .init(&principal, "f11", metadata("f11.bin", CHUNK))
        .await
        .unwrap();
    state
        .sessions
        .upload_chunk(&principal, "f11", 0, chunk_bytes(0, CHUNK), None)
        .await
        .unwrap();

    let err = state
        .sessions
        .complete(&principal, "f11", "../escape.bin")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));

    let err = state
        .sessions
        .complete(&principal, "f11", "/etc/owned")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));
}

// ---------------------------------------------------------------------------
// Scenario: fan-out isolation between principals
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscriber_isolation_across_principals() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();

    let sub_a = state.bus.subscribe("alice");
    let sub_b = state.bus.subscribe("bob");

    state
        .sessions
        .init(&principal, "f12", metadata("f12.bin", CHUNK))
        .await
        .unwrap();
    state
        .sessions
        .upload_chunk(&principal, "f12", 0, chunk_bytes(0, CHUNK), None)
        .await
        .unwrap();
    state
        .sessions
        .complete(&principal, "f12", "out/f12.bin")
        .await
        .unwrap();

    // Alice observes the full stream ending in completion
    let mut saw_completed = false;
    loop {
        let event = recv_event(&sub_a.queue).await;
        assert_eq!(event.principal_id(), Some("alice"));
        if event.event_type() == "upload_completed" {
            saw_completed = true;
            break;
        }
    }
    assert!(saw_completed);

    // Bob receives nothing for alice's file
    sub_b.queue.close();
    assert!(sub_b.queue.recv().await.is_none());
}

// ---------------------------------------------------------------------------
// Pipeline stage selection reflected in status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pipeline_stages_follow_metadata() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let principal = alice();

    let meta = FileMetadata {
        name: "scan.pdf".into(),
        size: CHUNK,
        content_type: Some("application/pdf".into()),
        tool_resource: Some("ocr".into()),
        agent_id: None,
    };
    state.sessions.init(&principal, "f13", meta).await.unwrap();

    let pipeline = state.pipeline.status("f13").await.unwrap();
    let names: Vec<&str> = pipeline.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["upload", "validation", "processing", "ocr", "storage", "cleanup"]
    );

    state
        .sessions
        .upload_chunk(&principal, "f13", 0, chunk_bytes(0, CHUNK), None)
        .await
        .unwrap();
    state
        .sessions
        .complete(&principal, "f13", "out/scan.pdf")
        .await
        .unwrap();

    let pipeline = state.pipeline.status("f13").await.unwrap();
    assert!((pipeline.overall_progress - 1.0).abs() < 1e-9);
    assert!(!pipeline.failed);

    // Session snapshot survives terminal for the grace window
    let session = state
        .sessions
        .status(&principal, "f13")
        .await
        .unwrap()
        .expect("terminal session observable during grace period");
    assert_eq!(session.received_chunks, 1);
}
