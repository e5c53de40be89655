//! End-to-end tests against the `lmlayer-worker` executable over stdio.

use std::path::Path;

use lmlayer::{
    ClientError, Configuration, Context, InitializeParams, LMLayer, PredictParams,
    ProcessSpawner, Suggestion, Transform,
};

const WORKER: &str = env!("CARGO_BIN_EXE_lmlayer-worker");

fn worker_in(dir: &Path) -> ProcessSpawner {
    ProcessSpawner::new(WORKER).with_args([
        "--model-dir".to_string(),
        dir.display().to_string(),
    ])
}

#[tokio::test]
async fn subprocess_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("en.json"),
        r#"{
            "suggestions": [[
                {"transform": {"insert": "hello", "deleteLeft": 0}, "weight": 5},
                {"transform": {"insert": "help", "deleteLeft": 0}, "displayAs": "help!", "weight": 1},
                {"transform": {"insert": "helm", "deleteLeft": 0}, "weight": 3}
            ]]
        }"#,
    )
    .unwrap();

    let lm = LMLayer::spawn(&worker_in(dir.path())).unwrap();
    let configuration = lm
        .initialize(InitializeParams::new("en.json").with_configuration(
            Configuration::new().with(Configuration::MAX_LEFT_CONTEXT_CODE_UNITS, 10),
        ))
        .await
        .unwrap();
    // No declared configuration in the file, so the request is echoed.
    assert_eq!(configuration.max_left_context_code_units(), Some(10));
    assert!(!configuration.supports_right_contexts());

    let reply = lm
        .predict(PredictParams::new(Transform::insert("l"), Context::left("hel")))
        .await
        .unwrap();
    assert_eq!(
        reply.suggestions,
        vec![
            Suggestion {
                transform: Transform::insert("help"),
                display_as: "help!".to_string(),
            },
            Suggestion {
                transform: Transform::insert("helm"),
                display_as: "helm".to_string(),
            },
            Suggestion {
                transform: Transform::insert("hello"),
                display_as: "hello".to_string(),
            },
        ]
    );

    let err = lm
        .predict(PredictParams::new(Transform::insert("l"), Context::left("hel")).with_null_token())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ClientError::UnknownMessage {
            kind: "invalid".to_string()
        }
    );

    assert_eq!(lm.shutdown().await, Ok(()));
}

#[tokio::test]
async fn subprocess_load_failure_disconnects() {
    let dir = tempfile::tempdir().unwrap();
    let lm = LMLayer::spawn(&worker_in(dir.path())).unwrap();

    let err = lm
        .initialize(InitializeParams::new("missing.json"))
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::Disconnected);
    assert_eq!(lm.join().await, Err(ClientError::Disconnected));
}

/// A fake worker that answers the handshake, then sends `invalid` without a
/// token key. That frame must not settle the pending null-token call.
#[cfg(unix)]
#[tokio::test]
async fn tokenless_frame_from_worker_is_fatal() {
    let script = r#"printf '\000\000\000\046{"message":"ready","configuration":{}}'; sleep 1; printf '\000\000\000\025{"message":"invalid"}'; cat >/dev/null"#;
    let lm = LMLayer::spawn(&ProcessSpawner::new("sh").with_args(["-c", script])).unwrap();

    lm.initialize(InitializeParams::new("any")).await.unwrap();

    let err = lm
        .predict(PredictParams::new(Transform::insert("a"), Context::left("")).with_null_token())
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::Disconnected);
    assert_eq!(lm.join().await, Err(ClientError::Disconnected));
}
