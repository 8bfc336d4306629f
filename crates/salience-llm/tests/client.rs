//! Client wiring and transport failure mapping, no live API required.

use std::sync::Arc;

use salience_core::{
    Capabilities, CapabilityError, EmbeddingModel, EngineConfig, ExtractionModel,
    ExtractionRequest, Session, SummarizationModel, SummaryRequest,
};
use salience_llm::{LlmError, OpenAiClient, OpenAiConfig};

/// Nothing listens on the discard port.
fn unreachable_client() -> OpenAiClient {
    let mut config = OpenAiConfig::new("http://127.0.0.1:9", "sk-test");
    config.request_timeout_secs = 2;
    OpenAiClient::new(config).expect("client builds")
}

#[test]
fn missing_api_key_is_rejected() {
    let config = OpenAiConfig::from_lookup(|_| None);
    let err = OpenAiClient::new(config).unwrap_err();
    assert!(matches!(err, LlmError::MissingApiKey));
    let mapped: CapabilityError = err.into();
    assert!(!mapped.is_transient());
}

#[test]
fn debug_output_hides_api_key() {
    let client = OpenAiClient::new(OpenAiConfig::new("http://localhost", "sk-secret")).unwrap();
    let rendered = format!("{client:?}");
    assert!(!rendered.contains("sk-secret"));
    assert!(rendered.contains("localhost"));
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transient_failure() {
    let client = unreachable_client();
    let err = client.embed(&["hello".to_string()]).await.unwrap_err();
    assert!(
        !matches!(err, CapabilityError::MalformedResponse(_)),
        "transport failure mapped to {err:?}"
    );
    assert!(err.is_transient());
}

#[tokio::test]
async fn empty_embedding_batch_makes_no_request() {
    let client = unreachable_client();
    let vectors = client.embed(&[]).await.unwrap();
    assert!(vectors.is_empty());
}

#[tokio::test]
async fn extraction_and_summary_failures_surface_as_capability_errors() {
    let client = unreachable_client();
    let request = ExtractionRequest {
        window: Vec::new(),
        goal: "Fix the login bug".into(),
        constraints: Vec::new(),
        instruction: String::new(),
    };
    assert!(client.extract(&request).await.is_err());

    let summary = SummaryRequest {
        text: "Some background".into(),
    };
    assert!(client.summarize(&summary).await.is_err());
}

#[tokio::test]
async fn session_wires_from_client() {
    let client = Arc::new(unreachable_client());
    let capabilities = Capabilities::from_client(client);
    assert!(capabilities.judge.is_some());

    let session = Session::initialize(
        "Fix the login bug",
        ["Do not modify the database schema"],
        capabilities,
        EngineConfig::default(),
    )
    .unwrap();
    assert_eq!(session.core().await.goal(), "Fix the login bug");
}
