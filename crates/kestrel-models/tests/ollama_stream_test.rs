//! Streaming tests for OllamaModel against a mocked `/api/chat` endpoint.

use futures::StreamExt;
use kestrel_abstraction::{ChatMessage, ChatRequest, Model, ModelError, ToolDefinition};
use kestrel_models::OllamaModel;
use serde_json::json;

fn chat_request() -> ChatRequest {
    ChatRequest {
        model: "qwen2.5-coder".to_string(),
        messages: vec![ChatMessage::system("You are helpful."), ChatMessage::user("list files")],
        tools: vec![ToolDefinition::new(
            "list_directory",
            "List a directory",
            json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        )],
        parameters: None,
    }
}

#[tokio::test]
async fn test_ollama_streams_chunks_and_tool_calls() {
    let mut server = mockito::Server::new_async().await;
    let body = concat!(
        r#"{"model":"qwen2.5-coder","message":{"role":"assistant","content":"Hel"},"done":false}"#,
        "\n",
        r#"{"model":"qwen2.5-coder","message":{"role":"assistant","content":"lo","tool_calls":[{"function":{"name":"list_directory","arguments":{"path":"."}}}]},"done":false}"#,
        "\n",
        r#"{"model":"qwen2.5-coder","message":{"role":"assistant","content":""},"done":true}"#,
        "\n",
    );
    let mock = server
        .mock("POST", "/api/chat")
        .match_body(mockito::Matcher::PartialJson(json!({"stream": true, "model": "qwen2.5-coder"})))
        .with_status(200)
        .with_header("content-type", "application/x-ndjson")
        .with_body(body)
        .create_async()
        .await;

    let model = OllamaModel::with_base_url("qwen2.5-coder", server.url());
    let stream = model.stream_chat(chat_request()).await.unwrap();
    let chunks: Vec<_> = stream.collect().await;

    mock.assert_async().await;
    assert_eq!(chunks.len(), 3);
    let chunks: Vec<_> = chunks.into_iter().map(Result::unwrap).collect();
    assert_eq!(chunks[0].content, "Hel");
    assert_eq!(chunks[1].content, "lo");
    assert_eq!(chunks[1].tool_calls.len(), 1);
    assert_eq!(chunks[1].tool_calls[0].name, "list_directory");
    assert!(chunks[2].done);
}

#[tokio::test]
async fn test_ollama_model_not_found() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/chat")
        .with_status(404)
        .with_body(r#"{"error":"model \"qwen2.5-coder\" not found, try pulling it first"}"#)
        .create_async()
        .await;

    let model = OllamaModel::with_base_url("qwen2.5-coder", server.url());
    let result = model.stream_chat(chat_request()).await;

    match result {
        Err(ModelError::ModelResponseError(msg)) => assert!(msg.contains("ollama pull")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected an error"),
    }
}

#[tokio::test]
async fn test_ollama_stream_error_line() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body("{\"message\":{\"role\":\"assistant\",\"content\":\"par\"},\"done\":false}\n{\"error\":\"runner crashed\"}\n")
        .create_async()
        .await;

    let model = OllamaModel::with_base_url("qwen2.5-coder", server.url());
    let chunks: Vec<_> = model.stream_chat(chat_request()).await.unwrap().collect().await;

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].as_ref().unwrap().content, "par");
    assert_eq!(
        chunks[1].as_ref().unwrap_err(),
        &ModelError::ModelResponseError("runner crashed".to_string())
    );
}
