use super::common;

use axum::http::StatusCode;
use serde_json::json;

use common::test_server::{token_for, TestServer};
use common::upstream::Script;
use common::ws_client::{Credentials, WsClient};

async fn connect(server: &TestServer, user_id: &str, project_id: &str) -> WsClient {
    let token = token_for(user_id);
    let mut client = WsClient::connect(&server.ws_url(project_id), Credentials::Query(&token)).await;
    assert_eq!(client.next_event().await["type"], "connected");
    client
}

#[tokio::test]
async fn test_full_turn_streams_upstream_events_in_order() {
    let server = TestServer::new().await;
    server
        .upstream
        .push(Script::events([
            json!({"type": "thinking_start"}),
            json!({"type": "thinking", "content": "planning"}),
            json!({"type": "thinking_end"}),
            json!({"type": "content", "content": "Hel"}),
            json!({"content": "lo"}),
            json!({"type": "done", "usage": {"prompt_tokens": 10, "completion_tokens": 5}}),
        ]))
        .await;
    let mut client = connect(&server, "alice", "p1").await;

    client
        .send(json!({"type": "user_message", "content": "hi", "think": true}))
        .await;

    let working = client.next_event().await;
    assert_eq!(working["type"], "status");
    assert_eq!(working["agent"], "orchestrator");
    assert_eq!(working["update"]["status"], "working");

    let mut types = Vec::new();
    for _ in 0..5 {
        let event = client.next_event().await;
        assert_eq!(event["agent"], "orchestrator");
        types.push(event["type"].as_str().unwrap().to_string());
    }
    assert_eq!(
        types,
        vec!["thinking_start", "thinking", "thinking_end", "content", "content"]
    );

    assert_eq!(client.next_event().await["update"]["status"], "idle");
    let done = client.next_event().await;
    assert_eq!(done["type"], "done");
    assert_eq!(done["cancelled"], false);
    assert_eq!(done["usage"]["total_tokens"], 15);

    let requests = server.upstream.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["think"], true);
    assert!(requests[0]["prompt"].as_str().unwrap().contains("hi"));
}

#[tokio::test]
async fn test_noise_in_upstream_stream_is_skipped() {
    let server = TestServer::new().await;
    server
        .upstream
        .push(Script::raw([
            ": ping\n",
            "data: {\"type\": \"content\", \"content\": \"a\"}\n",
            "data: {oops}\n",
            "\n",
            "data: {\"type\": \"content\", \"con",
            "tent\": \"b\"}\n",
            "data: [1]\n",
            "data: {\"content\": \"c\"}\n",
            "data: {\"type\": \"content\", \"content\": \"trunc\n",
            "data: {\"type\": \"content\", \"content\": \"d\"}\r\n",
            "data: {\"type\": \"content\", \"content\": \"e\"}\n",
            "data: [DONE]\n",
        ]))
        .await;
    let mut client = connect(&server, "alice", "p1").await;

    client
        .send(json!({"type": "user_message", "content": "hi"}))
        .await;
    assert_eq!(client.next_event().await["update"]["status"], "working");

    let mut contents = Vec::new();
    for _ in 0..5 {
        let event = client.next_event().await;
        assert_eq!(event["type"], "content");
        contents.push(event["content"].as_str().unwrap().to_string());
    }
    assert_eq!(contents, vec!["a", "b", "c", "d", "e"]);

    assert_eq!(client.next_event().await["update"]["status"], "idle");
    let done = client.next_event().await;
    assert_eq!(done["type"], "done");
    assert_eq!(done["cancelled"], false);
}

#[tokio::test]
async fn test_cancel_mid_stream_then_continue() {
    let server = TestServer::new().await;
    server
        .upstream
        .push(Script::events([json!({"type": "content", "content": "partial"})]).hanging())
        .await;
    let mut client = connect(&server, "alice", "p1").await;

    client
        .send(json!({"type": "user_message", "content": "long task"}))
        .await;
    assert_eq!(client.next_of_type("content").await["content"], "partial");

    client.send(json!({"type": "cancel"})).await;
    let done = client.next_of_type("done").await;
    assert_eq!(done["cancelled"], true);

    // The session is ready again
    client
        .send(json!({"type": "user_message", "content": "next"}))
        .await;
    let done = client.next_of_type("done").await;
    assert_eq!(done["cancelled"], false);
    assert_eq!(server.upstream.requests().await.len(), 2);
}

#[tokio::test]
async fn test_second_message_while_executing_is_rejected() {
    let server = TestServer::new().await;
    server
        .upstream
        .push(Script::events([json!({"type": "content", "content": "working"})]).hanging())
        .await;
    let mut client = connect(&server, "alice", "p1").await;

    client
        .send(json!({"type": "user_message", "content": "first"}))
        .await;
    client.next_of_type("content").await;

    client
        .send(json!({"type": "user_message", "content": "second"}))
        .await;
    let error = client.next_of_type("error").await;
    assert_eq!(error["code"], "EXECUTION_IN_PROGRESS");

    client.send(json!({"type": "cancel"})).await;
    assert_eq!(client.next_of_type("done").await["cancelled"], true);
    assert_eq!(server.upstream.requests().await.len(), 1);
}

#[tokio::test]
async fn test_cancel_without_execution() {
    let server = TestServer::new().await;
    let mut client = connect(&server, "alice", "p1").await;

    client.send(json!({"type": "cancel"})).await;
    let error = client.next_event().await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "NO_ACTIVE_EXECUTION");
}

#[tokio::test]
async fn test_bad_frames_do_not_end_the_session() {
    let server = TestServer::new().await;
    let mut client = connect(&server, "alice", "p1").await;

    client.send_raw("not json").await;
    assert_eq!(client.next_event().await["code"], "INVALID_MESSAGE");

    client.send(json!({"type": "dance"})).await;
    assert_eq!(client.next_event().await["code"], "UNKNOWN_MESSAGE_TYPE");

    client
        .send(json!({"type": "user_message", "content": "hi", "target": "janitor"}))
        .await;
    assert_eq!(client.next_event().await["code"], "UNKNOWN_AGENT");

    client
        .send(json!({"type": "user_message", "content": "hi"}))
        .await;
    assert_eq!(client.next_of_type("done").await["cancelled"], false);
}

#[tokio::test]
async fn test_upstream_failure_ends_turn_not_session() {
    let server = TestServer::new().await;
    server
        .upstream
        .push(Script::failing(StatusCode::INTERNAL_SERVER_ERROR))
        .await;
    let mut client = connect(&server, "alice", "p1").await;

    client
        .send(json!({"type": "user_message", "content": "hi"}))
        .await;
    let error = client.next_of_type("error").await;
    assert_eq!(error["code"], "UPSTREAM_ERROR");
    assert_eq!(error["agent"], "orchestrator");

    client
        .send(json!({"type": "user_message", "content": "again"}))
        .await;
    assert_eq!(client.next_of_type("done").await["cancelled"], false);
}

#[tokio::test]
async fn test_explicit_target_reaches_that_agent() {
    let server = TestServer::new().await;
    let mut client = connect(&server, "alice", "p1").await;

    client
        .send(json!({"type": "user_message", "content": "design it", "target": "architect"}))
        .await;
    let working = client.next_event().await;
    assert_eq!(working["agent"], "architect");
    assert_eq!(client.next_of_type("done").await["agent"], "architect");
}
