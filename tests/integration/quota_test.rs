use super::common;

use serde_json::json;
use stratum::domain::UsagePort;

use common::test_server::{token_for, TestServer};
use common::ws_client::{Credentials, WsClient};

async fn connect(server: &TestServer, user_id: &str, project_id: &str) -> WsClient {
    let token = token_for(user_id);
    let mut client = WsClient::connect(&server.ws_url(project_id), Credentials::Header(&token)).await;
    assert_eq!(client.next_event().await["type"], "connected");
    client
}

#[tokio::test]
async fn test_daily_action_limit_blocks_before_upstream() {
    let server = TestServer::new().await;
    let mut client = connect(&server, "carol", "p3").await;

    client
        .send(json!({"type": "user_message", "content": "first"}))
        .await;
    client.next_of_type("done").await;

    client
        .send(json!({"type": "user_message", "content": "second"}))
        .await;
    let error = client.next_event().await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "SUBSCRIPTION_LIMIT");

    assert_eq!(server.upstream.requests().await.len(), 1);
}

#[tokio::test]
async fn test_limit_is_shared_across_connections() {
    let server = TestServer::with_database().await;

    let mut first = connect(&server, "carol", "p3").await;
    first
        .send(json!({"type": "user_message", "content": "hello"}))
        .await;
    first.next_of_type("done").await;
    first.close().await;

    let mut second = connect(&server, "carol", "p3").await;
    second
        .send(json!({"type": "user_message", "content": "hello again"}))
        .await;
    assert_eq!(second.next_event().await["code"], "SUBSCRIPTION_LIMIT");
}

#[tokio::test]
async fn test_repeated_message_id_is_counted_once() {
    let server = TestServer::with_database().await;
    let mut client = connect(&server, "alice", "p1").await;

    client
        .send(json!({"type": "user_message", "content": "hi", "message_id": "m-1"}))
        .await;
    client.next_of_type("done").await;

    client
        .send(json!({"type": "user_message", "content": "hi", "message_id": "m-1"}))
        .await;
    assert_eq!(client.next_event().await["code"], "DUPLICATE_MESSAGE");

    let usage = server
        .ctx
        .services
        .quota
        .admit("alice", "m-2")
        .await
        .unwrap()
        .usage;
    assert_eq!(usage.action_count, 2);
    assert_eq!(server.upstream.requests().await.len(), 1);
}

#[tokio::test]
async fn test_reported_tokens_are_recorded() {
    let server = TestServer::with_database().await;
    let mut client = connect(&server, "alice", "p1").await;

    client
        .send(json!({"type": "user_message", "content": "hi"}))
        .await;
    client.next_of_type("done").await;

    let store = server.ctx.store.as_ref().unwrap();
    let today = stratum::quota::current_period();
    let usage = store.usage().usage("alice", today).await.unwrap();
    assert_eq!(usage.action_count, 1);
    assert_eq!(usage.token_count, 15);
}
