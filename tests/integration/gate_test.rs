use super::common;

use common::test_server::{expired_token_for, token_for, TestServer};
use common::ws_client::{Credentials, WsClient};

#[tokio::test]
async fn test_missing_token_is_unauthenticated() {
    let server = TestServer::new().await;
    let mut client = WsClient::connect(&server.ws_url("p1"), Credentials::None).await;

    let (code, reason) = client.expect_close().await;
    assert_eq!(code, 4001);
    assert_eq!(reason, "UNAUTHENTICATED");
}

#[tokio::test]
async fn test_bad_tokens_are_unauthenticated() {
    let server = TestServer::new().await;

    let expired = expired_token_for("alice");
    let mut client = WsClient::connect(&server.ws_url("p1"), Credentials::Query(&expired)).await;
    assert_eq!(client.expect_close().await.0, 4001);

    let mut client =
        WsClient::connect(&server.ws_url("p1"), Credentials::Header("not-a-jwt")).await;
    assert_eq!(client.expect_close().await.0, 4001);
}

#[tokio::test]
async fn test_foreign_project_is_forbidden() {
    let server = TestServer::new().await;
    let token = token_for("alice");
    let mut client = WsClient::connect(&server.ws_url("p2"), Credentials::Query(&token)).await;

    let (code, reason) = client.expect_close().await;
    assert_eq!(code, 4003);
    assert_eq!(reason, "FORBIDDEN");
}

#[tokio::test]
async fn test_unknown_project_is_not_found() {
    let server = TestServer::new().await;
    let token = token_for("alice");
    let mut client =
        WsClient::connect(&server.ws_url("nope"), Credentials::Query(&token)).await;

    let (code, reason) = client.expect_close().await;
    assert_eq!(code, 4004);
    assert_eq!(reason, "NOT_FOUND");
}

#[tokio::test]
async fn test_every_token_location_is_accepted() {
    let server = TestServer::new().await;
    let token = token_for("alice");

    for credentials in [
        Credentials::Query(&token),
        Credentials::Header(&token),
        Credentials::Subprotocol(&token),
    ] {
        let mut client = WsClient::connect(&server.ws_url("p1"), credentials).await;
        let connected = client.next_event().await;
        assert_eq!(connected["type"], "connected");
        assert_eq!(connected["seq"], 1);
        assert_eq!(connected["project_id"], "p1");
        assert!(connected["session_id"].is_string());
        client.close().await;
    }
}

#[tokio::test]
async fn test_rejections_are_counted() {
    let server = TestServer::new().await;
    let mut client = WsClient::connect(&server.ws_url("p1"), Credentials::None).await;
    client.expect_close().await;

    let body = reqwest::get(server.url("/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("stratum_connections_rejected_total{reason=\"UNAUTHENTICATED\"} 1"));
}
