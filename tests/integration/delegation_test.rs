use super::common;

use serde_json::json;
use stratum::agents::domain::{AgentRole, AgentStatus, MessageType};
use stratum::domain::InstancePort;

use common::test_server::{token_for, TestServer};
use common::upstream::Script;
use common::ws_client::{Credentials, WsClient};

#[tokio::test]
async fn test_delegate_then_follow_up_completes_task() {
    let server = TestServer::with_database().await;
    server
        .upstream
        .push(Script::events([
            json!({"type": "tool_call", "id": "c1", "name": "delegate",
                   "arguments": {"role": "backend_lead", "task": "build the API"}}),
            json!({"type": "content", "content": "Handed to the backend lead."}),
            json!({"type": "done"}),
        ]))
        .await;
    server
        .upstream
        .push(Script::events([
            json!({"type": "tool_call", "name": "complete_task",
                   "arguments": "{\"summary\": \"API ready\"}"}),
            json!({"type": "done"}),
        ]))
        .await;

    let token = token_for("alice");
    let mut client = WsClient::connect(&server.ws_url("p1"), Credentials::Subprotocol(&token)).await;
    client.next_of_type("connected").await;

    // Turn 1: the orchestrator delegates
    client
        .send(json!({"type": "user_message", "content": "build a service"}))
        .await;
    let tool_call = client.next_of_type("tool_call").await;
    assert_eq!(tool_call["name"], "delegate");
    let accepted = client.next_event().await;
    assert_eq!(accepted["update"]["kind"], "delegation_accepted");
    assert_eq!(accepted["update"]["to"], "backend_lead");
    let task_message_id = accepted["update"]["message_id"].as_str().unwrap().to_string();

    let waiting = client.next_of_type("status").await;
    assert_eq!(waiting["update"]["status"], "waiting_input");
    client.next_of_type("done").await;

    // Turn 2: the follow-up goes to the lead holding the task
    client
        .send(json!({"type": "user_message", "content": "status?"}))
        .await;
    let working = client.next_event().await;
    assert_eq!(working["agent"], "backend_lead");
    client.next_of_type("tool_call").await;
    let completed = client.next_event().await;
    assert_eq!(completed["update"]["kind"], "task_completed");
    assert_eq!(completed["update"]["to"], "orchestrator");
    assert_eq!(completed["update"]["message_id"], task_message_id.as_str());
    client.next_of_type("done").await;

    let store = server.ctx.store.as_ref().unwrap();
    let instances = store.instances().list("p1").await.unwrap();
    let orchestrator = instances
        .iter()
        .find(|i| i.role == AgentRole::Orchestrator)
        .unwrap();
    assert_eq!(orchestrator.status, AgentStatus::Idle);
    assert!(orchestrator.working_memory.awaiting.is_empty());
    let lead = instances
        .iter()
        .find(|i| i.role == AgentRole::BackendLead)
        .unwrap();
    assert!(lead.working_memory.open_task.is_none());

    let messages = store.records().messages_for_project("p1").await.unwrap();
    let assignment = messages
        .iter()
        .find(|m| m.message_type == MessageType::TaskAssignment)
        .unwrap();
    assert_eq!(assignment.id, task_message_id);
    assert!(assignment.responded());
}

#[tokio::test]
async fn test_hiring_outside_the_hierarchy_is_rejected() {
    let server = TestServer::new().await;
    server
        .upstream
        .push(Script::events([
            json!({"type": "tool_call", "name": "delegate",
                   "arguments": {"role": "qa_engineer", "task": "test everything"}}),
            json!({"type": "tool_call", "name": "write_file", "arguments": {"path": "main.rs"}}),
            json!({"type": "done"}),
        ]))
        .await;

    let token = token_for("alice");
    let mut client = WsClient::connect(&server.ws_url("p1"), Credentials::Query(&token)).await;
    client.next_of_type("connected").await;

    client
        .send(json!({"type": "user_message", "content": "get it tested"}))
        .await;

    client.next_of_type("tool_call").await;
    let rejected = client.next_event().await;
    assert_eq!(rejected["update"]["kind"], "delegation_rejected");
    assert_eq!(rejected["update"]["code"], "DELEGATION_REJECTED");

    client.next_of_type("tool_call").await;
    let denied = client.next_event().await;
    assert_eq!(denied["update"]["kind"], "tool_rejected");
    assert_eq!(denied["update"]["code"], "CAPABILITY_DENIED");

    assert_eq!(client.next_of_type("done").await["cancelled"], false);

    let instances = server.ctx.services.router.instances().list("p1").await.unwrap();
    assert!(instances.iter().all(|i| i.role != AgentRole::QaEngineer));
}
