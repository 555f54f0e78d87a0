//! End-to-end chat flow tests
//!
//! Wires `ChatService` to in-memory SQLite and an `OpenRouterClient` pointed
//! at a wiremock server.

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use branching_chat::config::{ChatConfig, LlmConfig, RequestConfig};
use branching_chat::storage::{ChatRepository, UserRepository};
use branching_chat::{
    ChatService, ErrorKind, Message, OpenRouterClient, Role, SqliteStorage, User,
};

type Service = ChatService<SqliteStorage, OpenRouterClient>;

async fn mock_llm(content: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "gen-flow",
            "provider": "Anthropic",
            "model": "anthropic/claude-3-haiku",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}
        })))
        .mount(&server)
        .await;
    server
}

async fn create_service(base_url: &str) -> (Service, User) {
    let storage = SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage");
    let user = User::new("alice", "alice@example.com");
    storage.create_user(&user).await.unwrap();

    let client = OpenRouterClient::new(
        &LlmConfig {
            api_key: Some("test-api-key".to_string()),
            base_url: base_url.to_string(),
        },
        RequestConfig {
            timeout_ms: 2000,
            max_retries: 0,
            retry_delay_ms: 10,
        },
    )
    .unwrap();

    (
        ChatService::new(storage, client, ChatConfig::default()),
        user,
    )
}

#[tokio::test]
async fn test_branching_conversation_scenario() {
    let server = mock_llm("Sure.").await;
    let (service, alice) = create_service(&server.uri()).await;
    let options = service.default_send_options();

    let mut tree = service.start_chat(&alice, None).await.unwrap();
    let root_id = tree.root().unwrap().message().id().to_string();

    let first = service
        .send_message(&alice, &mut tree, None, "Hi", &options)
        .await
        .unwrap();
    let second = service
        .send_message(&alice, &mut tree, Some(first.id()), "Tell me more", &options)
        .await
        .unwrap();
    // Branch off the root with an alternative opening
    let alternative = service
        .send_message(&alice, &mut tree, Some(&root_id), "Hello instead", &options)
        .await
        .unwrap();

    assert_eq!(tree.len(), 7);
    assert_eq!(tree.root().unwrap().children().count(), 2);
    assert_eq!(tree.get_path_to_root(second.id()).unwrap().len(), 5);
    assert_eq!(tree.get_path_to_root(alternative.id()).unwrap().len(), 3);

    // The persisted tree matches the in-memory one
    let tree_id = tree.id().unwrap().to_string();
    let resumed = service.resume_chat(&alice, &tree_id).await.unwrap();
    assert_eq!(resumed.len(), 7);
    let roles: Vec<Role> = resumed
        .get_path_to_root(second.id())
        .unwrap()
        .iter()
        .map(Message::role)
        .collect();
    assert_eq!(
        roles,
        vec![
            Role::System,
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant
        ]
    );

    let detail = service
        .repository()
        .get_assistant_detail(second.id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detail.total_tokens, 11);
    assert_eq!(detail.model_name.as_deref(), Some("anthropic/claude-3-haiku"));
}

#[tokio::test]
async fn test_other_user_sees_not_found() {
    let server = mock_llm("Sure.").await;
    let (service, alice) = create_service(&server.uri()).await;
    let tree = service.start_chat(&alice, None).await.unwrap();
    let tree_id = tree.id().unwrap().to_string();

    let bob = User::new("bob", "bob@example.com");
    let options = service.default_send_options();

    let err = service
        .send_to_chat(&bob, &tree_id, None, "Hi", &options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.public_message(), "Chat not found");

    let err = service.chat_view(&bob, &tree_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(service.list_chats(&bob).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disabled_owner_loses_access() {
    let server = mock_llm("Sure.").await;
    let (service, alice) = create_service(&server.uri()).await;
    let tree = service.start_chat(&alice, None).await.unwrap();
    let tree_id = tree.id().unwrap().to_string();

    service
        .repository()
        .set_user_active(&alice.id, false)
        .await
        .unwrap();
    let alice = service.repository().get_user(&alice.id).await.unwrap().unwrap();

    let err = service.resume_chat(&alice, &tree_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_llm_failure_leaves_chat_awaiting_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let (service, alice) = create_service(&server.uri()).await;
    let tree = service.start_chat(&alice, None).await.unwrap();
    let tree_id = tree.id().unwrap().to_string();
    let options = service.default_send_options();

    let err = service
        .send_to_chat(&alice, &tree_id, None, "Hi", &options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);

    let view = service.chat_view(&alice, &tree_id).await.unwrap();
    assert_eq!(view.children.len(), 1);
    assert_eq!(view.children[0].role, Role::User);
    assert_eq!(view.children[0].content, "Hi");
    assert!(view.children[0].children.is_empty());

    // Retrying under the same parent adds a sibling attempt
    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "Back!"}}]
        })))
        .mount(&server)
        .await;

    let root_id = view.id.clone();
    let exchange = service
        .send_to_chat(&alice, &tree_id, Some(&root_id), "Hi", &options)
        .await
        .unwrap();
    assert_eq!(exchange.assistant_message.content(), "Back!");
    let resumed = service.resume_chat(&alice, &tree_id).await.unwrap();
    assert_eq!(resumed.root().unwrap().children().count(), 2);
}

#[tokio::test]
async fn test_corrupt_tree_is_reported() {
    let server = mock_llm("Sure.").await;
    let (service, alice) = create_service(&server.uri()).await;
    let tree = service.start_chat(&alice, None).await.unwrap();
    let tree_id = tree.id().unwrap().to_string();

    // A second parentless row makes the stored tree ambiguous
    service
        .repository()
        .save_message(&Message::system("stray"), None, &tree_id, &alice.id)
        .await
        .unwrap();

    let err = service.resume_chat(&alice, &tree_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptTree);
}

#[tokio::test]
async fn test_unknown_tree_is_not_found() {
    let server = mock_llm("Sure.").await;
    let (service, alice) = create_service(&server.uri()).await;

    let err = service.resume_chat(&alice, "missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
