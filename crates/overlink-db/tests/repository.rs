//! Integration tests for the repository facade
//!
//! Runs against a real SQLite in-memory database.

use chrono::Utc;
use overlink_db::entities::{agent, routing_rule, session, user};
use overlink_db::{connect, migrate, AuditEvent, NewAgent, NewSession, Repository};
use sea_orm::{ActiveModelTrait, EntityTrait, PaginatorTrait, Set};
use uuid::Uuid;

async fn setup_repo() -> Repository {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");

    migrate(&db).await.expect("Failed to run migrations");

    Repository::new(db)
}

async fn insert_user(repo: &Repository, api_key: &str, status: user::UserStatus) -> Uuid {
    let id = Uuid::new_v4();
    let now = Utc::now();
    user::ActiveModel {
        id: Set(id),
        username: Set(format!("user-{}", id)),
        email: Set(None),
        password_hash: Set("argon2id$unused".to_string()),
        api_key: Set(api_key.to_string()),
        status: Set(status),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(repo.connection())
    .await
    .expect("Failed to insert user");
    id
}

fn new_agent(id: &str, user_id: Uuid, role: agent::AgentRole, ip: &str) -> NewAgent {
    NewAgent {
        id: id.to_string(),
        user_id,
        name: format!("host-{}", id),
        role,
        ip_address: ip.to_string(),
        bandwidth_limit: None,
        metadata: "{}".to_string(),
    }
}

#[tokio::test]
async fn test_migrations_run() {
    let db = connect("sqlite::memory:").await.expect("connect");
    assert!(migrate(&db).await.is_ok());
}

#[tokio::test]
async fn test_user_by_api_key_active_only() {
    let repo = setup_repo().await;

    insert_user(&repo, "key-active", user::UserStatus::Active).await;
    insert_user(&repo, "key-suspended", user::UserStatus::Suspended).await;
    insert_user(&repo, "key-disabled", user::UserStatus::Disabled).await;

    let found = repo.user_by_api_key("key-active").await.unwrap();
    assert!(found.is_some());

    // Suspended and disabled users never authenticate
    assert!(repo.user_by_api_key("key-suspended").await.unwrap().is_none());
    assert!(repo.user_by_api_key("key-disabled").await.unwrap().is_none());
    assert!(repo.user_by_api_key("no-such-key").await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_and_fetch_agent() {
    let repo = setup_repo().await;
    let user_id = insert_user(&repo, "key-1", user::UserStatus::Active).await;

    let created = repo
        .create_agent(new_agent("agent-1", user_id, agent::AgentRole::Client, "10.200.0.2"))
        .await
        .unwrap();
    assert_eq!(created.status, agent::AgentState::Online);

    let fetched = repo.agent_by_id("agent-1").await.unwrap().unwrap();
    assert_eq!(fetched.user_id, user_id);
    assert_eq!(fetched.role, agent::AgentRole::Client);
    assert_eq!(fetched.ip_address, "10.200.0.2");

    assert!(repo.agent_by_id("agent-2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_update_agent_status_stamps_heartbeat() {
    let repo = setup_repo().await;
    let user_id = insert_user(&repo, "key-1", user::UserStatus::Active).await;
    repo.create_agent(new_agent("agent-1", user_id, agent::AgentRole::Gateway, "10.200.0.2"))
        .await
        .unwrap();

    repo.update_agent_status("agent-1", agent::AgentState::Offline)
        .await
        .unwrap();

    let fetched = repo.agent_by_id("agent-1").await.unwrap().unwrap();
    assert_eq!(fetched.status, agent::AgentState::Offline);
    assert!(fetched.last_heartbeat.is_some());
}

#[tokio::test]
async fn test_session_lifecycle() {
    let repo = setup_repo().await;
    let user_id = insert_user(&repo, "key-1", user::UserStatus::Active).await;
    repo.create_agent(new_agent("agent-1", user_id, agent::AgentRole::Client, "10.200.0.2"))
        .await
        .unwrap();

    let created = repo
        .create_session(NewSession {
            id: "sess-1".to_string(),
            agent_id: "agent-1".to_string(),
            connection_id: "quic-42".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(created.bytes_sent, 0);

    repo.update_session_stats("sess-1", 1024, 2048).await.unwrap();

    let fetched = session::Entity::find_by_id("sess-1")
        .one(repo.connection())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.bytes_sent, 1024);
    assert_eq!(fetched.bytes_received, 2048);
    assert!(fetched.last_activity >= created.last_activity);

    repo.delete_session("sess-1").await.unwrap();
    assert!(session::Entity::find_by_id("sess-1")
        .one(repo.connection())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_rules_for_agent_sorted_and_enabled_only() {
    let repo = setup_repo().await;
    let user_id = insert_user(&repo, "key-1", user::UserStatus::Active).await;
    repo.create_agent(new_agent("agent-1", user_id, agent::AgentRole::Client, "10.200.0.2"))
        .await
        .unwrap();

    let now = Utc::now();
    for (destination, priority, enabled) in [
        ("10.0.0.0/8", 50, true),
        ("192.168.1.0/24", 10, true),
        ("172.16.0.0/12", 5, false),
    ] {
        routing_rule::ActiveModel {
            agent_id: Set("agent-1".to_string()),
            action: Set("forward".to_string()),
            destination: Set(destination.to_string()),
            gateway_id: Set(None),
            priority: Set(priority),
            enabled: Set(enabled),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(repo.connection())
        .await
        .unwrap();
    }

    let rules = repo.rules_for_agent("agent-1").await.unwrap();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].priority, 10);
    assert_eq!(rules[0].destination, "192.168.1.0/24");
    assert_eq!(rules[1].priority, 50);
    assert!(rules.iter().all(|r| r.enabled));
}

#[tokio::test]
async fn test_agents_with_address_for_pool_rebuild() {
    let repo = setup_repo().await;
    let user_id = insert_user(&repo, "key-1", user::UserStatus::Active).await;

    repo.create_agent(new_agent("agent-1", user_id, agent::AgentRole::Client, "10.200.0.2"))
        .await
        .unwrap();
    repo.create_agent(new_agent("agent-2", user_id, agent::AgentRole::Gateway, "10.200.0.3"))
        .await
        .unwrap();

    let agents = repo.agents_with_address().await.unwrap();
    assert_eq!(agents.len(), 2);
}

#[tokio::test]
async fn test_record_audit() {
    let repo = setup_repo().await;

    repo.record_audit(AuditEvent {
        user_id: None,
        agent_id: Some("agent-1".to_string()),
        action: "agent.register".to_string(),
        resource_type: "agent".to_string(),
        resource_id: "agent-1".to_string(),
        ip_address: "203.0.113.9:51000".to_string(),
        success: false,
        details: Some(r#"{"reason":"unauthenticated"}"#.to_string()),
    })
    .await
    .unwrap();

    let count = overlink_db::entities::AuditLog::find()
        .count(repo.connection())
        .await
        .unwrap();
    assert_eq!(count, 1);
}
