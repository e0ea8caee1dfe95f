//! Narrow repository surface consumed by the coordinator
//!
//! The session router never touches sea-orm directly; everything it needs
//! from the store goes through this facade so tests can run it against
//! `sqlite::memory:` and deployments against MySQL or Postgres unchanged.

use crate::entities::{agent, audit_log, routing_rule, session, user};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use uuid::Uuid;

/// Fields for a new agent row, written on first registration.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub id: String,
    pub user_id: Uuid,
    pub name: String,
    pub role: agent::AgentRole,
    pub ip_address: String,
    pub bandwidth_limit: Option<i32>,
    /// JSON document with os/arch/version/hostname
    pub metadata: String,
}

/// Fields for a new session row, written at registration.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub agent_id: String,
    pub connection_id: String,
}

/// An audit event to append.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub user_id: Option<Uuid>,
    pub agent_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub ip_address: String,
    pub success: bool,
    pub details: Option<String>,
}

/// Stateless handle over the persistent store.
#[derive(Debug, Clone)]
pub struct Repository {
    db: DatabaseConnection,
}

impl Repository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Look up an *active* user by api key. Suspended and disabled users
    /// are invisible to registration.
    pub async fn user_by_api_key(&self, api_key: &str) -> Result<Option<user::Model>, DbErr> {
        user::Entity::find()
            .filter(user::Column::ApiKey.eq(api_key))
            .filter(user::Column::Status.eq(user::UserStatus::Active))
            .one(&self.db)
            .await
    }

    pub async fn agent_by_id(&self, agent_id: &str) -> Result<Option<agent::Model>, DbErr> {
        agent::Entity::find_by_id(agent_id).one(&self.db).await
    }

    pub async fn create_agent(&self, new: NewAgent) -> Result<agent::Model, DbErr> {
        let now = Utc::now();
        let model = agent::ActiveModel {
            id: Set(new.id),
            user_id: Set(new.user_id),
            name: Set(new.name),
            role: Set(new.role),
            status: Set(agent::AgentState::Online),
            ip_address: Set(new.ip_address),
            public_ip: Set(None),
            last_heartbeat: Set(Some(now)),
            bandwidth_limit: Set(new.bandwidth_limit),
            metadata: Set(new.metadata),
            created_at: Set(now),
            updated_at: Set(now),
        };

        model.insert(&self.db).await
    }

    /// Update an agent's status, stamping `last_heartbeat`.
    pub async fn update_agent_status(
        &self,
        agent_id: &str,
        state: agent::AgentState,
    ) -> Result<(), DbErr> {
        let now = Utc::now();
        agent::Entity::update_many()
            .set(agent::ActiveModel {
                status: Set(state),
                last_heartbeat: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(agent::Column::Id.eq(agent_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Rewrite an agent's overlay address. Only used when a persisted
    /// allocation cannot be re-adopted into the pool.
    pub async fn update_agent_address(&self, agent_id: &str, ip_address: &str) -> Result<(), DbErr> {
        agent::Entity::update_many()
            .set(agent::ActiveModel {
                ip_address: Set(ip_address.to_string()),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(agent::Column::Id.eq(agent_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Agents that hold an overlay allocation, used to rebuild the address
    /// pool at coordinator startup.
    pub async fn agents_with_address(&self) -> Result<Vec<agent::Model>, DbErr> {
        agent::Entity::find()
            .filter(agent::Column::IpAddress.ne(""))
            .all(&self.db)
            .await
    }

    pub async fn create_session(&self, new: NewSession) -> Result<session::Model, DbErr> {
        let now = Utc::now();
        let model = session::ActiveModel {
            id: Set(new.id),
            agent_id: Set(new.agent_id),
            connection_id: Set(new.connection_id),
            connected_at: Set(now),
            last_activity: Set(now),
            bytes_sent: Set(0),
            bytes_received: Set(0),
        };

        model.insert(&self.db).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), DbErr> {
        session::Entity::delete_by_id(session_id)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Update a session's traffic counters, stamping `last_activity`.
    pub async fn update_session_stats(
        &self,
        session_id: &str,
        bytes_sent: u64,
        bytes_received: u64,
    ) -> Result<(), DbErr> {
        session::Entity::update_many()
            .set(session::ActiveModel {
                bytes_sent: Set(bytes_sent as i64),
                bytes_received: Set(bytes_received as i64),
                last_activity: Set(Utc::now()),
                ..Default::default()
            })
            .filter(session::Column::Id.eq(session_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Enabled routing rules for an agent, ascending priority.
    pub async fn rules_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<routing_rule::Model>, DbErr> {
        routing_rule::Entity::find()
            .filter(routing_rule::Column::AgentId.eq(agent_id))
            .filter(routing_rule::Column::Enabled.eq(true))
            .order_by_asc(routing_rule::Column::Priority)
            .all(&self.db)
            .await
    }

    /// Append an audit row. Callers treat failures as non-fatal.
    pub async fn record_audit(&self, event: AuditEvent) -> Result<(), DbErr> {
        let model = audit_log::ActiveModel {
            user_id: Set(event.user_id),
            agent_id: Set(event.agent_id),
            action: Set(event.action),
            resource_type: Set(event.resource_type),
            resource_id: Set(event.resource_id),
            ip_address: Set(event.ip_address),
            status: Set(if event.success { "success" } else { "failure" }.to_string()),
            details: Set(event.details),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        model.insert(&self.db).await?;
        Ok(())
    }
}
