//! Agent entity: durable record for a registered client or gateway
//!
//! Created on first successful registration and updated on every
//! reconnect; never deleted by the coordinator itself. `ip_address` is the
//! sticky overlay allocation that survives restarts.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Role the agent declared at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum AgentRole {
    #[sea_orm(string_value = "client")]
    Client,

    #[sea_orm(string_value = "gateway")]
    Gateway,
}

/// Connection state as last observed by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum AgentState {
    #[sea_orm(string_value = "online")]
    Online,

    #[sea_orm(string_value = "offline")]
    Offline,

    #[sea_orm(string_value = "error")]
    Error,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "agents")]
pub struct Model {
    /// Agent-supplied identifier, typically a UUID string
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub user_id: Uuid,

    pub name: String,

    #[sea_orm(column_name = "type")]
    pub role: AgentRole,

    pub status: AgentState,

    /// Assigned overlay IP, stable across reconnects
    pub ip_address: String,

    pub public_ip: Option<String>,

    pub last_heartbeat: Option<ChronoDateTimeUtc>,

    /// KB/s, null or 0 for unlimited
    pub bandwidth_limit: Option<i32>,

    /// JSON document: os/arch/version/hostname
    pub metadata: String,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,

    #[sea_orm(has_many = "super::session::Entity")]
    Sessions,

    #[sea_orm(has_many = "super::routing_rule::Entity")]
    RoutingRules,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Sessions.def()
    }
}

impl Related<super::routing_rule::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RoutingRules.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
