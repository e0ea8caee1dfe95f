//! Audit log entity: append-only record of control-plane actions

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "audit_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub user_id: Option<Uuid>,
    pub agent_id: Option<String>,

    /// e.g. "agent.register", "session.terminate"
    pub action: String,

    pub resource_type: String,
    pub resource_id: String,

    /// Peer address the action originated from
    pub ip_address: String,

    /// "success" or "failure"
    pub status: String,

    /// JSON detail document
    pub details: Option<String>,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
