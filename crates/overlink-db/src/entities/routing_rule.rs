//! Routing rule entity: client-side policy rows
//!
//! `action` is stored as one of "forward", "direct", "deny". For
//! `forward` rules `gateway_id` names a gateway agent owned by the same
//! user; the other actions carry no gateway.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "routing_rules")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub agent_id: String,

    pub action: String,

    /// Destination block in CIDR notation
    pub destination: String,

    pub gateway_id: Option<String>,

    /// Lower value wins
    pub priority: i32,

    pub enabled: bool,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::agent::Entity",
        from = "Column::AgentId",
        to = "super::agent::Column::Id"
    )]
    Agent,
}

impl Related<super::agent::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Agent.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
