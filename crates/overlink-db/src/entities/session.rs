//! Session entity: one row per live agent connection

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    /// Freshly minted UUID string
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub agent_id: String,

    /// Transport connection identifier, for correlating logs
    #[sea_orm(unique)]
    pub connection_id: String,

    pub connected_at: ChronoDateTimeUtc,
    pub last_activity: ChronoDateTimeUtc,

    pub bytes_sent: i64,
    pub bytes_received: i64,
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
