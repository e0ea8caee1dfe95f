//! Consolidated initial schema migration

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. Create users table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(uuid(Users::Id).primary_key())
                    .col(string_len(Users::Username, 64).not_null().unique_key())
                    .col(string_len_null(Users::Email, 255))
                    .col(string_len(Users::PasswordHash, 255).not_null())
                    .col(string_len(Users::ApiKey, 128).not_null().unique_key())
                    .col(string_len(Users::Status, 16).not_null().default("active"))
                    .col(
                        timestamp_with_time_zone(Users::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Users::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_users_api_key")
                    .table(Users::Table)
                    .col(Users::ApiKey)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. Create agents table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Agents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Agents::Id)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(uuid(Agents::UserId).not_null())
                    .col(string_len(Agents::Name, 255).not_null())
                    .col(string_len(Agents::Type, 16).not_null())
                    .col(string_len(Agents::Status, 16).not_null().default("offline"))
                    .col(string_len(Agents::IpAddress, 45).not_null())
                    .col(string_len_null(Agents::PublicIp, 45))
                    .col(timestamp_with_time_zone_null(Agents::LastHeartbeat))
                    .col(integer_null(Agents::BandwidthLimit))
                    .col(text(Agents::Metadata).not_null())
                    .col(
                        timestamp_with_time_zone(Agents::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Agents::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_agents_user_id")
                            .from(Agents::Table, Agents::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_agents_user_id")
                    .table(Agents::Table)
                    .col(Agents::UserId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. Create sessions table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Sessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Sessions::Id)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(string_len(Sessions::AgentId, 64).not_null())
                    .col(string_len(Sessions::ConnectionId, 128).not_null().unique_key())
                    .col(
                        timestamp_with_time_zone(Sessions::ConnectedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Sessions::LastActivity)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(big_integer(Sessions::BytesSent).not_null().default(0))
                    .col(big_integer(Sessions::BytesReceived).not_null().default(0))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sessions_agent_id")
                            .from(Sessions::Table, Sessions::AgentId)
                            .to(Agents::Table, Agents::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_agent_id")
                    .table(Sessions::Table)
                    .col(Sessions::AgentId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. Create routing_rules table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(RoutingRules::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RoutingRules::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string_len(RoutingRules::AgentId, 64).not_null())
                    .col(string_len(RoutingRules::Action, 16).not_null())
                    .col(string_len(RoutingRules::Destination, 64).not_null())
                    .col(string_len_null(RoutingRules::GatewayId, 64))
                    .col(integer(RoutingRules::Priority).not_null().default(100))
                    .col(boolean(RoutingRules::Enabled).not_null().default(true))
                    .col(
                        timestamp_with_time_zone(RoutingRules::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(RoutingRules::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_routing_rules_agent_id")
                            .from(RoutingRules::Table, RoutingRules::AgentId)
                            .to(Agents::Table, Agents::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_routing_rules_gateway_id")
                            .from(RoutingRules::Table, RoutingRules::GatewayId)
                            .to(Agents::Table, Agents::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_routing_rules_agent_id")
                    .table(RoutingRules::Table)
                    .col(RoutingRules::AgentId)
                    .col(RoutingRules::Enabled)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 5. Create audit_logs table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(AuditLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuditLogs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(uuid_null(AuditLogs::UserId))
                    .col(string_len_null(AuditLogs::AgentId, 64))
                    .col(string_len(AuditLogs::Action, 64).not_null())
                    .col(string_len(AuditLogs::ResourceType, 32).not_null())
                    .col(string_len(AuditLogs::ResourceId, 128).not_null())
                    .col(string_len(AuditLogs::IpAddress, 64).not_null())
                    .col(string_len(AuditLogs::Status, 16).not_null())
                    .col(text_null(AuditLogs::Details))
                    .col(
                        timestamp_with_time_zone(AuditLogs::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_audit_logs_agent_id")
                    .table(AuditLogs::Table)
                    .col(AuditLogs::AgentId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AuditLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RoutingRules::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Sessions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Agents::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
    Username,
    Email,
    PasswordHash,
    ApiKey,
    Status,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Agents {
    Table,
    Id,
    UserId,
    Name,
    Type,
    Status,
    IpAddress,
    PublicIp,
    LastHeartbeat,
    BandwidthLimit,
    Metadata,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Sessions {
    Table,
    Id,
    AgentId,
    ConnectionId,
    ConnectedAt,
    LastActivity,
    BytesSent,
    BytesReceived,
}

#[derive(DeriveIden)]
enum RoutingRules {
    Table,
    Id,
    AgentId,
    Action,
    Destination,
    GatewayId,
    Priority,
    Enabled,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum AuditLogs {
    Table,
    Id,
    UserId,
    AgentId,
    Action,
    ResourceType,
    ResourceId,
    IpAddress,
    Status,
    Details,
    CreatedAt,
}
