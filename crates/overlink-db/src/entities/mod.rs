//! Database entities

pub mod agent;
pub mod audit_log;
pub mod routing_rule;
pub mod session;
pub mod user;

pub use agent::Entity as Agent;
pub use audit_log::Entity as AuditLog;
pub use routing_rule::Entity as RoutingRule;
pub use session::Entity as Session;
pub use user::Entity as User;

pub mod prelude {
    pub use super::agent::Entity as Agent;
    pub use super::audit_log::Entity as AuditLog;
    pub use super::routing_rule::Entity as RoutingRule;
    pub use super::session::Entity as Session;
    pub use super::user::Entity as User;
}
