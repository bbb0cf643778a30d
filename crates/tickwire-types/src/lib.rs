//! Shared type definitions for the Tickwire workspace.
//!
//! This crate is the single source of truth for everything that crosses the
//! session socket or is shared between the client and the harness. Types
//! defined here flow downstream to `TypeScript` via `ts-rs` so the simulation
//! side can consume the same message shapes.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for session, correlation, and run ids
//! - [`wire`] -- Client and server messages, and the [`Action`] payload
//! - [`snapshot`] -- The per-tick [`WorldSnapshot`] and its typed parts
//! - [`connection`] -- Connection lifecycle states

pub mod connection;
pub mod ids;
pub mod snapshot;
pub mod wire;

// Re-export all public types at crate root for convenience.
pub use connection::{ConnectionState, ConnectionStatus};
pub use ids::{CorrelationId, RunId, SessionId};
pub use snapshot::{
    EquippedItem, GameMessage, Hitpoints, ItemStack, NpcState, PlayerState, Position, SkillState,
    WorldSnapshot,
};
pub use wire::{Action, ClientMessage, ServerMessage};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation.

    #[test]
    fn export_bindings() {
        // ts-rs generates TypeScript bindings when types with
        // #[ts(export)] are exported. The files are written to the
        // `bindings/` directory relative to the crate root.
        use ts_rs::TS;

        // IDs
        let _ = crate::ids::SessionId::export_all();
        let _ = crate::ids::CorrelationId::export_all();
        let _ = crate::ids::RunId::export_all();

        // Connection
        let _ = crate::connection::ConnectionState::export_all();
        let _ = crate::connection::ConnectionStatus::export_all();

        // Snapshot
        let _ = crate::snapshot::WorldSnapshot::export_all();
        let _ = crate::snapshot::PlayerState::export_all();
        let _ = crate::snapshot::Position::export_all();
        let _ = crate::snapshot::Hitpoints::export_all();
        let _ = crate::snapshot::SkillState::export_all();
        let _ = crate::snapshot::ItemStack::export_all();
        let _ = crate::snapshot::EquippedItem::export_all();
        let _ = crate::snapshot::NpcState::export_all();
        let _ = crate::snapshot::GameMessage::export_all();

        // Wire
        let _ = crate::wire::Action::export_all();
        let _ = crate::wire::ClientMessage::export_all();
        let _ = crate::wire::ServerMessage::export_all();
    }
}
