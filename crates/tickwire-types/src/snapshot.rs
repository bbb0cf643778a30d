//! World state snapshot pushed by the simulation once per tick.
//!
//! A [`WorldSnapshot`] is a full point-in-time view of the simulation as the
//! client observes it. The client treats it as opaque apart from the handful
//! of typed fields read by the stall, tick-freeze, and state-delta logic.
//! Anything else the simulation sends is preserved in [`WorldSnapshot::extra`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;

/// Full simulation state observed at one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct WorldSnapshot {
    /// Simulation tick this snapshot was taken at.
    pub tick: u64,
    /// The controlled player, absent before login completes.
    #[serde(default)]
    pub player: Option<PlayerState>,
    /// Skill levels and experience.
    #[serde(default)]
    pub skills: Vec<SkillState>,
    /// Inventory stacks, one entry per occupied slot.
    #[serde(default)]
    pub inventory: Vec<ItemStack>,
    /// Worn equipment, one entry per occupied slot.
    #[serde(default)]
    pub equipment: Vec<EquippedItem>,
    /// NPCs currently visible to the player.
    #[serde(default)]
    pub npcs: Vec<NpcState>,
    /// Whether a dialog is open and waiting for input.
    #[serde(default)]
    pub dialog_open: bool,
    /// Name of the open interface (bank, shop, ...), if any.
    #[serde(default)]
    pub open_interface: Option<String>,
    /// Recent game messages, oldest first.
    #[serde(default)]
    pub messages: Vec<GameMessage>,
    /// Fields this client does not interpret.
    #[serde(flatten)]
    #[ts(skip)]
    pub extra: Map<String, Value>,
}

impl WorldSnapshot {
    /// Create an empty snapshot at the given tick.
    pub fn at_tick(tick: u64) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    /// Player position, if the player is present.
    pub fn position(&self) -> Option<Position> {
        self.player.as_ref().map(|p| p.position)
    }

    /// Player hitpoints, if reported.
    pub fn hitpoints(&self) -> Option<Hitpoints> {
        self.player.as_ref().and_then(|p| p.hitpoints)
    }

    /// Number of occupied inventory slots.
    pub fn inventory_size(&self) -> usize {
        self.inventory.len()
    }

    /// Inventory counts summed per item name across all slots.
    pub fn item_totals(&self) -> BTreeMap<String, u64> {
        let mut totals = BTreeMap::new();
        for stack in &self.inventory {
            let entry = totals.entry(stack.name.clone()).or_insert(0_u64);
            *entry = entry.saturating_add(stack.count);
        }
        totals
    }

    /// Look up a skill by name (case-insensitive).
    pub fn skill(&self, name: &str) -> Option<&SkillState> {
        self.skills
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }
}

/// The controlled player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct PlayerState {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Tile position.
    pub position: Position,
    /// Current and maximum hitpoints.
    #[serde(default)]
    pub hitpoints: Option<Hitpoints>,
}

/// A tile coordinate on a given plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Position {
    /// East-west tile coordinate.
    pub x: i32,
    /// North-south tile coordinate.
    pub z: i32,
    /// Plane (floor) index.
    #[serde(default)]
    pub level: i32,
}

impl Position {
    /// Create a position on the ground plane.
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z, level: 0 }
    }

    /// Euclidean tile distance ignoring the plane.
    pub fn distance_to(&self, other: &Self) -> f64 {
        let dx = f64::from(other.x) - f64::from(self.x);
        let dz = f64::from(other.z) - f64::from(self.z);
        dx.hypot(dz)
    }
}

impl core::fmt::Display for Position {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.z, self.level)
    }
}

/// Hitpoints as current/maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Hitpoints {
    /// Current hitpoints.
    pub current: u32,
    /// Maximum hitpoints.
    pub max: u32,
}

/// Level and experience of one skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct SkillState {
    /// Skill name, e.g. `woodcutting`.
    pub name: String,
    /// Current level.
    pub level: u32,
    /// Total experience.
    #[serde(default)]
    pub experience: u64,
}

/// One occupied inventory slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ItemStack {
    /// Item definition id.
    #[serde(default)]
    pub id: u32,
    /// Item name, the identity used when aggregating stacks.
    pub name: String,
    /// Stack size.
    #[serde(default = "default_count")]
    pub count: u64,
}

const fn default_count() -> u64 {
    1
}

/// One occupied equipment slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct EquippedItem {
    /// Slot name, e.g. `weapon`.
    pub slot: String,
    /// Item definition id.
    #[serde(default)]
    pub id: u32,
    /// Item name.
    pub name: String,
}

/// A visible NPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct NpcState {
    /// Server-side index, stable while the NPC stays loaded.
    pub index: u32,
    /// NPC name.
    pub name: String,
    /// Remaining health as a percentage, when the health bar is visible.
    #[serde(default)]
    pub health_percent: Option<u8>,
    /// Whether the NPC is currently engaged in combat.
    #[serde(default)]
    pub in_combat: bool,
}

/// A line from the in-game message box.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct GameMessage {
    /// Tick the message was received at.
    #[serde(default)]
    pub tick: u64,
    /// Message text.
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_snapshot() {
        let snapshot: Result<WorldSnapshot, _> = serde_json::from_str(r#"{"tick": 7}"#);
        assert!(snapshot.is_ok());
        let snapshot = snapshot.unwrap_or_default();
        assert_eq!(snapshot.tick, 7);
        assert!(snapshot.player.is_none());
        assert!(snapshot.position().is_none());
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let json = r#"{"tick": 1, "weather": "rain", "dialogOpen": true}"#;
        let snapshot: WorldSnapshot = serde_json::from_str(json).unwrap_or_default();
        assert!(snapshot.dialog_open);
        assert_eq!(
            snapshot.extra.get("weather"),
            Some(&Value::String("rain".to_owned()))
        );
    }

    #[test]
    fn item_totals_aggregate_stacks_by_name() {
        let mut snapshot = WorldSnapshot::at_tick(1);
        for _ in 0..3 {
            snapshot.inventory.push(ItemStack {
                id: 1511,
                name: "logs".to_owned(),
                count: 1,
            });
        }
        snapshot.inventory.push(ItemStack {
            id: 995,
            name: "coins".to_owned(),
            count: 250,
        });

        let totals = snapshot.item_totals();
        assert_eq!(totals.get("logs"), Some(&3));
        assert_eq!(totals.get("coins"), Some(&250));
        assert_eq!(snapshot.inventory_size(), 4);
    }

    #[test]
    fn item_count_defaults_to_one() {
        let stack: Result<ItemStack, _> = serde_json::from_str(r#"{"name": "bones"}"#);
        assert_eq!(stack.map(|s| s.count).ok(), Some(1));
    }

    #[test]
    fn distance_is_euclidean() {
        let a = Position::new(0, 0);
        let b = Position::new(3, 4);
        assert!((a.distance_to(&b) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn skill_lookup_ignores_case() {
        let mut snapshot = WorldSnapshot::at_tick(1);
        snapshot.skills.push(SkillState {
            name: "Fishing".to_owned(),
            level: 12,
            experience: 1_600,
        });
        assert_eq!(snapshot.skill("fishing").map(|s| s.level), Some(12));
    }
}
