//! Structural difference between two world snapshots.
//!
//! An acknowledgement says only that the simulation received a command.
//! What a command actually did has to be read off the world: [`StateDelta`]
//! compares the snapshot taken just before an instrumented call with the one
//! just after and reports what changed in terms a routine author cares about.
//!
//! Kill detection is inferred, not observed: the snapshot carries no kill
//! event. An NPC that vanishes while nearly dead or while fighting is
//! reported as an [`InferredKill`] with `heuristic: true`. Several NPCs
//! leaving combat at once can produce false positives.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tickwire_types::{NpcState, Position, WorldSnapshot};

/// NPC health at or below this percentage counts as nearly dead.
const NEAR_DEATH_PERCENT: u8 = 10;

/// Thresholds that separate meaningful change from noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// XP gains at or below this amount are ignored.
    #[serde(default)]
    pub xp_noise_floor: u64,

    /// Minimum tile distance reported as movement. A plane change always
    /// counts.
    #[serde(default = "default_movement_threshold")]
    pub movement_threshold: f64,

    /// Messages containing any of these substrings (case-insensitive) are
    /// dropped.
    #[serde(default = "default_message_noise")]
    pub message_noise: Vec<String>,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            xp_noise_floor: 0,
            movement_threshold: default_movement_threshold(),
            message_noise: default_message_noise(),
        }
    }
}

const fn default_movement_threshold() -> f64 {
    2.0
}

fn default_message_noise() -> Vec<String> {
    vec![
        "Welcome to".to_owned(),
        "You can't reach that".to_owned(),
        "Nothing interesting happens".to_owned(),
    ]
}

/// A skill level increase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelUp {
    /// Skill name.
    pub skill: String,
    /// Level before.
    pub from: u32,
    /// Level after.
    pub to: u32,
}

/// Experience gained in one skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XpGain {
    /// Skill name.
    pub skill: String,
    /// Experience gained.
    pub gained: u64,
}

/// Net change of one item, aggregated across stacks by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemChange {
    /// Item name.
    pub name: String,
    /// Absolute change in count.
    pub count: u64,
}

/// A worn-equipment slot that changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentChange {
    /// Slot name.
    pub slot: String,
    /// Item worn before, if any.
    pub before: Option<String>,
    /// Item worn after, if any.
    pub after: Option<String>,
}

/// Player movement beyond the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    /// Position before.
    pub from: Position,
    /// Position after.
    pub to: Position,
    /// Straight-line tile distance on the ground plane.
    pub distance: f64,
}

/// A dialog or interface opening or closing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UiTransition {
    /// A dialog opened.
    DialogOpened,
    /// The dialog closed.
    DialogClosed,
    /// An interface opened.
    InterfaceOpened {
        /// Interface name.
        name: String,
    },
    /// An interface closed.
    InterfaceClosed {
        /// Interface name.
        name: String,
    },
}

/// An NPC presumed killed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferredKill {
    /// NPC name.
    pub npc: String,
    /// NPC index in the before snapshot.
    pub index: u32,
    /// Always `true`: kills are inferred, never observed.
    pub heuristic: bool,
}

/// What changed between two snapshots.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateDelta {
    /// Tick of the earlier snapshot.
    pub tick_from: u64,
    /// Tick of the later snapshot.
    pub tick_to: u64,
    /// Skills whose level increased.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub level_ups: Vec<LevelUp>,
    /// Skills whose experience rose above the noise floor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub xp_gains: Vec<XpGain>,
    /// Items whose total count rose.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items_gained: Vec<ItemChange>,
    /// Items whose total count fell.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items_lost: Vec<ItemChange>,
    /// Equipment slots that changed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub equipment_changes: Vec<EquipmentChange>,
    /// Change in current hitpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_change: Option<i64>,
    /// Movement beyond the threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movement: Option<Movement>,
    /// Dialog and interface transitions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ui_transitions: Vec<UiTransition>,
    /// New messages that are not noise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_messages: Vec<String>,
    /// NPCs presumed killed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inferred_kills: Vec<InferredKill>,
}

impl StateDelta {
    /// Compare two snapshots.
    pub fn between(before: &WorldSnapshot, after: &WorldSnapshot, config: &DeltaConfig) -> Self {
        let (level_ups, xp_gains) = skill_changes(before, after, config.xp_noise_floor);
        let (items_gained, items_lost) = item_changes(before, after);
        Self {
            tick_from: before.tick,
            tick_to: after.tick,
            level_ups,
            xp_gains,
            items_gained,
            items_lost,
            equipment_changes: equipment_changes(before, after),
            health_change: health_change(before, after),
            movement: movement(before, after, config.movement_threshold),
            ui_transitions: ui_transitions(before, after),
            new_messages: new_messages(before, after, &config.message_noise),
            inferred_kills: inferred_kills(before, after),
        }
    }

    /// Whether nothing meaningful changed.
    pub fn is_empty(&self) -> bool {
        self.level_ups.is_empty()
            && self.xp_gains.is_empty()
            && self.items_gained.is_empty()
            && self.items_lost.is_empty()
            && self.equipment_changes.is_empty()
            && self.health_change.is_none()
            && self.movement.is_none()
            && self.ui_transitions.is_empty()
            && self.new_messages.is_empty()
            && self.inferred_kills.is_empty()
    }
}

fn skill_changes(
    before: &WorldSnapshot,
    after: &WorldSnapshot,
    noise_floor: u64,
) -> (Vec<LevelUp>, Vec<XpGain>) {
    let mut level_ups = Vec::new();
    let mut xp_gains = Vec::new();
    for skill in &after.skills {
        let Some(prior) = before.skill(&skill.name) else {
            continue;
        };
        if skill.level > prior.level {
            level_ups.push(LevelUp {
                skill: skill.name.clone(),
                from: prior.level,
                to: skill.level,
            });
        }
        let gained = skill.experience.saturating_sub(prior.experience);
        if gained > noise_floor {
            xp_gains.push(XpGain {
                skill: skill.name.clone(),
                gained,
            });
        }
    }
    (level_ups, xp_gains)
}

fn item_changes(before: &WorldSnapshot, after: &WorldSnapshot) -> (Vec<ItemChange>, Vec<ItemChange>) {
    let old = before.item_totals();
    let new = after.item_totals();
    let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

    let mut gained = Vec::new();
    let mut lost = Vec::new();
    for name in names {
        let was = old.get(name).copied().unwrap_or(0);
        let now = new.get(name).copied().unwrap_or(0);
        if now > was {
            gained.push(ItemChange {
                name: name.clone(),
                count: now.saturating_sub(was),
            });
        } else if was > now {
            lost.push(ItemChange {
                name: name.clone(),
                count: was.saturating_sub(now),
            });
        }
    }
    (gained, lost)
}

fn equipment_changes(before: &WorldSnapshot, after: &WorldSnapshot) -> Vec<EquipmentChange> {
    let worn = |s: &WorldSnapshot| -> BTreeMap<String, String> {
        s.equipment
            .iter()
            .map(|e| (e.slot.clone(), e.name.clone()))
            .collect()
    };
    let old = worn(before);
    let new = worn(after);
    let slots: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    slots
        .into_iter()
        .filter_map(|slot| {
            let was = old.get(slot);
            let now = new.get(slot);
            (was != now).then(|| EquipmentChange {
                slot: slot.clone(),
                before: was.cloned(),
                after: now.cloned(),
            })
        })
        .collect()
}

fn health_change(before: &WorldSnapshot, after: &WorldSnapshot) -> Option<i64> {
    let was = i64::from(before.hitpoints()?.current);
    let now = i64::from(after.hitpoints()?.current);
    let change = now.checked_sub(was)?;
    (change != 0).then_some(change)
}

fn movement(before: &WorldSnapshot, after: &WorldSnapshot, threshold: f64) -> Option<Movement> {
    let from = before.position()?;
    let to = after.position()?;
    let distance = from.distance_to(&to);
    (from.level != to.level || distance > threshold).then_some(Movement { from, to, distance })
}

fn ui_transitions(before: &WorldSnapshot, after: &WorldSnapshot) -> Vec<UiTransition> {
    let mut transitions = Vec::new();
    match (before.dialog_open, after.dialog_open) {
        (false, true) => transitions.push(UiTransition::DialogOpened),
        (true, false) => transitions.push(UiTransition::DialogClosed),
        _ => {}
    }
    if before.open_interface != after.open_interface {
        if let Some(name) = &before.open_interface {
            transitions.push(UiTransition::InterfaceClosed { name: name.clone() });
        }
        if let Some(name) = &after.open_interface {
            transitions.push(UiTransition::InterfaceOpened { name: name.clone() });
        }
    }
    transitions
}

fn new_messages(before: &WorldSnapshot, after: &WorldSnapshot, noise: &[String]) -> Vec<String> {
    let seen: BTreeSet<(u64, &str)> = before
        .messages
        .iter()
        .map(|m| (m.tick, m.text.as_str()))
        .collect();
    let noise: Vec<String> = noise.iter().map(|n| n.to_lowercase()).collect();
    after
        .messages
        .iter()
        .filter(|m| !seen.contains(&(m.tick, m.text.as_str())))
        .filter(|m| {
            let text = m.text.to_lowercase();
            !noise.iter().any(|n| text.contains(n.as_str()))
        })
        .map(|m| m.text.clone())
        .collect()
}

fn inferred_kills(before: &WorldSnapshot, after: &WorldSnapshot) -> Vec<InferredKill> {
    let remaining: BTreeSet<u32> = after.npcs.iter().map(|n| n.index).collect();
    before
        .npcs
        .iter()
        .filter(|npc| !remaining.contains(&npc.index) && looked_dying(npc))
        .map(|npc| InferredKill {
            npc: npc.name.clone(),
            index: npc.index,
            heuristic: true,
        })
        .collect()
}

fn looked_dying(npc: &NpcState) -> bool {
    match npc.health_percent {
        Some(health) if health <= NEAR_DEATH_PERCENT => true,
        Some(health) => npc.in_combat && health < 100,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use tickwire_types::{
        EquippedItem, GameMessage, Hitpoints, ItemStack, PlayerState, SkillState,
    };

    use super::*;

    fn item(name: &str, count: u64) -> ItemStack {
        ItemStack {
            id: 0,
            name: name.to_owned(),
            count,
        }
    }

    fn npc(index: u32, health: Option<u8>, in_combat: bool) -> NpcState {
        NpcState {
            index,
            name: "Goblin".to_owned(),
            health_percent: health,
            in_combat,
        }
    }

    fn at(tick: u64, x: i32, z: i32, hp: u32) -> WorldSnapshot {
        WorldSnapshot {
            player: Some(PlayerState {
                name: "p".to_owned(),
                position: Position::new(x, z),
                hitpoints: Some(Hitpoints { current: hp, max: 10 }),
            }),
            ..WorldSnapshot::at_tick(tick)
        }
    }

    #[test]
    fn cooking_logs_into_fish_shows_both_sides() {
        let before = WorldSnapshot {
            inventory: vec![item("logs", 1), item("logs", 2)],
            ..WorldSnapshot::at_tick(1)
        };
        let after = WorldSnapshot {
            inventory: vec![item("cooked fish", 3)],
            ..WorldSnapshot::at_tick(2)
        };
        let delta = StateDelta::between(&before, &after, &DeltaConfig::default());
        assert_eq!(
            delta.items_lost,
            vec![ItemChange {
                name: "logs".to_owned(),
                count: 3
            }]
        );
        assert_eq!(
            delta.items_gained,
            vec![ItemChange {
                name: "cooked fish".to_owned(),
                count: 3
            }]
        );
    }

    #[test]
    fn identical_snapshots_produce_empty_delta() {
        let snapshot = at(5, 10, 10, 10);
        let delta = StateDelta::between(&snapshot, &snapshot, &DeltaConfig::default());
        assert!(delta.is_empty());
        assert_eq!((delta.tick_from, delta.tick_to), (5, 5));
    }

    #[test]
    fn small_steps_are_not_movement_but_plane_changes_are() {
        let config = DeltaConfig::default();
        let before = at(1, 0, 0, 10);
        let nudge = at(2, 1, 1, 10);
        assert!(StateDelta::between(&before, &nudge, &config).movement.is_none());

        let far = at(2, 5, 0, 10);
        let moved = StateDelta::between(&before, &far, &config).movement;
        assert!(moved.is_some_and(|m| (m.distance - 5.0).abs() < f64::EPSILON));

        let mut upstairs = at(2, 0, 0, 10);
        if let Some(player) = upstairs.player.as_mut() {
            player.position.level = 1;
        }
        assert!(StateDelta::between(&before, &upstairs, &config).movement.is_some());
    }

    #[test]
    fn skills_report_level_ups_and_xp_above_floor() {
        let skill = |name: &str, level, experience| SkillState {
            name: name.to_owned(),
            level,
            experience,
        };
        let before = WorldSnapshot {
            skills: vec![skill("woodcutting", 14, 2_200), skill("cooking", 3, 100)],
            ..WorldSnapshot::at_tick(1)
        };
        let after = WorldSnapshot {
            skills: vec![skill("woodcutting", 15, 2_450), skill("cooking", 3, 102)],
            ..WorldSnapshot::at_tick(2)
        };
        let config = DeltaConfig {
            xp_noise_floor: 5,
            ..DeltaConfig::default()
        };
        let delta = StateDelta::between(&before, &after, &config);
        assert_eq!(
            delta.level_ups,
            vec![LevelUp {
                skill: "woodcutting".to_owned(),
                from: 14,
                to: 15
            }]
        );
        assert_eq!(
            delta.xp_gains,
            vec![XpGain {
                skill: "woodcutting".to_owned(),
                gained: 250
            }]
        );
    }

    #[test]
    fn equipment_health_and_ui_changes() {
        let mut before = at(1, 0, 0, 10);
        before.equipment = vec![EquippedItem {
            slot: "weapon".to_owned(),
            id: 1,
            name: "bronze axe".to_owned(),
        }];
        before.open_interface = Some("bank".to_owned());

        let mut after = at(2, 0, 0, 7);
        after.equipment = vec![EquippedItem {
            slot: "weapon".to_owned(),
            id: 2,
            name: "iron axe".to_owned(),
        }];
        after.dialog_open = true;

        let delta = StateDelta::between(&before, &after, &DeltaConfig::default());
        assert_eq!(
            delta.equipment_changes,
            vec![EquipmentChange {
                slot: "weapon".to_owned(),
                before: Some("bronze axe".to_owned()),
                after: Some("iron axe".to_owned()),
            }]
        );
        assert_eq!(delta.health_change, Some(-3));
        assert_eq!(
            delta.ui_transitions,
            vec![
                UiTransition::DialogOpened,
                UiTransition::InterfaceClosed {
                    name: "bank".to_owned()
                },
            ]
        );
    }

    #[test]
    fn noise_and_already_seen_messages_are_dropped() {
        let msg = |tick, text: &str| GameMessage {
            tick,
            text: text.to_owned(),
        };
        let before = WorldSnapshot {
            messages: vec![msg(1, "You swing your axe.")],
            ..WorldSnapshot::at_tick(1)
        };
        let after = WorldSnapshot {
            messages: vec![
                msg(1, "You swing your axe."),
                msg(2, "You get some logs."),
                msg(2, "welcome to the world"),
            ],
            ..WorldSnapshot::at_tick(2)
        };
        let delta = StateDelta::between(&before, &after, &DeltaConfig::default());
        assert_eq!(delta.new_messages, vec!["You get some logs.".to_owned()]);
    }

    #[test]
    fn vanished_dying_npcs_are_inferred_kills() {
        let before = WorldSnapshot {
            npcs: vec![
                npc(1, Some(5), false),
                npc(2, Some(60), true),
                npc(3, Some(100), false),
                npc(4, Some(100), true),
            ],
            ..WorldSnapshot::at_tick(1)
        };
        let after = WorldSnapshot::at_tick(2);
        let delta = StateDelta::between(&before, &after, &DeltaConfig::default());
        let indices: Vec<u32> = delta.inferred_kills.iter().map(|k| k.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert!(delta.inferred_kills.iter().all(|k| k.heuristic));
    }
}
