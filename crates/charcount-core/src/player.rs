//! Character summary pushed by a joining player

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::IdGenerator;

/// Armor class a character has before any equipment is applied
pub const DEFAULT_ARMOR_CLASS: u16 = 10;

/// The reduced projection of a character a host needs at the table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: Uuid,
    pub name: String,
    pub armor_class: u16,
    pub spell_save_dc: u16,
    pub passive_perception: u16,
}

impl PlayerInfo {
    /// Create a player card with default statistics
    pub fn new(name: impl Into<String>, ids: &dyn IdGenerator) -> Self {
        Self {
            id: ids.next_id(),
            name: name.into(),
            armor_class: DEFAULT_ARMOR_CLASS,
            spell_save_dc: 0,
            passive_perception: 0,
        }
    }

    pub fn with_armor_class(mut self, armor_class: u16) -> Self {
        self.armor_class = armor_class;
        self
    }

    pub fn with_spell_save_dc(mut self, dc: u16) -> Self {
        self.spell_save_dc = dc;
        self
    }

    pub fn with_passive_perception(mut self, perception: u16) -> Self {
        self.passive_perception = perception;
        self
    }
}
