//! Game metadata published by a hosting device

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::IdGenerator;

/// A game a host advertises and players can join
///
/// Identity is the `id`. Copies received over the air are marked with
/// `is_creator = false`; `player_count` is advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameInfo {
    pub id: Uuid,
    pub name: String,
    pub is_creator: bool,
    pub player_count: u32,
}

impl GameInfo {
    /// Create a game hosted by this device
    pub fn new(name: impl Into<String>, ids: &dyn IdGenerator) -> Self {
        Self {
            id: ids.next_id(),
            name: name.into(),
            is_creator: true,
            player_count: 0,
        }
    }

    /// The view a joining player keeps of a remote game
    pub fn as_remote(mut self) -> Self {
        self.is_creator = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIds;

    #[test]
    fn test_new_game_is_created_locally() {
        let ids = SequentialIds::new();
        let game = GameInfo::new("Greywall", &ids);
        assert_eq!(game.id, Uuid::from_u128(1));
        assert!(game.is_creator);
        assert_eq!(game.player_count, 0);
    }

    #[test]
    fn test_remote_copy_keeps_identity() {
        let game = GameInfo::new("Greywall", &SequentialIds::new());
        let remote = game.clone().as_remote();
        assert!(!remote.is_creator);
        assert_eq!(remote.id, game.id);
        assert_eq!(remote.name, game.name);
    }
}
