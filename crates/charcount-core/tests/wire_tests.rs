//! Property tests for the wire codec
//!
//! decode(encode(x)) == x must hold for every value that fits in a payload,
//! and no byte string may make the decoder panic.

use charcount_core::{CodecError, GameInfo, PlayerInfo, WireCodec};
use proptest::prelude::*;
use uuid::Uuid;

fn game_strategy() -> impl Strategy<Value = GameInfo> {
    (any::<u128>(), ".{0,64}", any::<bool>(), any::<u32>()).prop_map(
        |(id, name, is_creator, player_count)| GameInfo {
            id: Uuid::from_u128(id),
            name,
            is_creator,
            player_count,
        },
    )
}

fn player_strategy() -> impl Strategy<Value = PlayerInfo> {
    (
        any::<u128>(),
        ".{0,64}",
        any::<u16>(),
        any::<u16>(),
        any::<u16>(),
    )
        .prop_map(
            |(id, name, armor_class, spell_save_dc, passive_perception)| PlayerInfo {
                id: Uuid::from_u128(id),
                name,
                armor_class,
                spell_save_dc,
                passive_perception,
            },
        )
}

proptest! {
    #[test]
    fn game_info_round_trips(game in game_strategy()) {
        let codec = WireCodec::default();
        let payload = codec.encode_game(&game).unwrap();
        prop_assert_eq!(codec.decode_game(&payload).unwrap(), game);
    }

    #[test]
    fn player_info_round_trips(player in player_strategy()) {
        let codec = WireCodec::default();
        let payload = codec.encode_player(&player).unwrap();
        prop_assert_eq!(codec.decode_player(&payload).unwrap(), player);
    }

    #[test]
    fn arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..600)) {
        let codec = WireCodec::default();
        let _ = codec.decode_game(&data);
        let _ = codec.decode_player(&data);
    }

    #[test]
    fn encoding_respects_the_limit(game in game_strategy(), max in 2usize..96) {
        let codec = WireCodec::new(max);
        match codec.encode_game(&game) {
            Ok(payload) => prop_assert!(payload.len() <= max),
            Err(CodecError::PayloadTooLarge { size, max: limit }) => {
                prop_assert!(size > limit);
                prop_assert_eq!(limit, max);
            }
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }
}
