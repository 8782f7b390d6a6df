//! BLE service contract shared by hosts and players
//!
//! Both roles must agree on these identifiers bit for bit, otherwise a
//! scanning player never matches an advertising host.

use uuid::Uuid;

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// CharCount game session service UUID
pub const GAME_SERVICE_UUID: Uuid = Uuid::from_u128(0xD443100E_AF9E_4513_8484_72E2A4677E57);

/// Readable characteristic holding the encoded game info
pub const GAME_INFO_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x7B0C9766_7A56_4C40_BE4D_8ABB6E43548F);

/// Write-without-response characteristic receiving encoded player info
pub const PLAYER_INFO_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xEAD6B721_F679_4E44_BE7B_3AC394273CD9);

// ----------------------------------------------------------------------------
// GATT Descriptors
// ----------------------------------------------------------------------------

/// How a central writes a characteristic value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Operations a characteristic permits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicProperty {
    Read,
    WriteWithoutResponse,
}

/// One characteristic of a locally hosted service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub properties: Vec<CharacteristicProperty>,
    /// Static value served to readers, if any
    pub value: Option<Vec<u8>>,
}

impl CharacteristicDescriptor {
    pub fn supports(&self, property: CharacteristicProperty) -> bool {
        self.properties.contains(&property)
    }
}

/// A locally hosted GATT service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    /// The game session service: game info pre-loaded, player info empty
    pub fn game_session(encoded_game: Vec<u8>) -> Self {
        Self {
            uuid: GAME_SERVICE_UUID,
            primary: true,
            characteristics: vec![
                CharacteristicDescriptor {
                    uuid: GAME_INFO_CHARACTERISTIC_UUID,
                    properties: vec![CharacteristicProperty::Read],
                    value: Some(encoded_game),
                },
                CharacteristicDescriptor {
                    uuid: PLAYER_INFO_CHARACTERISTIC_UUID,
                    properties: vec![CharacteristicProperty::WriteWithoutResponse],
                    value: None,
                },
            ],
        }
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Advertisement payload: service UUIDs only, no local name or manufacturer data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub service_uuids: Vec<Uuid>,
}

impl Advertisement {
    pub fn for_service(uuid: Uuid) -> Self {
        Self {
            service_uuids: vec![uuid],
        }
    }

    pub fn advertises(&self, uuid: Uuid) -> bool {
        self.service_uuids.contains(&uuid)
    }
}
