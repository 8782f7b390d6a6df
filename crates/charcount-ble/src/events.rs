//! Event bus between platform drivers and the session state machines
//!
//! Platform BLE stacks report everything through callbacks raised on a
//! driver-owned thread. Drivers turn each callback into one typed event and
//! push it onto an [`EventBus`]; the owning state machine consumes the bus
//! from a single task, so events are handled one at a time and in the order
//! the driver raised them.
//!
//! Three buses exist per device:
//!
//! - [`CentralEvent`] - central manager callbacks (radio state, discovery, links)
//! - [`PeripheralEvent`] - GATT client callbacks for a connected remote peripheral
//! - [`PeripheralManagerEvent`] - local GATT server callbacks (advertising, writes)
//!
//! A fourth, [`SessionEvent`], carries protocol outcomes upward to the
//! session coordinator.

use std::fmt;

use charcount_core::{GameInfo, PlayerInfo};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::error::{BleResult, BleSessionError};

// ----------------------------------------------------------------------------
// Shared Event Payloads
// ----------------------------------------------------------------------------

/// The two BLE roles a device can play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Scans for and joins games
    Central,
    /// Hosts a game
    Peripheral,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Central => write!(f, "central"),
            Role::Peripheral => write!(f, "peripheral"),
        }
    }
}

/// Radio power state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_powered_on(self) -> bool {
        self == RadioState::PoweredOn
    }
}

/// Opaque identity of a remote peripheral, assigned by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralHandle(u64);

impl PeripheralHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peripheral#{}", self.0)
    }
}

/// Link-level notifications outside connect/disconnect callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    PeerConnected,
    PeerDisconnected,
}

// ----------------------------------------------------------------------------
// Driver Events
// ----------------------------------------------------------------------------

/// Central manager notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
    StateChanged(RadioState),
    RestoredState(RadioState),
    DiscoveredPeripheral {
        peripheral: PeripheralHandle,
    },
    Connected {
        peripheral: PeripheralHandle,
    },
    FailedToConnect {
        peripheral: PeripheralHandle,
        error: Option<String>,
    },
    Disconnected {
        peripheral: PeripheralHandle,
        error: Option<String>,
    },
    ConnectionEvent {
        peripheral: PeripheralHandle,
        event: ConnectionEventKind,
    },
}

/// GATT client notifications for a connected remote peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    DiscoveredServices {
        peripheral: PeripheralHandle,
        services: Vec<Uuid>,
        error: Option<String>,
    },
    DiscoveredCharacteristics {
        peripheral: PeripheralHandle,
        service: Uuid,
        characteristics: Vec<Uuid>,
        error: Option<String>,
    },
    ValueUpdated {
        peripheral: PeripheralHandle,
        characteristic: Uuid,
        value: Option<Vec<u8>>,
        error: Option<String>,
    },
    WroteValue {
        peripheral: PeripheralHandle,
        characteristic: Uuid,
        error: Option<String>,
    },
    ReadyToWriteWithoutResponse {
        peripheral: PeripheralHandle,
    },
}

/// A value a remote central wrote to a local characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Local GATT server notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralManagerEvent {
    StateChanged(RadioState),
    RestoredState(RadioState),
    StartedAdvertising { error: Option<String> },
    AddedService { service: Uuid, error: Option<String> },
    ReceivedRead { characteristic: Uuid },
    ReceivedWrite { requests: Vec<WriteRequest> },
    Subscribed { characteristic: Uuid },
    Unsubscribed { characteristic: Uuid },
    ReadyToUpdateSubscribers,
}

// ----------------------------------------------------------------------------
// Upward Events
// ----------------------------------------------------------------------------

/// Human-readable progress of a role, for diagnostics only
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Uninitialized,
    Initializing,
    WaitingForRadio,
    RadioUnavailable(RadioState),
    Ready,
    Detecting,
    DetectionStopped,
    DiscoveredPeripheral,
    Connecting,
    Connected,
    DiscoveringServices,
    ServiceMissing,
    DiscoveringCharacteristics,
    CharacteristicMissing,
    ReadingGameInfo,
    WaitingForWriteReadiness,
    SendingPlayerInfo,
    JoinFailed,
    Advertising,
    AdvertisingStopped,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Uninitialized => write!(f, "uninitialized"),
            SessionStatus::Initializing => write!(f, "initializing"),
            SessionStatus::WaitingForRadio => write!(f, "waiting for radio"),
            SessionStatus::RadioUnavailable(state) => write!(f, "radio unavailable ({state:?})"),
            SessionStatus::Ready => write!(f, "powered on"),
            SessionStatus::Detecting => write!(f, "detecting"),
            SessionStatus::DetectionStopped => write!(f, "detection stopped"),
            SessionStatus::DiscoveredPeripheral => write!(f, "discovered peripheral"),
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::DiscoveringServices => write!(f, "discovering services"),
            SessionStatus::ServiceMissing => {
                write!(f, "discovered services... but not the ones we want")
            }
            SessionStatus::DiscoveringCharacteristics => write!(f, "discovering characteristics"),
            SessionStatus::CharacteristicMissing => write!(f, "characteristic missing"),
            SessionStatus::ReadingGameInfo => write!(f, "reading game info"),
            SessionStatus::WaitingForWriteReadiness => write!(f, "waiting to write"),
            SessionStatus::SendingPlayerInfo => write!(f, "sending player info"),
            SessionStatus::JoinFailed => write!(f, "join failed"),
            SessionStatus::Advertising => write!(f, "advertising"),
            SessionStatus::AdvertisingStopped => write!(f, "advertising stopped"),
        }
    }
}

/// Protocol outcomes reported to the session coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The role's radio reported powered-on for the first time
    Initialized(Role),
    /// A player read a game's info from a nearby host
    DiscoveredGame {
        game: GameInfo,
        peripheral: PeripheralHandle,
    },
    /// A player's info arrived on the hosted game
    PlayerJoined(PlayerInfo),
    /// The join write was issued; no acknowledgement follows
    JoinRequestSent { game_id: Uuid, player: PlayerInfo },
    /// Diagnostic progress update
    Status(Role, SessionStatus),
}

// ----------------------------------------------------------------------------
// Event Bus
// ----------------------------------------------------------------------------

/// Ordered, lossless event channel with a single subscriber
pub struct EventBus<E> {
    sender: EventSender<E>,
    receiver: Option<mpsc::UnboundedReceiver<E>>,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: EventSender { tx },
            receiver: Some(rx),
        }
    }

    /// Handle for a driver to publish events
    pub fn sender(&self) -> EventSender<E> {
        self.sender.clone()
    }

    /// Take the one subscription this bus offers
    pub fn subscribe(&mut self) -> BleResult<Subscription<E>> {
        self.receiver
            .take()
            .map(|rx| Subscription { rx })
            .ok_or(BleSessionError::AlreadySubscribed)
    }
}

/// A bus whose subscription is taken up front
pub fn event_channel<E>() -> (EventSender<E>, Subscription<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, Subscription { rx })
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishing side of an [`EventBus`]
pub struct EventSender<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: fmt::Debug> EventSender<E> {
    /// Publish an event; returns false once the subscriber is gone
    pub fn emit(&self, event: E) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                trace!("Dropping {:?}: subscriber gone", event);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Long-lived consuming side of an [`EventBus`]
pub struct Subscription<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    /// Wait for the next event; `None` once every sender is dropped
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Take an already queued event without waiting
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}
