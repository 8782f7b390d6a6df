//! Host side of the game session: publish a game and accept joining players
//!
//! The advertiser owns one GATT service with a readable game-info
//! characteristic and a write-without-response player-info characteristic.
//! Players announce themselves by writing their encoded [`PlayerInfo`]; each
//! well-formed write becomes one [`SessionEvent::PlayerJoined`].
//!
//! ```text
//! Uninitialized --powered on--> Ready --start--> Advertising
//!                                 ^                  |
//!                                 +------stop--------+   (ServiceRegistered while
//!                                                          the service stays added)
//! any --radio off--> PoweredOff --powered on--> Ready (re-advertises if it was)
//! ```

use charcount_core::{GameInfo, WireCodec};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::BleSessionConfig;
use crate::driver::PeripheralManagerDriver;
use crate::error::{BleResult, BleSessionError};
use crate::events::{
    EventSender, PeripheralManagerEvent, RadioState, Role, SessionEvent, SessionStatus,
    Subscription, WriteRequest,
};
use crate::protocol::{
    Advertisement, ServiceDescriptor, GAME_SERVICE_UUID, PLAYER_INFO_CHARACTERISTIC_UUID,
};

// ----------------------------------------------------------------------------
// State
// ----------------------------------------------------------------------------

/// Lifecycle of the hosting role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseState {
    Uninitialized,
    PoweredOff,
    Ready,
    Advertising,
    ServiceRegistered,
}

/// Requests the coordinator sends to a running advertiser task
#[derive(Debug, Clone)]
pub enum AdvertiserCommand {
    Initialize,
    StartAdvertising(GameInfo),
    StopAdvertising,
}

// ----------------------------------------------------------------------------
// Advertiser
// ----------------------------------------------------------------------------

/// Peripheral-role state machine
pub struct Advertiser<D> {
    driver: D,
    config: BleSessionConfig,
    codec: WireCodec,
    events: Subscription<PeripheralManagerEvent>,
    upward: EventSender<SessionEvent>,
    state: AdvertiseState,
    radio: RadioState,
    initialized: bool,
    game: Option<GameInfo>,
    advertising_wanted: bool,
    service_registered: bool,
}

impl<D: PeripheralManagerDriver> Advertiser<D> {
    pub fn new(
        driver: D,
        events: Subscription<PeripheralManagerEvent>,
        upward: EventSender<SessionEvent>,
        config: BleSessionConfig,
    ) -> Self {
        Self {
            driver,
            codec: config.codec(),
            config,
            events,
            upward,
            state: AdvertiseState::Uninitialized,
            radio: RadioState::Unknown,
            initialized: false,
            game: None,
            advertising_wanted: false,
            service_registered: false,
        }
    }

    pub fn state(&self) -> AdvertiseState {
        self.state
    }

    /// The game being hosted, if any
    pub fn game(&self) -> Option<&GameInfo> {
        self.game.as_ref()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Wait until the radio reports powered-on
    pub async fn initialize(&mut self) -> BleResult<()> {
        if self.radio.is_powered_on() {
            return Ok(());
        }

        self.set_status(SessionStatus::Initializing);
        while !self.radio.is_powered_on() {
            match self.events.recv().await {
                Some(event) => self.handle_event(event).await?,
                None => return Err(BleSessionError::EventBusClosed),
            }
        }
        Ok(())
    }

    /// Publish `game`, replacing whatever was published before
    pub async fn start_advertising(&mut self, game: GameInfo) -> BleResult<()> {
        match self.state {
            AdvertiseState::Uninitialized => return Err(BleSessionError::NotInitialized),
            AdvertiseState::PoweredOff => {
                debug!("Radio off; advertising '{}' once it returns", game.name);
                self.game = Some(game);
                self.advertising_wanted = true;
                self.set_status(SessionStatus::WaitingForRadio);
                return Ok(());
            }
            _ => {}
        }

        let encoded = self.codec.encode_game(&game)?;
        trace!("Encoded game info: {}", hex::encode(&encoded));

        self.driver.stop_advertising().await?;
        self.state = if self.service_registered {
            AdvertiseState::ServiceRegistered
        } else {
            AdvertiseState::Ready
        };
        self.driver.remove_all_services().await?;
        self.service_registered = false;
        self.state = AdvertiseState::Ready;

        self.driver
            .add_service(&ServiceDescriptor::game_session(encoded))
            .await?;
        self.service_registered = true;
        self.state = AdvertiseState::ServiceRegistered;

        self.driver
            .start_advertising(&Advertisement::for_service(GAME_SERVICE_UUID))
            .await?;
        self.state = AdvertiseState::Advertising;
        self.advertising_wanted = true;

        info!("Advertising game '{}' ({})", game.name, game.id);
        self.game = Some(game);
        self.set_status(SessionStatus::Advertising);
        Ok(())
    }

    /// Stop broadcasting; the service stays registered
    pub async fn stop_advertising(&mut self) -> BleResult<()> {
        self.advertising_wanted = false;
        if self.state != AdvertiseState::Advertising {
            return Ok(());
        }

        self.driver.stop_advertising().await?;
        self.state = if self.service_registered {
            AdvertiseState::ServiceRegistered
        } else {
            AdvertiseState::Ready
        };
        info!("Stopped advertising");
        self.set_status(SessionStatus::AdvertisingStopped);
        Ok(())
    }

    /// React to one peripheral manager event
    pub async fn handle_event(&mut self, event: PeripheralManagerEvent) -> BleResult<()> {
        match event {
            PeripheralManagerEvent::StateChanged(radio)
            | PeripheralManagerEvent::RestoredState(radio) => self.on_radio_state(radio).await,
            PeripheralManagerEvent::StartedAdvertising { error: Some(error) } => {
                warn!("Platform failed to start advertising: {}", error);
                Ok(())
            }
            PeripheralManagerEvent::StartedAdvertising { error: None } => {
                debug!("Platform confirmed advertising");
                Ok(())
            }
            PeripheralManagerEvent::AddedService {
                service,
                error: Some(error),
            } => {
                warn!("Platform failed to add service {}: {}", service, error);
                if service == GAME_SERVICE_UUID {
                    self.service_registered = false;
                }
                Ok(())
            }
            PeripheralManagerEvent::AddedService { service, error: None } => {
                // Some stacks only honour advertising once the service is in place.
                if service == GAME_SERVICE_UUID && self.state == AdvertiseState::Advertising {
                    debug!("Service {} added; re-issuing advertisement", service);
                    self.driver
                        .start_advertising(&Advertisement::for_service(GAME_SERVICE_UUID))
                        .await?;
                }
                Ok(())
            }
            PeripheralManagerEvent::ReceivedWrite { requests } => {
                for request in requests {
                    self.accept_write(request);
                }
                Ok(())
            }
            PeripheralManagerEvent::ReceivedRead { characteristic } => {
                trace!("Read of {} served by platform", characteristic);
                Ok(())
            }
            PeripheralManagerEvent::Subscribed { characteristic }
            | PeripheralManagerEvent::Unsubscribed { characteristic } => {
                trace!("Subscription change on {}", characteristic);
                Ok(())
            }
            PeripheralManagerEvent::ReadyToUpdateSubscribers => Ok(()),
        }
    }

    /// Process events and commands until the command channel closes
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<AdvertiserCommand>) {
        info!("Advertiser task starting");

        loop {
            tokio::select! {
                biased;

                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            error!("Advertiser event handling error: {}", e);
                        }
                    }
                    None => {
                        info!("Peripheral manager bus closed");
                        break;
                    }
                },

                command = commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.apply_command(command).await {
                            error!("Advertiser command failed: {}", e);
                        }
                    }
                    None => {
                        info!("Advertiser command channel closed, shutting down");
                        break;
                    }
                },
            }
        }

        if let Err(e) = self.stop_advertising().await {
            warn!("Failed to stop advertising on shutdown: {}", e);
        }
        info!("Advertiser task stopped");
    }

    async fn apply_command(&mut self, command: AdvertiserCommand) -> BleResult<()> {
        match command {
            AdvertiserCommand::Initialize => self.initialize().await,
            AdvertiserCommand::StartAdvertising(game) => self.start_advertising(game).await,
            AdvertiserCommand::StopAdvertising => self.stop_advertising().await,
        }
    }

    async fn on_radio_state(&mut self, radio: RadioState) -> BleResult<()> {
        self.radio = radio;

        if !radio.is_powered_on() {
            warn!("Peripheral radio unavailable: {:?}", radio);
            // The platform drops local services with the radio.
            self.state = AdvertiseState::PoweredOff;
            self.service_registered = false;
            self.set_status(SessionStatus::RadioUnavailable(radio));
            return Ok(());
        }

        if matches!(
            self.state,
            AdvertiseState::Uninitialized | AdvertiseState::PoweredOff
        ) {
            self.state = AdvertiseState::Ready;
        }
        if !self.initialized {
            self.initialized = true;
            info!("Peripheral radio powered on");
            self.upward.emit(SessionEvent::Initialized(Role::Peripheral));
        }
        self.set_status(SessionStatus::Ready);

        if self.advertising_wanted
            && self.config.resume_advertising
            && self.state != AdvertiseState::Advertising
        {
            if let Some(game) = self.game.clone() {
                info!("Radio back; resuming advertising of '{}'", game.name);
                self.start_advertising(game).await?;
            }
        }
        Ok(())
    }

    fn accept_write(&self, request: WriteRequest) {
        if request.characteristic != PLAYER_INFO_CHARACTERISTIC_UUID {
            debug!("Ignoring write to {}", request.characteristic);
            return;
        }

        match self.codec.decode_player(&request.value) {
            Ok(player) => {
                info!("Player '{}' joined", player.name);
                self.upward.emit(SessionEvent::PlayerJoined(player));
            }
            Err(e) => {
                debug!(
                    "Dropping malformed player payload ({} bytes): {}",
                    request.value.len(),
                    e
                );
            }
        }
    }

    fn set_status(&self, status: SessionStatus) {
        debug!("Advertiser status: {}", status);
        self.upward
            .emit(SessionEvent::Status(Role::Peripheral, status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::harness::{MockPeripheralManager, PeripheralCall};
    use charcount_core::{PlayerInfo, SequentialIds};
    use tokio_test::assert_ok;

    struct Fixture {
        advertiser: Advertiser<MockPeripheralManager>,
        radio: EventSender<PeripheralManagerEvent>,
        upward: Subscription<SessionEvent>,
    }

    fn fixture(config: BleSessionConfig) -> Fixture {
        let mut bus = EventBus::new();
        let mut upward_bus = EventBus::new();
        let radio = bus.sender();
        let advertiser = Advertiser::new(
            MockPeripheralManager::new(),
            bus.subscribe().unwrap(),
            upward_bus.sender(),
            config,
        );
        Fixture {
            advertiser,
            radio,
            upward: upward_bus.subscribe().unwrap(),
        }
    }

    async fn powered_fixture() -> Fixture {
        let mut fx = fixture(BleSessionConfig::default());
        fx.radio
            .emit(PeripheralManagerEvent::StateChanged(RadioState::PoweredOn));
        assert_ok!(fx.advertiser.initialize().await);
        fx
    }

    fn drain(upward: &mut Subscription<SessionEvent>) -> Vec<SessionEvent> {
        std::iter::from_fn(|| upward.try_recv()).collect()
    }

    fn greywall() -> GameInfo {
        GameInfo::new("Greywall", &SequentialIds::new())
    }

    #[tokio::test]
    async fn test_initialize_waits_for_power() {
        let mut fx = fixture(BleSessionConfig::default());
        fx.radio
            .emit(PeripheralManagerEvent::StateChanged(RadioState::PoweredOff));
        fx.radio
            .emit(PeripheralManagerEvent::StateChanged(RadioState::PoweredOn));

        assert_ok!(fx.advertiser.initialize().await);
        assert_eq!(fx.advertiser.state(), AdvertiseState::Ready);

        let events = drain(&mut fx.upward);
        let initialized = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Initialized(Role::Peripheral)))
            .count();
        assert_eq!(initialized, 1);
    }

    #[tokio::test]
    async fn test_start_before_initialize_is_rejected() {
        let mut fx = fixture(BleSessionConfig::default());
        assert!(matches!(
            fx.advertiser.start_advertising(greywall()).await,
            Err(BleSessionError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_start_advertising_registers_service_with_game() {
        let mut fx = powered_fixture().await;
        let game = greywall();
        assert_ok!(fx.advertiser.start_advertising(game.clone()).await);

        assert_eq!(fx.advertiser.state(), AdvertiseState::Advertising);
        let driver = fx.advertiser.driver();
        let services = driver.services();
        assert_eq!(services.len(), 1);

        let value = services[0]
            .characteristic(crate::protocol::GAME_INFO_CHARACTERISTIC_UUID)
            .and_then(|c| c.value.clone())
            .unwrap();
        assert_eq!(WireCodec::default().decode_game(&value).unwrap(), game);
        assert!(driver.is_advertising());
    }

    #[tokio::test]
    async fn test_start_advertising_twice_is_idempotent() {
        let mut fx = powered_fixture().await;
        let game = greywall();
        assert_ok!(fx.advertiser.start_advertising(game.clone()).await);
        assert_ok!(fx.advertiser.start_advertising(game).await);

        let driver = fx.advertiser.driver();
        assert_eq!(driver.services().len(), 1);
        assert!(driver.is_advertising());
        assert_eq!(driver.active_advertisements(), 1);
    }

    #[tokio::test]
    async fn test_failed_restart_leaves_advertiser_ready() {
        let mut fx = powered_fixture().await;
        assert_ok!(fx.advertiser.start_advertising(greywall()).await);

        fx.advertiser.driver().fail_add_service(true);
        let renamed = GameInfo::new("Saltmarsh", &SequentialIds::new());
        assert!(fx.advertiser.start_advertising(renamed.clone()).await.is_err());

        assert_eq!(fx.advertiser.state(), AdvertiseState::Ready);
        assert!(!fx.advertiser.driver().is_advertising());

        // A late confirmation must not put the old broadcast back on air
        assert_ok!(
            fx.advertiser
                .handle_event(PeripheralManagerEvent::AddedService {
                    service: GAME_SERVICE_UUID,
                    error: None,
                })
                .await
        );
        assert!(!fx.advertiser.driver().is_advertising());

        fx.advertiser.driver().fail_add_service(false);
        assert_ok!(fx.advertiser.start_advertising(renamed).await);
        assert_eq!(fx.advertiser.state(), AdvertiseState::Advertising);
        assert_eq!(fx.advertiser.driver().services().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_advertising_keeps_service() {
        let mut fx = powered_fixture().await;
        assert_ok!(fx.advertiser.start_advertising(greywall()).await);
        assert_ok!(fx.advertiser.stop_advertising().await);

        assert_eq!(fx.advertiser.state(), AdvertiseState::ServiceRegistered);
        assert!(!fx.advertiser.driver().is_advertising());
        assert_eq!(fx.advertiser.driver().services().len(), 1);

        // No-op when nothing is broadcasting
        let calls_before = fx.advertiser.driver().calls().len();
        assert_ok!(fx.advertiser.stop_advertising().await);
        assert_eq!(fx.advertiser.driver().calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_added_service_reissues_advertisement() {
        let mut fx = powered_fixture().await;
        assert_ok!(fx.advertiser.start_advertising(greywall()).await);
        let starts_before = fx
            .advertiser
            .driver()
            .calls()
            .iter()
            .filter(|c| matches!(c, PeripheralCall::StartAdvertising(_)))
            .count();

        assert_ok!(
            fx.advertiser
                .handle_event(PeripheralManagerEvent::AddedService {
                    service: GAME_SERVICE_UUID,
                    error: None,
                })
                .await
        );

        let starts_after = fx
            .advertiser
            .driver()
            .calls()
            .iter()
            .filter(|c| matches!(c, PeripheralCall::StartAdvertising(_)))
            .count();
        assert_eq!(starts_after, starts_before + 1);
        assert_eq!(fx.advertiser.driver().active_advertisements(), 1);
    }

    #[tokio::test]
    async fn test_well_formed_write_emits_one_player_joined() {
        let mut fx = powered_fixture().await;
        assert_ok!(fx.advertiser.start_advertising(greywall()).await);
        drain(&mut fx.upward);

        let player = PlayerInfo::new("Bekri", &SequentialIds::new()).with_armor_class(21);
        let payload = WireCodec::default().encode_player(&player).unwrap();
        assert_ok!(
            fx.advertiser
                .handle_event(PeripheralManagerEvent::ReceivedWrite {
                    requests: vec![WriteRequest {
                        characteristic: PLAYER_INFO_CHARACTERISTIC_UUID,
                        value: payload,
                    }],
                })
                .await
        );

        let joined: Vec<_> = drain(&mut fx.upward)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::PlayerJoined(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(joined, vec![player]);
    }

    #[tokio::test]
    async fn test_malformed_write_is_dropped() {
        let mut fx = powered_fixture().await;
        assert_ok!(fx.advertiser.start_advertising(greywall()).await);
        drain(&mut fx.upward);

        assert_ok!(
            fx.advertiser
                .handle_event(PeripheralManagerEvent::ReceivedWrite {
                    requests: vec![
                        WriteRequest {
                            characteristic: PLAYER_INFO_CHARACTERISTIC_UUID,
                            value: b"{\"name\":\"Bekri\"}".to_vec(),
                        },
                        WriteRequest {
                            characteristic: PLAYER_INFO_CHARACTERISTIC_UUID,
                            value: vec![],
                        },
                    ],
                })
                .await
        );

        assert!(drain(&mut fx.upward)
            .iter()
            .all(|e| !matches!(e, SessionEvent::PlayerJoined(_))));
    }

    #[tokio::test]
    async fn test_write_after_stop_still_joins() {
        let mut fx = powered_fixture().await;
        assert_ok!(fx.advertiser.start_advertising(greywall()).await);
        assert_ok!(fx.advertiser.stop_advertising().await);
        drain(&mut fx.upward);

        let player = PlayerInfo::new("Rieta", &SequentialIds::new());
        let payload = WireCodec::default().encode_player(&player).unwrap();
        assert_ok!(
            fx.advertiser
                .handle_event(PeripheralManagerEvent::ReceivedWrite {
                    requests: vec![WriteRequest {
                        characteristic: PLAYER_INFO_CHARACTERISTIC_UUID,
                        value: payload,
                    }],
                })
                .await
        );

        assert!(drain(&mut fx.upward)
            .contains(&SessionEvent::PlayerJoined(player)));
    }

    #[tokio::test]
    async fn test_advertising_resumes_after_power_cycle() {
        let mut fx = powered_fixture().await;
        let game = greywall();
        assert_ok!(fx.advertiser.start_advertising(game.clone()).await);

        assert_ok!(
            fx.advertiser
                .handle_event(PeripheralManagerEvent::StateChanged(RadioState::PoweredOff))
                .await
        );
        assert_eq!(fx.advertiser.state(), AdvertiseState::PoweredOff);

        assert_ok!(
            fx.advertiser
                .handle_event(PeripheralManagerEvent::StateChanged(RadioState::PoweredOn))
                .await
        );
        assert_eq!(fx.advertiser.state(), AdvertiseState::Advertising);
        assert_eq!(fx.advertiser.game(), Some(&game));
        assert_eq!(fx.advertiser.driver().services().len(), 1);
    }

    #[tokio::test]
    async fn test_no_resume_when_disabled() {
        let mut fx = fixture(BleSessionConfig::default().with_resume_advertising(false));
        fx.radio
            .emit(PeripheralManagerEvent::StateChanged(RadioState::PoweredOn));
        assert_ok!(fx.advertiser.initialize().await);
        assert_ok!(fx.advertiser.start_advertising(greywall()).await);

        assert_ok!(
            fx.advertiser
                .handle_event(PeripheralManagerEvent::StateChanged(RadioState::PoweredOff))
                .await
        );
        assert_ok!(
            fx.advertiser
                .handle_event(PeripheralManagerEvent::StateChanged(RadioState::PoweredOn))
                .await
        );
        assert_eq!(fx.advertiser.state(), AdvertiseState::Ready);
    }
}
