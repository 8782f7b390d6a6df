//! Player side of the game session: discover nearby games and join one
//!
//! The scanner holds at most one connection attempt at a time (the
//! "current" peripheral). Discoveries arriving while that slot is taken are
//! dropped; the slot frees once the attempt resolves by reading the game
//! info, failing, disconnecting, writing the join payload, or timing out.
//!
//! After services are discovered the exchange forks:
//!
//! - browse: no character chosen, so read the game-info characteristic
//! - join: a character is chosen, so write the player-info characteristic

use std::collections::{HashMap, HashSet};

use charcount_core::{GameInfo, PlayerInfo, WireCodec};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::BleSessionConfig;
use crate::driver::CentralDriver;
use crate::error::{BleResult, BleSessionError};
use crate::events::{
    CentralEvent, ConnectionEventKind, EventSender, PeripheralEvent, PeripheralHandle, RadioState,
    Role, SessionEvent, SessionStatus, Subscription,
};
use crate::protocol::{
    WriteType, GAME_INFO_CHARACTERISTIC_UUID, GAME_SERVICE_UUID, PLAYER_INFO_CHARACTERISTIC_UUID,
};

// ----------------------------------------------------------------------------
// State
// ----------------------------------------------------------------------------

/// Where the central is in the discover/join exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting(PeripheralHandle),
    Connected(PeripheralHandle),
    DiscoveringServices(PeripheralHandle),
    DiscoveringCharacteristics(PeripheralHandle),
    ReadingGameInfo(PeripheralHandle),
    AwaitingJoinChoice,
    WritingPlayerInfo(PeripheralHandle),
}

/// Requests the coordinator sends to a running scanner task
#[derive(Debug, Clone)]
pub enum ScannerCommand {
    Initialize,
    StartDetecting,
    StopDetecting,
    Join { game: GameInfo, player: PlayerInfo },
}

#[derive(Debug, Clone, Copy)]
struct ConnectionAttempt {
    peripheral: PeripheralHandle,
    started_at: Instant,
}

impl ConnectionAttempt {
    fn new(peripheral: PeripheralHandle) -> Self {
        Self {
            peripheral,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone)]
struct JoinIntent {
    game_id: Uuid,
    player: PlayerInfo,
}

// ----------------------------------------------------------------------------
// Scanner
// ----------------------------------------------------------------------------

/// Central-role state machine
pub struct Scanner<D> {
    driver: D,
    config: BleSessionConfig,
    codec: WireCodec,
    central_events: Subscription<CentralEvent>,
    peripheral_events: Subscription<PeripheralEvent>,
    upward: EventSender<SessionEvent>,
    state: SessionState,
    radio: RadioState,
    initialized: bool,
    detect_requested: bool,
    scanning: bool,
    current: Option<ConnectionAttempt>,
    connected: HashSet<PeripheralHandle>,
    requested_disconnects: HashSet<PeripheralHandle>,
    game_devices: HashMap<Uuid, PeripheralHandle>,
    chosen: Option<JoinIntent>,
    write_pending: Option<PeripheralHandle>,
}

impl<D: CentralDriver> Scanner<D> {
    pub fn new(
        driver: D,
        central_events: Subscription<CentralEvent>,
        peripheral_events: Subscription<PeripheralEvent>,
        upward: EventSender<SessionEvent>,
        config: BleSessionConfig,
    ) -> Self {
        Self {
            driver,
            codec: config.codec(),
            config,
            central_events,
            peripheral_events,
            upward,
            state: SessionState::Idle,
            radio: RadioState::Unknown,
            initialized: false,
            detect_requested: false,
            scanning: false,
            current: None,
            connected: HashSet::new(),
            requested_disconnects: HashSet::new(),
            game_devices: HashMap::new(),
            chosen: None,
            write_pending: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Peripheral currently holding the connection slot
    pub fn current_peripheral(&self) -> Option<PeripheralHandle> {
        self.current.map(|attempt| attempt.peripheral)
    }

    /// Peripheral a discovered game was read from
    pub fn peripheral_for(&self, game_id: &Uuid) -> Option<PeripheralHandle> {
        self.game_devices.get(game_id).copied()
    }

    /// Character waiting to be written to the chosen game
    pub fn chosen_character(&self) -> Option<&PlayerInfo> {
        self.chosen.as_ref().map(|intent| &intent.player)
    }

    /// Wait until the central radio reports powered-on
    pub async fn initialize(&mut self) -> BleResult<()> {
        if self.config.scan_on_power_on {
            self.detect_requested = true;
        }
        if self.radio.is_powered_on() {
            // Power-on was handled before the request arrived.
            if self.detect_requested {
                self.begin_scan().await?;
            }
            return Ok(());
        }

        self.set_status(SessionStatus::Initializing);

        while !self.radio.is_powered_on() {
            match self.central_events.recv().await {
                Some(event) => self.handle_central_event(event).await?,
                None => return Err(BleSessionError::EventBusClosed),
            }
        }
        Ok(())
    }

    /// Scan for advertised games; repeated calls keep a single scan running
    pub async fn start_detecting(&mut self) -> BleResult<()> {
        self.detect_requested = true;
        if !self.radio.is_powered_on() {
            self.set_status(SessionStatus::WaitingForRadio);
            return Ok(());
        }
        self.begin_scan().await
    }

    /// Stop scanning; an in-flight connection attempt carries on
    pub async fn stop_detecting(&mut self) -> BleResult<()> {
        self.detect_requested = false;
        if self.scanning {
            self.driver.stop_scan().await?;
            self.scanning = false;
            info!("Stopped scanning for games");
        }
        if self.current.is_none() {
            self.state = self.resting_state();
        }
        self.set_status(SessionStatus::DetectionStopped);
        Ok(())
    }

    /// Connect to the host of `game` and write `player` to it
    pub async fn join(&mut self, game: &GameInfo, player: PlayerInfo) -> BleResult<()> {
        let peripheral = self
            .peripheral_for(&game.id)
            .ok_or(BleSessionError::UnknownGame { game_id: game.id })?;

        if let Some(attempt) = self.current.take() {
            if attempt.peripheral != peripheral {
                debug!(
                    "Abandoning {} to join '{}' on {}",
                    attempt.peripheral, game.name, peripheral
                );
                self.request_disconnect(attempt.peripheral).await;
            }
        }
        self.write_pending = None;

        info!("Joining '{}' as '{}'", game.name, player.name);
        self.chosen = Some(JoinIntent {
            game_id: game.id,
            player,
        });

        if self.connected.contains(&peripheral) {
            self.current = Some(ConnectionAttempt::new(peripheral));
            self.discover_game_service(peripheral).await
        } else {
            self.connect_to(peripheral).await
        }
    }

    /// Deadline after which the current attempt counts as stalled
    pub fn connection_deadline(&self) -> Option<Instant> {
        self.current
            .map(|attempt| attempt.started_at + self.config.connection_timeout)
    }

    /// Free the connection slot if the current attempt outlived its deadline
    pub async fn expire_stalled_connection(&mut self, now: Instant) -> BleResult<()> {
        let Some(deadline) = self.connection_deadline() else {
            return Ok(());
        };
        if now < deadline {
            return Ok(());
        }
        let Some(attempt) = self.current else {
            return Ok(());
        };

        warn!(
            "Attempt with {} stalled in {:?}; giving up",
            attempt.peripheral, self.state
        );
        self.write_pending = None;
        self.fail_join();
        self.release_current();
        self.request_disconnect(attempt.peripheral).await;
        Ok(())
    }

    /// React to one central manager event
    pub async fn handle_central_event(&mut self, event: CentralEvent) -> BleResult<()> {
        match event {
            CentralEvent::StateChanged(radio) | CentralEvent::RestoredState(radio) => {
                self.on_radio_state(radio).await
            }
            CentralEvent::DiscoveredPeripheral { peripheral } => {
                self.on_discovered(peripheral).await
            }
            CentralEvent::Connected { peripheral } => self.on_connected(peripheral).await,
            CentralEvent::ConnectionEvent {
                peripheral,
                event: ConnectionEventKind::PeerConnected,
            } => {
                if self.state == SessionState::Connecting(peripheral) {
                    self.on_connected(peripheral).await
                } else {
                    Ok(())
                }
            }
            CentralEvent::ConnectionEvent {
                peripheral,
                event: ConnectionEventKind::PeerDisconnected,
            } => {
                self.on_link_lost(peripheral, None);
                Ok(())
            }
            CentralEvent::FailedToConnect { peripheral, error } => {
                self.on_link_lost(
                    peripheral,
                    Some(error.unwrap_or_else(|| "failed to connect".to_string())),
                );
                Ok(())
            }
            CentralEvent::Disconnected { peripheral, error } => {
                self.on_link_lost(peripheral, error);
                Ok(())
            }
        }
    }

    /// React to one GATT client event
    pub async fn handle_peripheral_event(&mut self, event: PeripheralEvent) -> BleResult<()> {
        match event {
            PeripheralEvent::DiscoveredServices {
                peripheral,
                services,
                error,
            } => self.on_services(peripheral, services, error).await,
            PeripheralEvent::DiscoveredCharacteristics {
                peripheral,
                service,
                characteristics,
                error,
            } => {
                self.on_characteristics(peripheral, service, characteristics, error)
                    .await
            }
            PeripheralEvent::ValueUpdated {
                peripheral,
                characteristic,
                value,
                error,
            } => self.on_value(peripheral, characteristic, value, error).await,
            PeripheralEvent::WroteValue {
                peripheral,
                characteristic,
                error,
            } => {
                match error {
                    Some(e) => warn!("Write to {} on {} failed: {}", characteristic, peripheral, e),
                    None => trace!("Write to {} on {} confirmed", characteristic, peripheral),
                }
                Ok(())
            }
            PeripheralEvent::ReadyToWriteWithoutResponse { peripheral } => {
                self.write_player_info(peripheral).await
            }
        }
    }

    /// Handle every event already queued, without waiting
    pub async fn process_pending(&mut self) -> BleResult<usize> {
        let mut handled = 0;
        loop {
            if let Some(event) = self.central_events.try_recv() {
                self.handle_central_event(event).await?;
            } else if let Some(event) = self.peripheral_events.try_recv() {
                self.handle_peripheral_event(event).await?;
            } else {
                return Ok(handled);
            }
            handled += 1;
        }
    }

    /// Process events, timeouts, and commands until the command channel closes
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ScannerCommand>) {
        info!("Scanner task starting");

        loop {
            let deadline = self.connection_deadline();

            tokio::select! {
                biased;

                event = self.central_events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_central_event(event).await {
                            error!("Central event handling error: {}", e);
                        }
                    }
                    None => {
                        info!("Central event bus closed");
                        break;
                    }
                },

                event = self.peripheral_events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_peripheral_event(event).await {
                            error!("Peripheral event handling error: {}", e);
                        }
                    }
                    None => {
                        info!("Peripheral event bus closed");
                        break;
                    }
                },

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Err(e) = self.expire_stalled_connection(Instant::now()).await {
                        error!("Failed to expire stalled connection: {}", e);
                    }
                }

                command = commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.apply_command(command).await {
                            error!("Scanner command failed: {}", e);
                        }
                    }
                    None => {
                        info!("Scanner command channel closed, shutting down");
                        break;
                    }
                },
            }
        }

        if let Err(e) = self.stop_detecting().await {
            warn!("Failed to stop scanning on shutdown: {}", e);
        }
        info!("Scanner task stopped");
    }

    async fn apply_command(&mut self, command: ScannerCommand) -> BleResult<()> {
        match command {
            ScannerCommand::Initialize => self.initialize().await,
            ScannerCommand::StartDetecting => self.start_detecting().await,
            ScannerCommand::StopDetecting => self.stop_detecting().await,
            ScannerCommand::Join { game, player } => self.join(&game, player).await,
        }
    }

    // ------------------------------------------------------------------------
    // Central event handlers
    // ------------------------------------------------------------------------

    async fn on_radio_state(&mut self, radio: RadioState) -> BleResult<()> {
        self.radio = radio;

        if !radio.is_powered_on() {
            warn!("Central radio unavailable: {:?}", radio);
            self.scanning = false;
            self.connected.clear();
            self.requested_disconnects.clear();
            self.write_pending = None;
            self.current = None;
            self.fail_join();
            self.state = SessionState::Idle;
            self.set_status(SessionStatus::RadioUnavailable(radio));
            return Ok(());
        }

        if !self.initialized {
            self.initialized = true;
            info!("Central radio powered on");
            self.upward.emit(SessionEvent::Initialized(Role::Central));
        }
        self.set_status(SessionStatus::Ready);

        if self.detect_requested {
            self.begin_scan().await?;
        } else if self.current.is_none() {
            self.state = self.resting_state();
        }
        Ok(())
    }

    /// Platforms repeat discoveries for as long as a device keeps advertising,
    /// so anything dropped here is offered again once the slot frees up.
    async fn on_discovered(&mut self, peripheral: PeripheralHandle) -> BleResult<()> {
        if let Some(attempt) = self.current {
            trace!(
                "Ignoring {}: attempt with {} in flight",
                peripheral,
                attempt.peripheral
            );
            return Ok(());
        }
        if self.game_devices.values().any(|known| *known == peripheral) {
            trace!("Ignoring {}: game already read", peripheral);
            return Ok(());
        }

        self.set_status(SessionStatus::DiscoveredPeripheral);
        self.connect_to(peripheral).await
    }

    async fn on_connected(&mut self, peripheral: PeripheralHandle) -> BleResult<()> {
        self.connected.insert(peripheral);
        self.requested_disconnects.remove(&peripheral);

        if !self.is_current(peripheral) {
            debug!("{} connected outside the current attempt", peripheral);
            return Ok(());
        }

        self.state = SessionState::Connected(peripheral);
        self.set_status(SessionStatus::Connected);
        self.discover_game_service(peripheral).await
    }

    fn on_link_lost(&mut self, peripheral: PeripheralHandle, error: Option<String>) {
        self.connected.remove(&peripheral);
        if self.requested_disconnects.remove(&peripheral) {
            trace!("{} dropped as requested", peripheral);
            return;
        }
        if self.write_pending == Some(peripheral) {
            self.write_pending = None;
        }
        if !self.is_current(peripheral) {
            return;
        }

        match error {
            Some(e) => warn!("Lost {}: {}", peripheral, e),
            None => debug!("{} disconnected", peripheral),
        }
        self.fail_join();
        self.release_current();
    }

    // ------------------------------------------------------------------------
    // GATT client event handlers
    // ------------------------------------------------------------------------

    async fn on_services(
        &mut self,
        peripheral: PeripheralHandle,
        services: Vec<Uuid>,
        error: Option<String>,
    ) -> BleResult<()> {
        if !self.is_current(peripheral) {
            return Ok(());
        }
        if let Some(e) = error {
            warn!("Service discovery on {} failed: {}", peripheral, e);
            self.set_status(SessionStatus::ServiceMissing);
            return Ok(());
        }
        if !services.contains(&GAME_SERVICE_UUID) {
            warn!("{} does not expose the game service", peripheral);
            self.set_status(SessionStatus::ServiceMissing);
            return Ok(());
        }

        let target = if self.chosen.is_some() {
            PLAYER_INFO_CHARACTERISTIC_UUID
        } else {
            GAME_INFO_CHARACTERISTIC_UUID
        };
        self.state = SessionState::DiscoveringCharacteristics(peripheral);
        self.set_status(SessionStatus::DiscoveringCharacteristics);
        self.driver
            .discover_characteristics(peripheral, GAME_SERVICE_UUID, &[target])
            .await
    }

    async fn on_characteristics(
        &mut self,
        peripheral: PeripheralHandle,
        service: Uuid,
        characteristics: Vec<Uuid>,
        error: Option<String>,
    ) -> BleResult<()> {
        if !self.is_current(peripheral) || service != GAME_SERVICE_UUID {
            return Ok(());
        }
        if let Some(e) = error {
            warn!("Characteristic discovery on {} failed: {}", peripheral, e);
            self.set_status(SessionStatus::CharacteristicMissing);
            return Ok(());
        }

        if self.chosen.is_some() && characteristics.contains(&PLAYER_INFO_CHARACTERISTIC_UUID) {
            self.state = SessionState::WritingPlayerInfo(peripheral);
            self.write_pending = Some(peripheral);
            return self.write_player_info(peripheral).await;
        }
        if characteristics.contains(&GAME_INFO_CHARACTERISTIC_UUID) {
            self.state = SessionState::ReadingGameInfo(peripheral);
            self.set_status(SessionStatus::ReadingGameInfo);
            return self
                .driver
                .read_value(peripheral, GAME_INFO_CHARACTERISTIC_UUID)
                .await;
        }

        warn!("{} is missing the expected characteristic", peripheral);
        self.set_status(SessionStatus::CharacteristicMissing);
        Ok(())
    }

    async fn on_value(
        &mut self,
        peripheral: PeripheralHandle,
        characteristic: Uuid,
        value: Option<Vec<u8>>,
        error: Option<String>,
    ) -> BleResult<()> {
        if characteristic != GAME_INFO_CHARACTERISTIC_UUID {
            trace!("Ignoring value update for {}", characteristic);
            return Ok(());
        }
        if let Some(e) = error {
            warn!("Reading game info from {} failed: {}", peripheral, e);
            return Ok(());
        }
        let Some(data) = value else {
            return Ok(());
        };

        let game = match self.codec.decode_game(&data) {
            Ok(game) => game.as_remote(),
            Err(e) => {
                debug!(
                    "Dropping malformed game info from {} ({} bytes): {}",
                    peripheral,
                    data.len(),
                    e
                );
                return Ok(());
            }
        };

        info!("Discovered game '{}' on {}", game.name, peripheral);
        self.game_devices.insert(game.id, peripheral);

        if self.is_current(peripheral) {
            self.release_current();
            if self.config.disconnect_after_browse {
                self.request_disconnect(peripheral).await;
            }
        }

        self.upward
            .emit(SessionEvent::DiscoveredGame { game, peripheral });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn begin_scan(&mut self) -> BleResult<()> {
        if !self.scanning {
            self.driver.scan(GAME_SERVICE_UUID).await?;
            self.scanning = true;
            info!("Scanning for games");
        }
        if self.current.is_none() {
            self.state = SessionState::Scanning;
        }
        self.set_status(SessionStatus::Detecting);
        Ok(())
    }

    async fn connect_to(&mut self, peripheral: PeripheralHandle) -> BleResult<()> {
        self.current = Some(ConnectionAttempt::new(peripheral));
        self.state = SessionState::Connecting(peripheral);
        self.set_status(SessionStatus::Connecting);
        debug!("Connecting to {}", peripheral);

        if let Err(e) = self.driver.connect(peripheral).await {
            self.fail_join();
            self.release_current();
            return Err(e);
        }
        Ok(())
    }

    async fn discover_game_service(&mut self, peripheral: PeripheralHandle) -> BleResult<()> {
        self.state = SessionState::DiscoveringServices(peripheral);
        self.set_status(SessionStatus::DiscoveringServices);
        self.driver
            .discover_services(peripheral, &[GAME_SERVICE_UUID])
            .await
    }

    async fn write_player_info(&mut self, peripheral: PeripheralHandle) -> BleResult<()> {
        if self.write_pending != Some(peripheral) {
            trace!("{} ready to write, nothing pending", peripheral);
            return Ok(());
        }
        let Some(player) = self.chosen.as_ref().map(|intent| intent.player.clone()) else {
            self.write_pending = None;
            return Ok(());
        };
        if !self.driver.can_send_write_without_response(peripheral) {
            self.set_status(SessionStatus::WaitingForWriteReadiness);
            return Ok(());
        }

        let payload = match self.codec.encode_player(&player) {
            Ok(payload) => payload,
            Err(e) => {
                self.abandon_write();
                return Err(e.into());
            }
        };
        let max = self
            .driver
            .maximum_write_length(peripheral, WriteType::WithoutResponse);
        if payload.len() > max {
            self.abandon_write();
            return Err(BleSessionError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        self.set_status(SessionStatus::SendingPlayerInfo);
        trace!("Player info payload: {}", hex::encode(&payload));
        if let Err(e) = self
            .driver
            .write_value(
                peripheral,
                PLAYER_INFO_CHARACTERISTIC_UUID,
                &payload,
                WriteType::WithoutResponse,
            )
            .await
        {
            self.abandon_write();
            return Err(e);
        }

        self.write_pending = None;
        if let Some(intent) = self.chosen.take() {
            info!("Sent '{}' to {}", intent.player.name, peripheral);
            self.upward.emit(SessionEvent::JoinRequestSent {
                game_id: intent.game_id,
                player: intent.player,
            });
        }
        self.release_current();
        Ok(())
    }

    fn abandon_write(&mut self) {
        self.write_pending = None;
        self.fail_join();
        self.release_current();
    }

    async fn request_disconnect(&mut self, peripheral: PeripheralHandle) {
        self.connected.remove(&peripheral);
        self.requested_disconnects.insert(peripheral);
        if let Err(e) = self.driver.disconnect(peripheral).await {
            warn!("Failed to disconnect {}: {}", peripheral, e);
            self.requested_disconnects.remove(&peripheral);
        }
    }

    fn fail_join(&mut self) {
        if let Some(intent) = self.chosen.take() {
            warn!("Join as '{}' did not complete", intent.player.name);
            self.set_status(SessionStatus::JoinFailed);
        }
    }

    fn release_current(&mut self) {
        self.current = None;
        self.state = self.resting_state();
    }

    fn resting_state(&self) -> SessionState {
        if self.scanning {
            SessionState::Scanning
        } else if !self.game_devices.is_empty() {
            SessionState::AwaitingJoinChoice
        } else {
            SessionState::Idle
        }
    }

    fn is_current(&self, peripheral: PeripheralHandle) -> bool {
        self.current
            .map_or(false, |attempt| attempt.peripheral == peripheral)
    }

    fn set_status(&self, status: SessionStatus) {
        debug!("Scanner status: {}", status);
        self.upward.emit(SessionEvent::Status(Role::Central, status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::harness::{CentralCall, MockCentral};
    use charcount_core::SequentialIds;
    use std::time::Duration;
    use tokio_test::assert_ok;

    const P1: PeripheralHandle = PeripheralHandle::new(1);
    const P2: PeripheralHandle = PeripheralHandle::new(2);
    const P3: PeripheralHandle = PeripheralHandle::new(3);

    struct Fixture {
        scanner: Scanner<MockCentral>,
        mock: MockCentral,
        upward: Subscription<SessionEvent>,
    }

    fn fixture(config: BleSessionConfig) -> Fixture {
        let mut central_bus = EventBus::new();
        let mut gatt_bus = EventBus::new();
        let mut upward_bus = EventBus::new();
        let mock = MockCentral::new();
        let scanner = Scanner::new(
            mock.clone(),
            central_bus.subscribe().unwrap(),
            gatt_bus.subscribe().unwrap(),
            upward_bus.sender(),
            config,
        );
        Fixture {
            scanner,
            mock,
            upward: upward_bus.subscribe().unwrap(),
        }
    }

    async fn scanning_fixture() -> Fixture {
        let mut fx = fixture(BleSessionConfig::default());
        assert_ok!(
            fx.scanner
                .handle_central_event(CentralEvent::StateChanged(RadioState::PoweredOn))
                .await
        );
        assert_ok!(fx.scanner.start_detecting().await);
        fx.mock.clear_calls();
        fx
    }

    fn drain(upward: &mut Subscription<SessionEvent>) -> Vec<SessionEvent> {
        std::iter::from_fn(|| upward.try_recv()).collect()
    }

    fn greywall() -> GameInfo {
        GameInfo::new("Greywall", &SequentialIds::new())
    }

    fn bekri() -> PlayerInfo {
        PlayerInfo::new("Bekri", &SequentialIds::new()).with_armor_class(21)
    }

    async fn discover(fx: &mut Fixture, peripheral: PeripheralHandle) {
        assert_ok!(
            fx.scanner
                .handle_central_event(CentralEvent::DiscoveredPeripheral { peripheral })
                .await
        );
    }

    async fn connect(fx: &mut Fixture, peripheral: PeripheralHandle) {
        assert_ok!(
            fx.scanner
                .handle_central_event(CentralEvent::Connected { peripheral })
                .await
        );
    }

    async fn services(fx: &mut Fixture, peripheral: PeripheralHandle) {
        assert_ok!(
            fx.scanner
                .handle_peripheral_event(PeripheralEvent::DiscoveredServices {
                    peripheral,
                    services: vec![GAME_SERVICE_UUID],
                    error: None,
                })
                .await
        );
    }

    async fn characteristics(fx: &mut Fixture, peripheral: PeripheralHandle, found: Uuid) {
        assert_ok!(
            fx.scanner
                .handle_peripheral_event(PeripheralEvent::DiscoveredCharacteristics {
                    peripheral,
                    service: GAME_SERVICE_UUID,
                    characteristics: vec![found],
                    error: None,
                })
                .await
        );
    }

    async fn game_value(fx: &mut Fixture, peripheral: PeripheralHandle, value: Vec<u8>) {
        assert_ok!(
            fx.scanner
                .handle_peripheral_event(PeripheralEvent::ValueUpdated {
                    peripheral,
                    characteristic: GAME_INFO_CHARACTERISTIC_UUID,
                    value: Some(value),
                    error: None,
                })
                .await
        );
    }

    /// Run a full browse of `game` on `peripheral`
    async fn browse(fx: &mut Fixture, peripheral: PeripheralHandle, game: &GameInfo) {
        discover(fx, peripheral).await;
        connect(fx, peripheral).await;
        services(fx, peripheral).await;
        characteristics(fx, peripheral, GAME_INFO_CHARACTERISTIC_UUID).await;
        game_value(fx, peripheral, WireCodec::default().encode_game(game).unwrap()).await;
    }

    #[tokio::test]
    async fn test_initialize_emits_once_and_scans() {
        let mut central_bus = EventBus::new();
        let mut gatt_bus = EventBus::new();
        let mut upward_bus = EventBus::new();
        let mock = MockCentral::new();
        let radio = central_bus.sender();
        let mut scanner = Scanner::new(
            mock.clone(),
            central_bus.subscribe().unwrap(),
            gatt_bus.subscribe().unwrap(),
            upward_bus.sender(),
            BleSessionConfig::default(),
        );
        let mut upward = upward_bus.subscribe().unwrap();

        radio.emit(CentralEvent::StateChanged(RadioState::Unknown));
        radio.emit(CentralEvent::StateChanged(RadioState::PoweredOn));
        assert_ok!(scanner.initialize().await);

        assert_eq!(mock.calls(), vec![CentralCall::Scan(GAME_SERVICE_UUID)]);
        assert_eq!(scanner.state(), SessionState::Scanning);
        let initialized = drain(&mut upward)
            .into_iter()
            .filter(|e| *e == SessionEvent::Initialized(Role::Central))
            .count();
        assert_eq!(initialized, 1);

        // Repeated start keeps the one scan
        assert_ok!(scanner.start_detecting().await);
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_only_first_discovery_connects() {
        let mut fx = scanning_fixture().await;

        discover(&mut fx, P1).await;
        discover(&mut fx, P2).await;
        discover(&mut fx, P3).await;

        assert_eq!(fx.mock.connects(), vec![P1]);
        assert_eq!(fx.scanner.state(), SessionState::Connecting(P1));
        assert_eq!(fx.scanner.current_peripheral(), Some(P1));
    }

    #[tokio::test]
    async fn test_repeated_discovery_reaches_host_seen_while_busy() {
        let mut fx = scanning_fixture().await;
        let game = greywall();

        discover(&mut fx, P1).await;
        discover(&mut fx, P2).await;
        // Updates for the peripheral in flight change nothing
        discover(&mut fx, P1).await;
        assert_eq!(fx.mock.connects(), vec![P1]);

        connect(&mut fx, P1).await;
        services(&mut fx, P1).await;
        characteristics(&mut fx, P1, GAME_INFO_CHARACTERISTIC_UUID).await;
        game_value(&mut fx, P1, WireCodec::default().encode_game(&game).unwrap()).await;
        assert_eq!(fx.scanner.current_peripheral(), None);

        discover(&mut fx, P1).await;
        discover(&mut fx, P2).await;

        assert_eq!(fx.mock.connects(), vec![P1, P2]);
        assert_eq!(fx.scanner.state(), SessionState::Connecting(P2));
    }

    #[tokio::test]
    async fn test_failed_connect_frees_slot() {
        let mut fx = scanning_fixture().await;

        discover(&mut fx, P1).await;
        assert_ok!(
            fx.scanner
                .handle_central_event(CentralEvent::FailedToConnect {
                    peripheral: P1,
                    error: Some("timeout".into()),
                })
                .await
        );
        assert_eq!(fx.scanner.state(), SessionState::Scanning);

        discover(&mut fx, P2).await;
        assert_eq!(fx.mock.connects(), vec![P1, P2]);
    }

    #[tokio::test]
    async fn test_connect_refused_by_driver_frees_slot() {
        let mut fx = scanning_fixture().await;
        fx.mock.fail_connects(true);

        assert!(fx
            .scanner
            .handle_central_event(CentralEvent::DiscoveredPeripheral { peripheral: P1 })
            .await
            .is_err());
        assert_eq!(fx.scanner.current_peripheral(), None);
    }

    #[tokio::test]
    async fn test_browse_targets_game_info() {
        let mut fx = scanning_fixture().await;

        discover(&mut fx, P1).await;
        connect(&mut fx, P1).await;
        services(&mut fx, P1).await;

        assert!(fx.mock.calls().contains(&CentralCall::DiscoverServices(
            P1,
            vec![GAME_SERVICE_UUID]
        )));
        assert_eq!(
            fx.mock.calls().last(),
            Some(&CentralCall::DiscoverCharacteristics(
                P1,
                GAME_SERVICE_UUID,
                vec![GAME_INFO_CHARACTERISTIC_UUID]
            ))
        );

        characteristics(&mut fx, P1, GAME_INFO_CHARACTERISTIC_UUID).await;
        assert_eq!(
            fx.mock.calls().last(),
            Some(&CentralCall::ReadValue(P1, GAME_INFO_CHARACTERISTIC_UUID))
        );
        assert_eq!(fx.scanner.state(), SessionState::ReadingGameInfo(P1));
    }

    #[tokio::test]
    async fn test_peer_connected_event_counts_while_connecting() {
        let mut fx = scanning_fixture().await;

        discover(&mut fx, P1).await;
        assert_ok!(
            fx.scanner
                .handle_central_event(CentralEvent::ConnectionEvent {
                    peripheral: P1,
                    event: ConnectionEventKind::PeerConnected,
                })
                .await
        );
        assert_eq!(fx.scanner.state(), SessionState::DiscoveringServices(P1));
    }

    #[tokio::test]
    async fn test_game_info_read_emits_remote_copy() {
        let mut fx = scanning_fixture().await;
        let game = greywall();
        drain(&mut fx.upward);

        browse(&mut fx, P1, &game).await;

        let discovered: Vec<_> = drain(&mut fx.upward)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::DiscoveredGame { game, peripheral } => Some((game, peripheral)),
                _ => None,
            })
            .collect();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].0.id, game.id);
        assert_eq!(discovered[0].0.name, "Greywall");
        assert!(!discovered[0].0.is_creator);
        assert_eq!(discovered[0].1, P1);

        assert_eq!(fx.scanner.current_peripheral(), None);
        assert_eq!(fx.scanner.peripheral_for(&game.id), Some(P1));
        assert!(fx.mock.calls().contains(&CentralCall::Disconnect(P1)));

        // Slot is free for the next host; the browsed one is skipped
        discover(&mut fx, P1).await;
        discover(&mut fx, P2).await;
        assert_eq!(fx.mock.connects(), vec![P1, P2]);
    }

    #[tokio::test]
    async fn test_malformed_game_info_is_dropped() {
        let mut fx = scanning_fixture().await;
        drain(&mut fx.upward);

        discover(&mut fx, P1).await;
        connect(&mut fx, P1).await;
        services(&mut fx, P1).await;
        characteristics(&mut fx, P1, GAME_INFO_CHARACTERISTIC_UUID).await;
        game_value(&mut fx, P1, vec![1, 1, 0xFF]).await;

        assert!(drain(&mut fx.upward)
            .iter()
            .all(|e| !matches!(e, SessionEvent::DiscoveredGame { .. })));
        assert_eq!(fx.scanner.current_peripheral(), Some(P1));
    }

    #[tokio::test]
    async fn test_missing_service_stalls() {
        let mut fx = scanning_fixture().await;
        discover(&mut fx, P1).await;
        connect(&mut fx, P1).await;
        let calls_before = fx.mock.calls().len();

        assert_ok!(
            fx.scanner
                .handle_peripheral_event(PeripheralEvent::DiscoveredServices {
                    peripheral: P1,
                    services: vec![],
                    error: None,
                })
                .await
        );

        assert_eq!(fx.mock.calls().len(), calls_before);
        assert_eq!(fx.scanner.current_peripheral(), Some(P1));
        assert!(drain(&mut fx.upward).contains(&SessionEvent::Status(
            Role::Central,
            SessionStatus::ServiceMissing
        )));
    }

    #[tokio::test]
    async fn test_join_targets_player_info_and_writes() {
        let mut fx = scanning_fixture().await;
        let game = greywall();
        browse(&mut fx, P1, &game).await;
        fx.mock.clear_calls();
        drain(&mut fx.upward);

        assert_ok!(fx.scanner.join(&game, bekri()).await);
        assert_eq!(fx.mock.connects(), vec![P1]);

        connect(&mut fx, P1).await;
        services(&mut fx, P1).await;
        assert_eq!(
            fx.mock.calls().last(),
            Some(&CentralCall::DiscoverCharacteristics(
                P1,
                GAME_SERVICE_UUID,
                vec![PLAYER_INFO_CHARACTERISTIC_UUID]
            ))
        );

        characteristics(&mut fx, P1, PLAYER_INFO_CHARACTERISTIC_UUID).await;
        let writes = fx.mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1, PLAYER_INFO_CHARACTERISTIC_UUID);
        assert_eq!(
            WireCodec::default().decode_player(&writes[0].2).unwrap(),
            bekri()
        );
        assert!(fx.mock.calls().contains(&CentralCall::WriteValue(
            P1,
            PLAYER_INFO_CHARACTERISTIC_UUID,
            writes[0].2.clone(),
            WriteType::WithoutResponse
        )));

        assert!(fx.scanner.chosen_character().is_none());
        assert!(drain(&mut fx.upward).contains(&SessionEvent::JoinRequestSent {
            game_id: game.id,
            player: bekri(),
        }));
    }

    #[tokio::test]
    async fn test_write_waits_for_readiness() {
        let mut fx = scanning_fixture().await;
        let game = greywall();
        browse(&mut fx, P1, &game).await;
        fx.mock.set_write_ready(false);

        assert_ok!(fx.scanner.join(&game, bekri()).await);
        connect(&mut fx, P1).await;
        services(&mut fx, P1).await;
        characteristics(&mut fx, P1, PLAYER_INFO_CHARACTERISTIC_UUID).await;
        assert!(fx.mock.writes().is_empty());
        assert_eq!(fx.scanner.state(), SessionState::WritingPlayerInfo(P1));

        fx.mock.set_write_ready(true);
        for _ in 0..3 {
            assert_ok!(
                fx.scanner
                    .handle_peripheral_event(PeripheralEvent::ReadyToWriteWithoutResponse {
                        peripheral: P1
                    })
                    .await
            );
        }
        assert_eq!(fx.mock.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_readiness_without_join_writes_nothing() {
        let mut fx = scanning_fixture().await;
        browse(&mut fx, P1, &greywall()).await;

        for peripheral in [P1, P2] {
            assert_ok!(
                fx.scanner
                    .handle_peripheral_event(PeripheralEvent::ReadyToWriteWithoutResponse {
                        peripheral
                    })
                    .await
            );
        }
        assert!(fx.mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_join_unknown_game_fails() {
        let mut fx = scanning_fixture().await;
        let game = greywall();
        assert!(matches!(
            fx.scanner.join(&game, bekri()).await,
            Err(BleSessionError::UnknownGame { game_id }) if game_id == game.id
        ));
        assert!(fx.mock.connects().is_empty());
    }

    #[tokio::test]
    async fn test_join_reuses_live_connection() {
        let mut fx = fixture(BleSessionConfig::default().with_disconnect_after_browse(false));
        assert_ok!(
            fx.scanner
                .handle_central_event(CentralEvent::StateChanged(RadioState::PoweredOn))
                .await
        );
        let game = greywall();
        browse(&mut fx, P1, &game).await;
        fx.mock.clear_calls();

        assert_ok!(fx.scanner.join(&game, bekri()).await);
        assert!(fx.mock.connects().is_empty());
        assert_eq!(
            fx.mock.calls(),
            vec![CentralCall::DiscoverServices(P1, vec![GAME_SERVICE_UUID])]
        );
    }

    #[tokio::test]
    async fn test_join_abandons_in_flight_browse() {
        let mut fx = scanning_fixture().await;
        let game = greywall();
        browse(&mut fx, P1, &game).await;
        discover(&mut fx, P2).await;
        fx.mock.clear_calls();

        assert_ok!(fx.scanner.join(&game, bekri()).await);
        assert_eq!(
            fx.mock.calls(),
            vec![CentralCall::Disconnect(P2), CentralCall::Connect(P1)]
        );

        // The requested drop of P2 does not disturb the join
        assert_ok!(
            fx.scanner
                .handle_central_event(CentralEvent::Disconnected {
                    peripheral: P2,
                    error: None,
                })
                .await
        );
        assert_eq!(fx.scanner.current_peripheral(), Some(P1));
        assert!(fx.scanner.chosen_character().is_some());
    }

    #[tokio::test]
    async fn test_disconnect_during_join_reports_failure() {
        let mut fx = scanning_fixture().await;
        let game = greywall();
        browse(&mut fx, P1, &game).await;
        assert_ok!(fx.scanner.join(&game, bekri()).await);
        connect(&mut fx, P1).await;
        drain(&mut fx.upward);

        assert_ok!(
            fx.scanner
                .handle_central_event(CentralEvent::Disconnected {
                    peripheral: P1,
                    error: Some("link lost".into()),
                })
                .await
        );

        assert!(fx.scanner.chosen_character().is_none());
        assert_eq!(fx.scanner.current_peripheral(), None);
        assert!(drain(&mut fx.upward)
            .contains(&SessionEvent::Status(Role::Central, SessionStatus::JoinFailed)));
    }

    #[tokio::test]
    async fn test_oversized_player_payload_is_refused() {
        let mut fx = scanning_fixture().await;
        let game = greywall();
        browse(&mut fx, P1, &game).await;
        fx.mock.set_maximum_write_length(8);

        assert_ok!(fx.scanner.join(&game, bekri()).await);
        connect(&mut fx, P1).await;
        services(&mut fx, P1).await;
        let result = fx
            .scanner
            .handle_peripheral_event(PeripheralEvent::DiscoveredCharacteristics {
                peripheral: P1,
                service: GAME_SERVICE_UUID,
                characteristics: vec![PLAYER_INFO_CHARACTERISTIC_UUID],
                error: None,
            })
            .await;

        assert!(matches!(
            result,
            Err(BleSessionError::PayloadTooLarge { max: 8, .. })
        ));
        assert!(fx.mock.writes().is_empty());
        assert!(fx.scanner.chosen_character().is_none());
        assert_eq!(fx.scanner.current_peripheral(), None);
    }

    #[tokio::test]
    async fn test_stalled_connection_times_out() {
        let mut fx = fixture(
            BleSessionConfig::default().with_connection_timeout(Duration::from_secs(5)),
        );
        assert_ok!(
            fx.scanner
                .handle_central_event(CentralEvent::StateChanged(RadioState::PoweredOn))
                .await
        );
        discover(&mut fx, P1).await;

        let deadline = fx.scanner.connection_deadline().unwrap();
        assert_ok!(
            fx.scanner
                .expire_stalled_connection(deadline - Duration::from_secs(1))
                .await
        );
        assert_eq!(fx.scanner.current_peripheral(), Some(P1));

        assert_ok!(fx.scanner.expire_stalled_connection(deadline).await);
        assert_eq!(fx.scanner.current_peripheral(), None);
        assert!(fx.mock.calls().contains(&CentralCall::Disconnect(P1)));

        discover(&mut fx, P2).await;
        assert_eq!(fx.scanner.current_peripheral(), Some(P2));
    }

    #[tokio::test]
    async fn test_radio_loss_resets_scanner() {
        let mut fx = scanning_fixture().await;
        discover(&mut fx, P1).await;

        assert_ok!(
            fx.scanner
                .handle_central_event(CentralEvent::StateChanged(RadioState::PoweredOff))
                .await
        );
        assert_eq!(fx.scanner.state(), SessionState::Idle);
        assert!(!fx.scanner.is_scanning());
        assert_eq!(fx.scanner.current_peripheral(), None);

        fx.mock.clear_calls();
        assert_ok!(
            fx.scanner
                .handle_central_event(CentralEvent::StateChanged(RadioState::PoweredOn))
                .await
        );
        assert_eq!(fx.mock.calls(), vec![CentralCall::Scan(GAME_SERVICE_UUID)]);
    }

    #[tokio::test]
    async fn test_stop_detecting_keeps_in_flight_attempt() {
        let mut fx = scanning_fixture().await;
        discover(&mut fx, P1).await;

        assert_ok!(fx.scanner.stop_detecting().await);
        assert!(fx.mock.calls().contains(&CentralCall::StopScan));
        assert!(!fx.mock.calls().contains(&CentralCall::Disconnect(P1)));
        assert_eq!(fx.scanner.state(), SessionState::Connecting(P1));
    }
}
