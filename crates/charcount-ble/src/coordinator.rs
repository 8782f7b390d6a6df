//! Session coordinator: the facade an application drives
//!
//! The coordinator runs each attached role on its own task and talks to it
//! through a command channel. Role outcomes come back on one shared upward
//! channel; [`SessionCoordinator::next_event`] folds each one into the
//! observable session state (status, discovered games, chosen character,
//! joined players) before handing it to the caller.

use std::sync::Arc;
use std::time::Duration;

use charcount_core::{GameInfo, IdGenerator, PlayerInfo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advertiser::{Advertiser, AdvertiserCommand};
use crate::config::{BleSessionConfig, DedupPolicy};
use crate::driver::{CentralDriver, PeripheralManagerDriver};
use crate::error::{BleResult, BleSessionError};
use crate::events::{
    event_channel, CentralEvent, EventSender, PeripheralEvent, PeripheralManagerEvent, Role,
    SessionEvent, SessionStatus, Subscription,
};
use crate::scanner::{Scanner, ScannerCommand};

// ----------------------------------------------------------------------------
// Role Tasks
// ----------------------------------------------------------------------------

/// How long a role gets to stop advertising or scanning before it is aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct RoleTask<C> {
    role: Role,
    commands: mpsc::UnboundedSender<C>,
    task: JoinHandle<()>,
}

impl<C> RoleTask<C> {
    fn send(&self, command: C) -> BleResult<()> {
        self.commands
            .send(command)
            .map_err(|_| BleSessionError::RoleNotAttached(self.role))
    }

    /// A role still waiting for its radio never sees the closed command
    /// channel, so it is aborted once the grace period runs out.
    async fn shutdown(self) {
        drop(self.commands);
        let mut task = self.task;
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} task ended abnormally: {}", self.role, e),
            Err(_) => {
                warn!("{} task did not stop in time; aborting", self.role);
                task.abort();
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Coordinator
// ----------------------------------------------------------------------------

/// Facade over the scanner and advertiser roles
pub struct SessionCoordinator {
    config: BleSessionConfig,
    ids: Arc<dyn IdGenerator>,
    upward: EventSender<SessionEvent>,
    events: Subscription<SessionEvent>,
    scanner: Option<RoleTask<ScannerCommand>>,
    advertiser: Option<RoleTask<AdvertiserCommand>>,
    status: SessionStatus,
    games: Vec<GameInfo>,
    chosen_character: Option<PlayerInfo>,
    hosted_game: Option<GameInfo>,
    joined_players: Vec<PlayerInfo>,
}

impl SessionCoordinator {
    pub fn new(config: BleSessionConfig, ids: Arc<dyn IdGenerator>) -> Self {
        let (upward, events) = event_channel();

        Self {
            config,
            ids,
            upward,
            events,
            scanner: None,
            advertiser: None,
            status: SessionStatus::Uninitialized,
            games: Vec::new(),
            chosen_character: None,
            hosted_game: None,
            joined_players: Vec::new(),
        }
    }

    /// Sender roles built outside the coordinator should report to
    pub fn events_sender(&self) -> EventSender<SessionEvent> {
        self.upward.clone()
    }

    /// Run a scanner over `driver` on its own task
    pub fn attach_scanner<D>(
        &mut self,
        driver: D,
        central_events: Subscription<CentralEvent>,
        peripheral_events: Subscription<PeripheralEvent>,
    ) where
        D: CentralDriver + 'static,
    {
        let scanner = Scanner::new(
            driver,
            central_events,
            peripheral_events,
            self.upward.clone(),
            self.config.clone(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(scanner.run(rx));
        debug!("Scanner attached");
        self.scanner = Some(RoleTask {
            role: Role::Central,
            commands: tx,
            task,
        });
    }

    /// Run an advertiser over `driver` on its own task
    pub fn attach_advertiser<D>(&mut self, driver: D, events: Subscription<PeripheralManagerEvent>)
    where
        D: PeripheralManagerDriver + 'static,
    {
        let advertiser = Advertiser::new(driver, events, self.upward.clone(), self.config.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(advertiser.run(rx));
        debug!("Advertiser attached");
        self.advertiser = Some(RoleTask {
            role: Role::Peripheral,
            commands: tx,
            task,
        });
    }

    /// Bring up every attached role; the platform prompts for Bluetooth access here
    pub fn request_permission(&mut self) -> BleResult<()> {
        if self.scanner.is_none() && self.advertiser.is_none() {
            return Err(BleSessionError::RoleNotAttached(Role::Central));
        }
        if let Some(scanner) = &self.scanner {
            scanner.send(ScannerCommand::Initialize)?;
        }
        if let Some(advertiser) = &self.advertiser {
            advertiser.send(AdvertiserCommand::Initialize)?;
        }
        self.status = SessionStatus::Initializing;
        Ok(())
    }

    pub fn start_detecting(&mut self) -> BleResult<()> {
        self.scanner()?.send(ScannerCommand::StartDetecting)
    }

    pub fn stop_detecting(&mut self) -> BleResult<()> {
        self.scanner()?.send(ScannerCommand::StopDetecting)
    }

    /// Join a previously discovered game as `player`
    pub fn join(&mut self, game_id: Uuid, player: PlayerInfo) -> BleResult<()> {
        let game = self
            .games
            .iter()
            .find(|game| game.id == game_id)
            .cloned()
            .ok_or(BleSessionError::UnknownGame { game_id })?;

        self.scanner()?.send(ScannerCommand::Join {
            game,
            player: player.clone(),
        })?;
        self.chosen_character = Some(player);
        Ok(())
    }

    /// Create a game named `name`, bring the advertiser up, and start advertising it
    pub fn host_game(&mut self, name: impl Into<String>) -> BleResult<GameInfo> {
        let game = GameInfo::new(name, self.ids.as_ref());
        let advertiser = self.advertiser()?;
        // Returns at once when the radio is already up
        advertiser.send(AdvertiserCommand::Initialize)?;
        advertiser.send(AdvertiserCommand::StartAdvertising(game.clone()))?;
        info!("Hosting game '{}' ({})", game.name, game.id);
        self.hosted_game = Some(game.clone());
        self.joined_players.clear();
        Ok(game)
    }

    pub fn stop_hosting(&mut self) -> BleResult<()> {
        self.advertiser()?.send(AdvertiserCommand::StopAdvertising)
    }

    /// Wait for the next role event and fold it into the session state
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = self.events.recv().await?;
        self.apply(&event);
        Some(event)
    }

    /// Fold one role event into the session state
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Initialized(role) => {
                debug!("{} role initialized", role);
                self.status = SessionStatus::Ready;
            }
            SessionEvent::DiscoveredGame { game, .. } => self.collect_game(game.clone()),
            SessionEvent::PlayerJoined(player) => {
                if let Some(game) = self.hosted_game.as_mut() {
                    game.player_count = game.player_count.saturating_add(1);
                }
                self.joined_players.push(player.clone());
            }
            SessionEvent::JoinRequestSent { .. } => self.chosen_character = None,
            SessionEvent::Status(_, status) => {
                if *status == SessionStatus::JoinFailed {
                    self.chosen_character = None;
                }
                self.status = status.clone();
            }
        }
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Games discovered this session, de-duplicated per the configured policy
    pub fn games(&self) -> &[GameInfo] {
        &self.games
    }

    pub fn chosen_character(&self) -> Option<&PlayerInfo> {
        self.chosen_character.as_ref()
    }

    pub fn hosted_game(&self) -> Option<&GameInfo> {
        self.hosted_game.as_ref()
    }

    pub fn joined_players(&self) -> &[PlayerInfo] {
        &self.joined_players
    }

    /// Stop both roles and wait for their tasks to wind down
    pub async fn shutdown(mut self) {
        if let Some(scanner) = self.scanner.take() {
            scanner.shutdown().await;
        }
        if let Some(advertiser) = self.advertiser.take() {
            advertiser.shutdown().await;
        }
        info!("Session coordinator stopped");
    }

    fn collect_game(&mut self, game: GameInfo) {
        let existing = match self.config.dedup {
            DedupPolicy::ById => self.games.iter().position(|known| known.id == game.id),
            DedupPolicy::ByName => self.games.iter().position(|known| known.name == game.name),
        };

        match (existing, self.config.dedup) {
            (Some(index), DedupPolicy::ById) => self.games[index] = game,
            (Some(_), DedupPolicy::ByName) => debug!("Already listed a game named '{}'", game.name),
            (None, _) => self.games.push(game),
        }
    }

    fn scanner(&self) -> BleResult<&RoleTask<ScannerCommand>> {
        self.scanner
            .as_ref()
            .ok_or(BleSessionError::RoleNotAttached(Role::Central))
    }

    fn advertiser(&self) -> BleResult<&RoleTask<AdvertiserCommand>> {
        self.advertiser
            .as_ref()
            .ok_or(BleSessionError::RoleNotAttached(Role::Peripheral))
    }
}
