//! Command handlers for the CharCount CLI

use std::sync::Arc;
use std::time::Duration;

use charcount_ble::{
    BleSessionConfig, BtleplugCentral, EventBus, PlatformPeripheralManager, RadioState,
    SessionCoordinator, SessionEvent, SessionStatus,
};
use charcount_core::{GameInfo, PlayerInfo, RandomIds};
use tracing::{debug, info};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Output
// ----------------------------------------------------------------------------

/// Renders games and players as text or JSON lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    pub json: bool,
}

impl Output {
    pub fn format_game(&self, game: &GameInfo) -> Result<String> {
        if self.json {
            return Ok(serde_json::to_string(game)?);
        }
        Ok(format!("{}  ({})", game.name, game.id))
    }

    pub fn format_player(&self, player: &PlayerInfo) -> Result<String> {
        if self.json {
            return Ok(serde_json::to_string(player)?);
        }
        Ok(format!(
            "{} joined  AC {}  spell DC {}  passive perception {}",
            player.name, player.armor_class, player.spell_save_dc, player.passive_perception
        ))
    }
}

/// Radio states a session cannot recover from on its own
pub fn fatal_radio_state(event: &SessionEvent) -> Option<RadioState> {
    match event {
        SessionEvent::Status(_, SessionStatus::RadioUnavailable(state))
            if matches!(state, RadioState::Unsupported | RadioState::Unauthorized) =>
        {
            Some(*state)
        }
        _ => None,
    }
}

fn radio_error(state: RadioState) -> CliError {
    CliError::SessionEnded(format!("Bluetooth radio is {:?}", state))
}

// ----------------------------------------------------------------------------
// Command Dispatcher
// ----------------------------------------------------------------------------

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        let output = Output {
            json: cli.json || config.cli.json,
        };
        let session = config.ble.session_config();

        match cli.command {
            Commands::Host { name } => Self::handle_host_command(session, output, name).await,
            Commands::Browse { duration } => {
                Self::handle_browse_command(session, output, Duration::from_secs(duration)).await
            }
            Commands::Join {
                game,
                name,
                armor_class,
                spell_save_dc,
                passive_perception,
                timeout,
            } => {
                let player = PlayerInfo::new(name, &RandomIds)
                    .with_armor_class(armor_class)
                    .with_spell_save_dc(spell_save_dc)
                    .with_passive_perception(passive_perception);
                Self::handle_join_command(
                    session,
                    output,
                    game,
                    player,
                    Duration::from_secs(timeout),
                )
                .await
            }
        }
    }

    async fn player_session(config: BleSessionConfig) -> Result<SessionCoordinator> {
        let mut coordinator = SessionCoordinator::new(config, Arc::new(RandomIds));
        let mut central_bus = EventBus::new();
        let mut gatt_bus = EventBus::new();
        let driver = BtleplugCentral::new(central_bus.sender(), gatt_bus.sender()).await?;
        coordinator.attach_scanner(driver, central_bus.subscribe()?, gatt_bus.subscribe()?);
        coordinator.request_permission()?;
        Ok(coordinator)
    }

    async fn host_session(config: BleSessionConfig) -> Result<SessionCoordinator> {
        let mut coordinator = SessionCoordinator::new(config, Arc::new(RandomIds));
        let mut bus = EventBus::new();
        let driver = PlatformPeripheralManager::new(bus.sender()).await?;
        coordinator.attach_advertiser(driver, bus.subscribe()?);
        coordinator.request_permission()?;
        Ok(coordinator)
    }

    /// Handle the host command
    async fn handle_host_command(
        config: BleSessionConfig,
        output: Output,
        name: String,
    ) -> Result<()> {
        let mut coordinator = Self::host_session(config).await?;
        let game = coordinator.host_game(name)?;
        if !output.json {
            println!("Hosting '{}'. Press Ctrl+C to stop...", game.name);
        }

        let result = loop {
            tokio::select! {
                event = coordinator.next_event() => match event {
                    Some(SessionEvent::PlayerJoined(player)) => {
                        println!("{}", output.format_player(&player)?);
                    }
                    Some(event) => {
                        if let Some(state) = fatal_radio_state(&event) {
                            break Err(radio_error(state));
                        }
                    }
                    None => break Err(CliError::SessionEnded("event bus closed".to_string())),
                },
                _ = tokio::signal::ctrl_c() => break Ok(()),
            }
        };

        if let Err(e) = coordinator.stop_hosting() {
            debug!("Failed to stop hosting: {}", e);
        }
        coordinator.shutdown().await;
        result
    }

    /// Handle the browse command
    async fn handle_browse_command(
        config: BleSessionConfig,
        output: Output,
        duration: Duration,
    ) -> Result<()> {
        let mut coordinator = Self::player_session(config).await?;
        info!("Scanning for games for {:?}", duration);

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                event = coordinator.next_event() => match event {
                    Some(SessionEvent::DiscoveredGame { game, .. }) => {
                        println!("{}", output.format_game(&game)?);
                    }
                    Some(event) => {
                        if let Some(state) = fatal_radio_state(&event) {
                            break Err(radio_error(state));
                        }
                    }
                    None => break Err(CliError::SessionEnded("event bus closed".to_string())),
                },
                _ = &mut deadline => break Ok(()),
                _ = tokio::signal::ctrl_c() => break Ok(()),
            }
        };

        if result.is_ok() && coordinator.games().is_empty() && !output.json {
            println!("No games found");
        }
        coordinator.shutdown().await;
        result
    }

    /// Handle the join command
    async fn handle_join_command(
        config: BleSessionConfig,
        output: Output,
        game_name: String,
        player: PlayerInfo,
        wait: Duration,
    ) -> Result<()> {
        let mut coordinator = Self::player_session(config).await?;

        let result = tokio::time::timeout(
            wait,
            Self::find_and_join(&mut coordinator, &game_name, player),
        )
        .await
        .unwrap_or_else(|_| {
            Err(CliError::Timeout(format!(
                "'{}' did not accept a join within {:?}",
                game_name, wait
            )))
        });

        if let Ok(game) = &result {
            if output.json {
                println!("{}", output.format_game(game)?);
            } else {
                println!("Sent join request to '{}'", game.name);
            }
        }
        coordinator.shutdown().await;
        result.map(|_| ())
    }

    async fn find_and_join(
        coordinator: &mut SessionCoordinator,
        game_name: &str,
        player: PlayerInfo,
    ) -> Result<GameInfo> {
        let mut target: Option<GameInfo> = None;

        while let Some(event) = coordinator.next_event().await {
            if let Some(state) = fatal_radio_state(&event) {
                return Err(radio_error(state));
            }
            match event {
                SessionEvent::DiscoveredGame { game, .. }
                    if target.is_none() && game.name == game_name =>
                {
                    info!("Found '{}'; joining as '{}'", game.name, player.name);
                    coordinator.join(game.id, player.clone())?;
                    target = Some(game);
                }
                SessionEvent::JoinRequestSent { game_id, .. } => {
                    if let Some(game) = target.take().filter(|g| g.id == game_id) {
                        return Ok(game);
                    }
                }
                SessionEvent::Status(_, SessionStatus::JoinFailed) if target.is_some() => {
                    return Err(CliError::SessionEnded(format!(
                        "joining '{}' failed",
                        game_name
                    )));
                }
                _ => {}
            }
        }

        Err(CliError::GameNotFound(game_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use charcount_ble::Role;
    use charcount_core::SequentialIds;

    #[test]
    fn test_text_output() {
        let ids = SequentialIds::new();
        let output = Output { json: false };

        let game = GameInfo::new("Greywall", &ids);
        assert_eq!(
            output.format_game(&game).unwrap(),
            format!("Greywall  ({})", game.id)
        );

        let player = PlayerInfo::new("Bekri", &ids)
            .with_armor_class(21)
            .with_spell_save_dc(15)
            .with_passive_perception(12);
        assert_eq!(
            output.format_player(&player).unwrap(),
            "Bekri joined  AC 21  spell DC 15  passive perception 12"
        );
    }

    #[test]
    fn test_json_output_round_trips() {
        let ids = SequentialIds::new();
        let output = Output { json: true };

        let player = PlayerInfo::new("Bekri", &ids).with_armor_class(21);
        let line = output.format_player(&player).unwrap();
        let parsed: PlayerInfo = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, player);
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_fatal_radio_states() {
        let unsupported = SessionEvent::Status(
            Role::Peripheral,
            SessionStatus::RadioUnavailable(RadioState::Unsupported),
        );
        assert_eq!(
            fatal_radio_state(&unsupported),
            Some(RadioState::Unsupported)
        );

        let powered_off = SessionEvent::Status(
            Role::Central,
            SessionStatus::RadioUnavailable(RadioState::PoweredOff),
        );
        assert_eq!(fatal_radio_state(&powered_off), None);
        assert_eq!(
            fatal_radio_state(&SessionEvent::Initialized(Role::Central)),
            None
        );
    }
}
