//! Headless driver for a snake node.
//!
//! The graphical lobby lives elsewhere; this binary covers the same inputs
//! from the command line: create a game, join a discovered one, or just list
//! what is being announced on the local network.

use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::sync::mpsc;

use node::app::{App, AppEvent, UiCommand};
use shared::GameConfig;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Player name announced to other nodes
    #[arg(short, long, default_value = "Player")]
    name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a new game and start announcing it
    Create {
        /// Game name shown in other players' lobbies
        #[arg(short, long, default_value = "snake")]
        game: String,

        /// Field width in cells (10..=100)
        #[arg(long, default_value_t = 40)]
        width: i32,

        /// Field height in cells (10..=100)
        #[arg(long, default_value_t = 30)]
        height: i32,

        /// Foods that exist regardless of player count (0..=100)
        #[arg(long, default_value_t = 25)]
        food: i32,

        /// Tick period in milliseconds (100..=3000)
        #[arg(long, default_value_t = 200)]
        delay: i32,
    },

    /// Join a game announced on the local network
    Join {
        /// Name of the announced game
        #[arg(short, long)]
        game: String,

        /// Watch without playing
        #[arg(long)]
        viewer: bool,
    },

    /// Print games currently announced on the local network
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info snake-node ...");
    }

    let args = Args::parse();

    let (app, mut events) = App::new().await?;
    app.start().await;
    let input = app.input();

    match args.command {
        Command::Create {
            game,
            width,
            height,
            food,
            delay,
        } => {
            let config = GameConfig {
                width,
                height,
                food_static: food,
                state_delay_ms: delay,
            };
            config.validate()?;

            input
                .send(UiCommand::CreateGame {
                    player_name: args.name,
                    game_name: game,
                    config,
                })
                .await?;

            run_until_interrupted(&app, &input, &mut events).await;
        }

        Command::Join { game, viewer } => {
            info!("Waiting for game '{}' to be announced...", game);
            let index = wait_for_game(&app, &mut events, &game).await?;

            input
                .send(UiCommand::JoinGame {
                    game_index: index,
                    player_name: args.name,
                    as_viewer: viewer,
                })
                .await?;

            run_until_interrupted(&app, &input, &mut events).await;
        }

        Command::List => {
            // Give announcements one full cycle plus slack to arrive.
            tokio::time::sleep(Duration::from_secs(3)).await;
            let games = app.games();
            if games.is_empty() {
                println!("No games announced.");
            } else {
                for game in games {
                    println!(
                        "{:<20} {:>2} players  {}x{}  {}  at {}",
                        game.name,
                        game.player_count,
                        game.config.width,
                        game.config.height,
                        if game.can_join { "open" } else { "full" },
                        game.master_addr,
                    );
                }
            }
            app.stop().await;
        }
    }

    Ok(())
}

/// Blocks until the named game shows up in the directory.
async fn wait_for_game(
    app: &App,
    events: &mut mpsc::Receiver<AppEvent>,
    game: &str,
) -> Result<usize, Box<dyn std::error::Error>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);

    loop {
        if let Some(index) = app.games().iter().position(|g| g.name == game) {
            return Ok(index);
        }

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                return Err(format!("game '{}' was not announced within 30s", game).into());
            }
            event = events.recv() => {
                if event.is_none() {
                    return Err("event stream closed".into());
                }
            }
        }
    }
}

/// Main event loop: log what happens, leave cleanly on Ctrl-C.
async fn run_until_interrupted(
    app: &App,
    input: &mpsc::Sender<UiCommand>,
    events: &mut mpsc::Receiver<AppEvent>,
) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving game");
                let _ = input.send(UiCommand::ExitGame).await;
                tokio::time::sleep(Duration::from_millis(200)).await;
                app.stop().await;
                return;
            }
            event = events.recv() => {
                match event {
                    Some(AppEvent::StateUpdated) => {
                        if let Some(state) = app.state().await {
                            log::debug!(
                                "tick {}: {} snakes, {} foods, {} players",
                                state.state_order,
                                state.snakes.len(),
                                state.foods.len(),
                                state.players.len(),
                            );
                        }
                    }
                    Some(AppEvent::GamesUpdated) => {
                        log::debug!("{} games in the directory", app.games().len());
                    }
                    Some(AppEvent::JoinSuccess { player_id }) => {
                        info!("Joined successfully, player id {}", player_id);
                    }
                    Some(AppEvent::JoinFailed(message)) => {
                        error!("Join failed: {}", message);
                        app.stop().await;
                        return;
                    }
                    Some(AppEvent::GameOver) => {
                        info!("Game over");
                        app.stop().await;
                        return;
                    }
                    Some(AppEvent::Error(message)) => {
                        error!("{}", message);
                    }
                    None => return,
                }
            }
        }
    }
}
