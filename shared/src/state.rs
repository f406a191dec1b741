//! Game configuration, players and the authoritative game state.
//!
//! The [`GameState::tick`] engine is the heart of the game. Exactly one node,
//! the current master, runs it; everyone else only ever receives the result.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::GameError;
use crate::field::{Coord, Direction, Field};
use crate::snake::{Snake, SnakeState};

/// Attempts per food / spawn position before the random search gives up.
const PLACEMENT_ATTEMPTS: u32 = 100;

/// Immutable per-game settings. Every liveness window in the system derives
/// from `state_delay_ms`, so tuning the tick period scales them in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameConfig {
    pub width: i32,
    pub height: i32,
    pub food_static: i32,
    pub state_delay_ms: i32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            width: 40,
            height: 30,
            food_static: 25,
            state_delay_ms: 200,
        }
    }
}

impl GameConfig {
    pub fn validate(&self) -> Result<(), GameError> {
        if !(10..=100).contains(&self.width) {
            return Err(GameError::InvalidConfig(format!(
                "width {} out of range 10..=100",
                self.width
            )));
        }
        if !(10..=100).contains(&self.height) {
            return Err(GameError::InvalidConfig(format!(
                "height {} out of range 10..=100",
                self.height
            )));
        }
        if !(0..=100).contains(&self.food_static) {
            return Err(GameError::InvalidConfig(format!(
                "food_static {} out of range 0..=100",
                self.food_static
            )));
        }
        if !(100..=3000).contains(&self.state_delay_ms) {
            return Err(GameError::InvalidConfig(format!(
                "state_delay_ms {} out of range 100..=3000",
                self.state_delay_ms
            )));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.state_delay_ms as u64)
    }

    /// Retransmission period for unacked messages.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.state_delay_ms as u64 / 10)
    }

    /// How often an idle link gets a keepalive.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.state_delay_ms as u64 / 10)
    }

    /// Silence after which a peer is declared dead. The 0.8 factor keeps the
    /// window longer than several ping intervals but shorter than a tick, so
    /// a death is declared before the next state broadcast is due.
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.state_delay_ms as u64 * 8 / 10)
    }

    /// After becoming master, peers are only pinged (never evicted) for this
    /// long, giving survivors of a failover time to re-address.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.state_delay_ms as u64 * 3)
    }

    /// Viewers tolerate a quieter master than players do.
    pub fn viewer_master_timeout(&self) -> Duration {
        Duration::from_millis(self.state_delay_ms as u64 * 3)
    }
}

/// Role a node plays in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Normal,
    Master,
    Deputy,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerType {
    Human,
    Robot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: i32,
    pub name: String,
    /// Unset for the player describing the local node.
    pub ip_address: Option<String>,
    pub port: Option<u16>,
    pub role: NodeRole,
    pub player_type: PlayerType,
    pub score: i32,
}

impl Player {
    pub fn new(id: i32, name: impl Into<String>, role: NodeRole) -> Self {
        Self {
            id,
            name: name.into(),
            ip_address: None,
            port: None,
            role,
            player_type: PlayerType::Human,
            score: 0,
        }
    }
}

/// Outcome of one tick, for the master to act on.
#[derive(Debug, Default, Clone)]
pub struct TickResult {
    pub killed_players: Vec<i32>,
    pub score_changes: HashMap<i32, i32>,
}

/// The full authoritative world. The active role owns the only mutable copy;
/// everyone else works on clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub state_order: i32,
    pub field: Field,
    pub config: GameConfig,
    pub snakes: HashMap<i32, Snake>,
    pub foods: Vec<Coord>,
    pub players: HashMap<i32, Player>,
}

impl GameState {
    pub fn new(config: GameConfig) -> Self {
        Self {
            state_order: 0,
            field: Field::new(config.width, config.height),
            config,
            snakes: HashMap::new(),
            foods: Vec::new(),
            players: HashMap::new(),
        }
    }

    /// Applies one authoritative step: steering, movement, feeding, deaths,
    /// corpse food and the food top-up. `moves` holds at most one direction
    /// per player.
    pub fn tick(&mut self, moves: &HashMap<i32, Direction>) -> TickResult {
        let mut result = TickResult::default();

        self.state_order += 1;

        for (&player_id, &dir) in moves {
            if let Some(snake) = self.snakes.get_mut(&player_id) {
                if snake.state == SnakeState::Alive {
                    // A rejected opposite is silently ignored.
                    snake.set_direction(dir);
                }
            }
        }

        // Which heads land on food this tick, decided before anyone moves.
        let mut ate: HashSet<i32> = HashSet::new();
        for (&player_id, snake) in &self.snakes {
            let next_head = self.field.step(snake.head(), snake.head_direction);
            if self.foods.contains(&next_head) {
                ate.insert(player_id);
            }
        }

        for snake in self.snakes.values_mut() {
            let grew = ate.contains(&snake.player_id);
            snake.advance(&self.field, grew);
        }

        // Consume foods under heads; only living snakes score for them.
        let mut remaining = Vec::with_capacity(self.foods.len());
        for &food in &self.foods {
            let eater = self
                .snakes
                .values()
                .find(|snake| snake.head() == food)
                .map(|snake| (snake.player_id, snake.state));
            match eater {
                Some((player_id, SnakeState::Alive)) => {
                    if let Some(player) = self.players.get_mut(&player_id) {
                        player.score += 1;
                        *result.score_changes.entry(player_id).or_insert(0) += 1;
                    }
                }
                Some((_, SnakeState::Zombie)) => {}
                None => remaining.push(food),
            }
        }
        self.foods = remaining;

        // Death detection over every ordered (head, body) pair.
        let mut killed: HashSet<i32> = HashSet::new();
        let mut killer_of: HashMap<i32, i32> = HashMap::new();

        for (&player_id, snake) in &self.snakes {
            let head = snake.head();
            for (&other_id, other) in &self.snakes {
                for (i, cell) in other.body(&self.field).into_iter().enumerate() {
                    if cell != head {
                        continue;
                    }
                    if player_id == other_id && i == 0 {
                        continue;
                    }
                    if i == 0 && player_id != other_id {
                        // Head-on-head: both die, nobody scores.
                        killed.insert(player_id);
                        killed.insert(other_id);
                    } else {
                        killed.insert(player_id);
                        if player_id != other_id {
                            killer_of.insert(player_id, other_id);
                        }
                    }
                }
            }
        }

        for (&victim, &killer) in &killer_of {
            if victim == killer {
                continue;
            }
            let killer_alive = self
                .snakes
                .get(&killer)
                .is_some_and(|s| s.state == SnakeState::Alive);
            if killer_alive {
                if let Some(player) = self.players.get_mut(&killer) {
                    player.score += 1;
                    *result.score_changes.entry(killer).or_insert(0) += 1;
                }
            }
        }

        for &player_id in &killed {
            if let Some(snake) = self.snakes.get(&player_id) {
                for cell in snake.body(&self.field) {
                    if rand::thread_rng().gen_bool(0.5) && !self.foods.contains(&cell) {
                        self.foods.push(cell);
                    }
                }
            }
            self.snakes.remove(&player_id);
            result.killed_players.push(player_id);

            if let Some(player) = self.players.get_mut(&player_id) {
                if player.role != NodeRole::Viewer {
                    player.role = NodeRole::Viewer;
                }
            }
        }

        self.ensure_food();

        result
    }

    pub fn alive_snakes(&self) -> usize {
        self.snakes
            .values()
            .filter(|s| s.state == SnakeState::Alive)
            .count()
    }

    pub fn required_food(&self) -> usize {
        self.config.food_static as usize + self.alive_snakes()
    }

    fn occupied_cells(&self) -> HashSet<Coord> {
        let mut occupied: HashSet<Coord> = HashSet::new();
        for snake in self.snakes.values() {
            occupied.extend(snake.body(&self.field));
        }
        occupied.extend(self.foods.iter().copied());
        occupied
    }

    /// Tops the food list up to `food_static + alive snakes`, one random free
    /// cell at a time. Each food gives up after 100 failed rolls, so a packed
    /// board cannot loop forever.
    pub fn ensure_food(&mut self) {
        let required = self.required_food();
        let mut occupied = self.occupied_cells();
        let mut rng = rand::thread_rng();

        while self.foods.len() < required {
            let mut placed = false;
            for _ in 0..PLACEMENT_ATTEMPTS {
                let pos = Coord::new(
                    rng.gen_range(0..self.field.width),
                    rng.gen_range(0..self.field.height),
                );
                if !occupied.contains(&pos) {
                    self.foods.push(pos);
                    occupied.insert(pos);
                    placed = true;
                    break;
                }
            }
            if !placed {
                break;
            }
        }
    }

    /// Searches for a spawn position: a random centre whose 5x5 toroidal
    /// neighbourhood is free of snake cells, plus a random tail direction
    /// such that neither the centre nor the tail cell holds food. The new
    /// snake will head in the opposite of the tail direction.
    pub fn find_spawn_place(&self) -> Option<(Coord, Direction)> {
        let mut snake_cells: HashSet<Coord> = HashSet::new();
        for snake in self.snakes.values() {
            snake_cells.extend(snake.body(&self.field));
        }
        let food_cells: HashSet<Coord> = self.foods.iter().copied().collect();

        let mut rng = rand::thread_rng();
        for _ in 0..PLACEMENT_ATTEMPTS {
            let center = Coord::new(
                rng.gen_range(0..self.field.width),
                rng.gen_range(0..self.field.height),
            );

            let clear = (-2..=2).all(|dx| {
                (-2..=2).all(|dy| {
                    let cell = self.field.normalize(center.add(Coord::new(dx, dy)));
                    !snake_cells.contains(&cell)
                })
            });
            if !clear {
                continue;
            }

            let tail_dir = Direction::ALL[rng.gen_range(0..4)];
            let tail = self.field.step(center, tail_dir);
            if !food_cells.contains(&center) && !food_cells.contains(&tail) {
                return Some((center, tail_dir));
            }
        }

        None
    }

    /// Installs a fresh two-cell snake for `player_id`. Returns false when no
    /// spawn place could be found.
    pub fn spawn_snake(&mut self, player_id: i32) -> bool {
        match self.find_spawn_place() {
            Some((head, tail_dir)) => {
                self.snakes
                    .insert(player_id, Snake::new(player_id, head, tail_dir));
                true
            }
            None => false,
        }
    }

    pub fn make_snake_zombie(&mut self, player_id: i32) {
        if let Some(snake) = self.snakes.get_mut(&player_id) {
            snake.state = SnakeState::Zombie;
        }
    }

    /// Ids are monotone and never reused within a game.
    pub fn generate_player_id(&self) -> i32 {
        self.players.keys().copied().max().unwrap_or(0) + 1
    }

    pub fn deputy(&self) -> Option<&Player> {
        self.players.values().find(|p| p.role == NodeRole::Deputy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GameConfig {
        GameConfig {
            width: 20,
            height: 15,
            food_static: 3,
            state_delay_ms: 200,
        }
    }

    fn state_without_food() -> GameState {
        let mut cfg = config();
        cfg.food_static = 0;
        GameState::new(cfg)
    }

    fn install_snake(state: &mut GameState, id: i32, head: Coord, tail_dir: Direction) {
        state
            .players
            .insert(id, Player::new(id, format!("p{}", id), NodeRole::Normal));
        state.snakes.insert(id, Snake::new(id, head, tail_dir));
    }

    #[test]
    fn test_config_validation() {
        assert!(GameConfig::default().validate().is_ok());
        let mut cfg = GameConfig::default();
        cfg.width = 9;
        assert!(cfg.validate().is_err());
        cfg = GameConfig::default();
        cfg.state_delay_ms = 5000;
        assert!(cfg.validate().is_err());
        cfg = GameConfig::default();
        cfg.food_static = 101;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_timer_derivation() {
        let cfg = config();
        assert_eq!(cfg.tick_interval(), Duration::from_millis(200));
        assert_eq!(cfg.retry_interval(), Duration::from_millis(20));
        assert_eq!(cfg.peer_timeout(), Duration::from_millis(160));
        assert_eq!(cfg.grace_period(), Duration::from_millis(600));
    }

    #[test]
    fn test_tick_increments_state_order() {
        let mut state = GameState::new(config());
        assert_eq!(state.state_order, 0);
        for expected in 1..=5 {
            state.tick(&HashMap::new());
            assert_eq!(state.state_order, expected);
        }
    }

    #[test]
    fn test_tick_keeps_food_invariant() {
        let mut state = GameState::new(config());
        install_snake(&mut state, 1, Coord::new(5, 5), Direction::Left);
        state.ensure_food();
        for _ in 0..20 {
            state.tick(&HashMap::new());
            assert!(state.foods.len() >= state.config.food_static as usize);
        }
    }

    #[test]
    fn test_opposite_steer_is_ignored() {
        let mut state = state_without_food();
        install_snake(&mut state, 1, Coord::new(5, 5), Direction::Left);
        // Heading right; asking for left must be dropped.
        let mut moves = HashMap::new();
        moves.insert(1, Direction::Left);
        state.tick(&moves);

        let snake = &state.snakes[&1];
        assert_eq!(snake.head(), Coord::new(6, 5));
        assert_eq!(snake.head_direction, Direction::Right);
    }

    #[test]
    fn test_eating_grows_and_scores() {
        let mut state = state_without_food();
        install_snake(&mut state, 1, Coord::new(5, 5), Direction::Left);
        state.foods.push(Coord::new(6, 5));

        let result = state.tick(&HashMap::new());

        assert_eq!(state.snakes[&1].len(&state.field), 3);
        assert_eq!(state.players[&1].score, 1);
        assert_eq!(result.score_changes.get(&1), Some(&1));
        assert!(!state.foods.contains(&Coord::new(6, 5)));
    }

    #[test]
    fn test_zombie_eats_without_scoring() {
        let mut state = state_without_food();
        install_snake(&mut state, 1, Coord::new(5, 5), Direction::Left);
        state.snakes.get_mut(&1).unwrap().state = SnakeState::Zombie;
        state.foods.push(Coord::new(6, 5));

        let result = state.tick(&HashMap::new());

        assert_eq!(state.snakes[&1].len(&state.field), 3);
        assert_eq!(state.players[&1].score, 0);
        assert!(result.score_changes.is_empty());
        assert!(state.foods.is_empty());
    }

    #[test]
    fn test_head_on_head_kills_both_without_score() {
        let mut state = state_without_food();
        // Facing each other one cell apart: both move into (6,5).
        install_snake(&mut state, 1, Coord::new(5, 5), Direction::Left);
        install_snake(&mut state, 2, Coord::new(7, 5), Direction::Right);

        let result = state.tick(&HashMap::new());

        let mut killed = result.killed_players.clone();
        killed.sort_unstable();
        assert_eq!(killed, vec![1, 2]);
        assert!(state.snakes.is_empty());
        assert_eq!(state.players[&1].score, 0);
        assert_eq!(state.players[&2].score, 0);
        assert_eq!(state.players[&1].role, NodeRole::Viewer);
        assert_eq!(state.players[&2].role, NodeRole::Viewer);
    }

    #[test]
    fn test_running_into_body_scores_the_killer() {
        let mut state = state_without_food();
        // Snake 2's body spans (7,5)..(7,8); snake 1 runs head-first into it.
        install_snake(&mut state, 1, Coord::new(6, 6), Direction::Left);
        state.players.insert(2, Player::new(2, "p2", NodeRole::Normal));
        state.snakes.insert(
            2,
            Snake {
                player_id: 2,
                points: vec![Coord::new(7, 5), Coord::new(0, 3)],
                state: SnakeState::Alive,
                head_direction: Direction::Up,
            },
        );

        let result = state.tick(&HashMap::new());

        assert_eq!(result.killed_players, vec![1]);
        assert!(!state.snakes.contains_key(&1));
        assert!(state.snakes.contains_key(&2));
        assert_eq!(state.players[&2].score, 1);
        assert_eq!(result.score_changes.get(&2), Some(&1));
        assert_eq!(state.players[&1].role, NodeRole::Viewer);
    }

    #[test]
    fn test_corpse_drops_food_only_on_body_cells() {
        let mut state = state_without_food();
        install_snake(&mut state, 1, Coord::new(5, 5), Direction::Left);
        install_snake(&mut state, 2, Coord::new(7, 5), Direction::Right);

        state.tick(&HashMap::new());

        // Two 2-cell snakes die; at most their body cells can become food.
        assert!(state.foods.len() <= 4);
        for food in &state.foods {
            assert!(food.y == 5, "corpse food off the snakes' row: {:?}", food);
        }
    }

    #[test]
    fn test_spawn_place_has_clear_neighbourhood() {
        let mut state = GameState::new(config());
        install_snake(&mut state, 1, Coord::new(10, 7), Direction::Left);
        let snake_cells: HashSet<Coord> = state.snakes[&1].body(&state.field).into_iter().collect();

        for _ in 0..50 {
            let (center, tail_dir) = state.find_spawn_place().expect("board is nearly empty");
            for dx in -2..=2 {
                for dy in -2..=2 {
                    let cell = state.field.normalize(center.add(Coord::new(dx, dy)));
                    assert!(!snake_cells.contains(&cell));
                }
            }
            let tail = state.field.step(center, tail_dir);
            assert!(!state.foods.contains(&center));
            assert!(!state.foods.contains(&tail));
        }
    }

    #[test]
    fn test_spawn_search_gives_up_on_full_board() {
        let mut cfg = config();
        cfg.width = 10;
        cfg.height = 10;
        cfg.food_static = 0;
        let mut state = GameState::new(cfg);
        // One snake ring covering every row blocks every 5x5 square.
        state.players.insert(1, Player::new(1, "p1", NodeRole::Normal));
        let mut points = vec![Coord::new(0, 0)];
        for y in 0..10 {
            let dx = if y % 2 == 0 { 9 } else { -9 };
            points.push(Coord::new(dx, 0));
            if y < 9 {
                points.push(Coord::new(0, 1));
            }
        }
        state.snakes.insert(
            1,
            Snake {
                player_id: 1,
                points,
                state: SnakeState::Alive,
                head_direction: Direction::Right,
            },
        );
        assert_eq!(state.snakes[&1].len(&state.field), 100);
        assert!(state.find_spawn_place().is_none());
        assert!(!state.spawn_snake(2));
    }

    #[test]
    fn test_spawned_snake_is_alive_and_two_cells() {
        let mut state = GameState::new(config());
        state.players.insert(1, Player::new(1, "p1", NodeRole::Master));
        assert!(state.spawn_snake(1));
        let snake = &state.snakes[&1];
        assert_eq!(snake.state, SnakeState::Alive);
        assert_eq!(snake.len(&state.field), 2);
    }

    #[test]
    fn test_player_ids_are_monotone() {
        let mut state = GameState::new(config());
        assert_eq!(state.generate_player_id(), 1);
        state.players.insert(1, Player::new(1, "a", NodeRole::Master));
        state.players.insert(4, Player::new(4, "b", NodeRole::Normal));
        assert_eq!(state.generate_player_id(), 5);
        // Removing a player must not free its id.
        state.players.remove(&4);
        state.players.insert(5, Player::new(5, "c", NodeRole::Normal));
        assert_eq!(state.generate_player_id(), 6);
    }

    #[test]
    fn test_ensure_food_counts_alive_snakes_only() {
        let mut state = GameState::new(config());
        install_snake(&mut state, 1, Coord::new(5, 5), Direction::Left);
        install_snake(&mut state, 2, Coord::new(12, 9), Direction::Right);
        state.make_snake_zombie(2);
        state.ensure_food();
        assert_eq!(state.foods.len(), state.config.food_static as usize + 1);
    }
}
