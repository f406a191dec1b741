//! Snake geometry and movement.
//!
//! A snake is stored the way it travels on the wire: `points[0]` is the
//! absolute head cell, every following entry is a relative offset describing a
//! straight run along one axis. The full cell list is derived on demand, so a
//! long straight snake costs two entries no matter its length.

use serde::{Deserialize, Serialize};

use crate::field::{Coord, Direction, Field};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnakeState {
    Alive,
    /// Owner left or was demoted; the snake keeps sliding in its last
    /// direction until it dies, and still awards kills.
    Zombie,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snake {
    pub player_id: i32,
    /// Head cell followed by single-axis offsets. Every offset has exactly
    /// one nonzero component.
    pub points: Vec<Coord>,
    pub state: SnakeState,
    pub head_direction: Direction,
}

impl Snake {
    /// A fresh two-cell snake: head at `head`, tail one step in
    /// `tail_direction`, moving away from its tail.
    pub fn new(player_id: i32, head: Coord, tail_direction: Direction) -> Self {
        Self {
            player_id,
            points: vec![head, tail_direction.delta()],
            state: SnakeState::Alive,
            head_direction: tail_direction.opposite(),
        }
    }

    pub fn head(&self) -> Coord {
        self.points.first().copied().unwrap_or(Coord::new(0, 0))
    }

    /// Expands the offset chain into the complete list of occupied cells,
    /// normalised to the torus, head first.
    pub fn body(&self, field: &Field) -> Vec<Coord> {
        let mut result = Vec::new();
        let Some(&head) = self.points.first() else {
            return result;
        };

        let mut current = head;
        result.push(field.normalize(current));

        for offset in &self.points[1..] {
            let step = Coord::new(offset.x.signum(), offset.y.signum());
            let steps = offset.x.abs() + offset.y.abs();
            for _ in 0..steps {
                current = current.add(step);
                result.push(field.normalize(current));
            }
        }

        result
    }

    pub fn len(&self, field: &Field) -> usize {
        self.body(field).len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Accepts a new head direction unless it is the exact opposite of the
    /// current one. Returns whether it was accepted.
    pub fn set_direction(&mut self, dir: Direction) -> bool {
        if dir.is_opposite(self.head_direction) {
            return false;
        }
        self.head_direction = dir;
        true
    }

    /// Advances the snake one cell in its head direction. When `ate` is
    /// false the tail is shortened by one cell.
    pub fn advance(&mut self, field: &Field, ate: bool) {
        let Some(&old_head) = self.points.first() else {
            return;
        };

        let new_head = field.step(old_head, self.head_direction);

        // Offset from the new head back to the old one. A raw delta of
        // +-(width-1) means the head wrapped; the short way around is one
        // step the other direction.
        let mut head_offset = Coord::new(old_head.x - new_head.x, old_head.y - new_head.y);
        if head_offset.x == field.width - 1 {
            head_offset.x = -1;
        } else if head_offset.x == -(field.width - 1) {
            head_offset.x = 1;
        }
        if head_offset.y == field.height - 1 {
            head_offset.y = -1;
        } else if head_offset.y == -(field.height - 1) {
            head_offset.y = 1;
        }

        let mut new_points = Vec::with_capacity(self.points.len() + 1);
        new_points.push(new_head);

        if self.points.len() > 1 {
            let first_offset = self.points[1];
            let colinear = (head_offset.x != 0
                && first_offset.x != 0
                && head_offset.x.signum() == first_offset.x.signum())
                || (head_offset.y != 0
                    && first_offset.y != 0
                    && head_offset.y.signum() == first_offset.y.signum());

            if colinear {
                new_points.push(head_offset.add(first_offset));
                new_points.extend_from_slice(&self.points[2..]);
            } else {
                new_points.push(head_offset);
                new_points.extend_from_slice(&self.points[1..]);
            }
        } else {
            new_points.push(head_offset);
        }

        if !ate && new_points.len() > 1 {
            let last_idx = new_points.len() - 1;
            let mut last = new_points[last_idx];

            if last.x != 0 {
                last.x -= last.x.signum();
            } else if last.y != 0 {
                last.y -= last.y.signum();
            }

            if last.x == 0 && last.y == 0 {
                new_points.truncate(last_idx);
            } else {
                new_points[last_idx] = last;
            }
        }

        self.points = new_points;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field() -> Field {
        Field::new(20, 15)
    }

    #[test]
    fn test_new_snake_is_two_cells() {
        let snake = Snake::new(1, Coord::new(5, 5), Direction::Left);
        let body = snake.body(&field());
        assert_eq!(body, vec![Coord::new(5, 5), Coord::new(4, 5)]);
        assert_eq!(snake.head_direction, Direction::Right);
        assert_eq!(snake.state, SnakeState::Alive);
    }

    #[test]
    fn test_body_expands_straight_run() {
        let snake = Snake {
            player_id: 1,
            points: vec![Coord::new(3, 3), Coord::new(4, 0)],
            state: SnakeState::Alive,
            head_direction: Direction::Left,
        };
        assert_eq!(
            snake.body(&field()),
            vec![
                Coord::new(3, 3),
                Coord::new(4, 3),
                Coord::new(5, 3),
                Coord::new(6, 3),
                Coord::new(7, 3),
            ]
        );
    }

    #[test]
    fn test_body_expands_bend() {
        let snake = Snake {
            player_id: 1,
            points: vec![Coord::new(3, 3), Coord::new(2, 0), Coord::new(0, -2)],
            state: SnakeState::Alive,
            head_direction: Direction::Left,
        };
        assert_eq!(
            snake.body(&field()),
            vec![
                Coord::new(3, 3),
                Coord::new(4, 3),
                Coord::new(5, 3),
                Coord::new(5, 2),
                Coord::new(5, 1),
            ]
        );
    }

    #[test]
    fn test_body_normalises_across_edge() {
        let snake = Snake {
            player_id: 1,
            points: vec![Coord::new(19, 0), Coord::new(2, 0)],
            state: SnakeState::Alive,
            head_direction: Direction::Left,
        };
        assert_eq!(
            snake.body(&field()),
            vec![Coord::new(19, 0), Coord::new(0, 0), Coord::new(1, 0)]
        );
    }

    #[test]
    fn test_set_direction_rejects_opposite() {
        let mut snake = Snake::new(1, Coord::new(5, 5), Direction::Left);
        assert_eq!(snake.head_direction, Direction::Right);
        assert!(!snake.set_direction(Direction::Left));
        assert_eq!(snake.head_direction, Direction::Right);
        assert!(snake.set_direction(Direction::Up));
        assert_eq!(snake.head_direction, Direction::Up);
    }

    #[test]
    fn test_advance_keeps_length_without_food() {
        let f = field();
        let mut snake = Snake::new(1, Coord::new(5, 5), Direction::Left);
        for _ in 0..10 {
            snake.advance(&f, false);
            assert_eq!(snake.len(&f), 2);
        }
        assert_eq!(snake.head(), Coord::new(15, 5));
    }

    #[test]
    fn test_advance_grows_when_eating() {
        let f = field();
        let mut snake = Snake::new(1, Coord::new(5, 5), Direction::Left);
        snake.advance(&f, true);
        assert_eq!(snake.len(&f), 3);
        assert_eq!(
            snake.body(&f),
            vec![Coord::new(6, 5), Coord::new(5, 5), Coord::new(4, 5)]
        );
    }

    #[test]
    fn test_advance_folds_colinear_offsets() {
        let f = field();
        let mut snake = Snake::new(1, Coord::new(5, 5), Direction::Left);
        snake.advance(&f, true);
        snake.advance(&f, true);
        // Still a single straight run: head plus one offset.
        assert_eq!(snake.points.len(), 2);
        assert_eq!(snake.points[1], Coord::new(-3, 0));
    }

    #[test]
    fn test_advance_inserts_offset_on_turn() {
        let f = field();
        let mut snake = Snake::new(1, Coord::new(5, 5), Direction::Left);
        snake.advance(&f, true);
        assert!(snake.set_direction(Direction::Down));
        snake.advance(&f, true);
        assert_eq!(snake.points.len(), 3);
        assert_eq!(snake.head(), Coord::new(6, 6));
        assert_eq!(snake.len(&f), 4);
    }

    #[test]
    fn test_advance_across_wrap_keeps_unit_offset() {
        let f = field();
        let mut snake = Snake::new(1, Coord::new(19, 5), Direction::Left);
        snake.advance(&f, false);
        assert_eq!(snake.head(), Coord::new(0, 5));
        // The offset back to the old head must be one step, not width-1.
        assert_eq!(snake.points[1], Coord::new(-1, 0));
        assert_eq!(snake.len(&f), 2);
    }
}
