//! Toroidal game field and coordinate arithmetic.

use serde::{Deserialize, Serialize};

/// A cell position on the game field.
///
/// Coordinates are signed so that snake body offsets can reuse the same type;
/// positions that reach the outside world are always normalised into
/// `[0, width) x [0, height)` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn add(self, other: Coord) -> Coord {
        Coord {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }
}

/// One of the four movement directions a snake head can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    /// Unit step for this direction. The y axis grows downward.
    pub fn delta(self) -> Coord {
        match self {
            Direction::Up => Coord::new(0, -1),
            Direction::Down => Coord::new(0, 1),
            Direction::Left => Coord::new(-1, 0),
            Direction::Right => Coord::new(1, 0),
        }
    }

    pub fn is_opposite(self, other: Direction) -> bool {
        self.opposite() == other
    }
}

/// The torus the game is played on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub width: i32,
    pub height: i32,
}

impl Field {
    pub fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    /// Wraps a coordinate onto the torus using the non-negative modulus.
    pub fn normalize(&self, c: Coord) -> Coord {
        Coord {
            x: c.x.rem_euclid(self.width),
            y: c.y.rem_euclid(self.height),
        }
    }

    /// One normalised step from `c` in direction `d`.
    pub fn step(&self, c: Coord, d: Direction) -> Coord {
        self.normalize(c.add(d.delta()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_wraps_negative() {
        let field = Field::new(10, 8);
        assert_eq!(field.normalize(Coord::new(-1, -1)), Coord::new(9, 7));
        assert_eq!(field.normalize(Coord::new(-11, -9)), Coord::new(9, 7));
        assert_eq!(field.normalize(Coord::new(10, 8)), Coord::new(0, 0));
        assert_eq!(field.normalize(Coord::new(3, 5)), Coord::new(3, 5));
    }

    #[test]
    fn test_step_wraps_every_edge() {
        let field = Field::new(10, 8);
        assert_eq!(
            field.step(Coord::new(0, 0), Direction::Left),
            Coord::new(9, 0)
        );
        assert_eq!(
            field.step(Coord::new(9, 0), Direction::Right),
            Coord::new(0, 0)
        );
        assert_eq!(
            field.step(Coord::new(0, 0), Direction::Up),
            Coord::new(0, 7)
        );
        assert_eq!(
            field.step(Coord::new(0, 7), Direction::Down),
            Coord::new(0, 0)
        );
    }

    #[test]
    fn test_full_lap_returns_home() {
        let field = Field::new(20, 15);
        for dir in Direction::ALL {
            let start = Coord::new(4, 9);
            let mut pos = start;
            let laps = match dir {
                Direction::Left | Direction::Right => field.width,
                Direction::Up | Direction::Down => field.height,
            };
            for _ in 0..laps {
                pos = field.step(pos, dir);
            }
            assert_eq!(pos, start, "lap in {:?} did not return home", dir);
        }
    }

    #[test]
    fn test_opposites() {
        assert_eq!(Direction::Up.opposite(), Direction::Down);
        assert_eq!(Direction::Left.opposite(), Direction::Right);
        assert!(Direction::Up.is_opposite(Direction::Down));
        assert!(!Direction::Up.is_opposite(Direction::Left));
        assert!(!Direction::Up.is_opposite(Direction::Up));
    }
}
