// Fixed-step ball/paddle simulation for a single room.

use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;

use super::config::GameConfig;

/// Which half of the field a player defends. Player 1 is always `Left`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Side::Left),
            1 => Some(Side::Right),
            _ => None,
        }
    }

    pub fn opponent(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// 1-based player number used on the wire.
    pub fn player_number(self) -> u8 {
        self.index() as u8 + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ball {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
}

/// What a single step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    /// Room not running (not started, paused or finished).
    Skipped,
    Moved,
    Scored { scorer: Side },
    /// The scorer reached the win threshold; the state is now finished.
    Won { winner: Side },
}

/// Serializable view broadcast every tick.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub ball: Ball,
    pub paddles: [f64; 2],
    pub scores: [u32; 2],
}

/// Mutable per-room match state. Only the lifecycle controller and `step`
/// touch these fields.
#[derive(Debug, Clone)]
pub struct MatchState {
    pub ball: Ball,
    pub paddles: [f64; 2],
    pub scores: [u32; 2],
    pub started: bool,
    pub paused: bool,
    pub finished: bool,
    pub paused_at: Option<Instant>,
    pub started_at: Option<Instant>,
}

impl MatchState {
    pub fn new(cfg: &GameConfig) -> Self {
        Self {
            ball: Ball {
                x: cfg.width / 2.0,
                y: cfg.height / 2.0,
                vx: 0.0,
                vy: 0.0,
            },
            paddles: [cfg.centered_paddle_y(); 2],
            scores: [0, 0],
            started: false,
            paused: false,
            finished: false,
            paused_at: None,
            started_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.started && !self.paused && !self.finished
    }

    /// Started and not yet finished, paused or not.
    pub fn is_live(&self) -> bool {
        self.started && !self.finished
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            ball: self.ball,
            paddles: self.paddles,
            scores: self.scores,
        }
    }

    /// Mark the match started and serve the first ball.
    pub fn start<R: Rng + ?Sized>(&mut self, cfg: &GameConfig, rng: &mut R, now: Instant) {
        self.started = true;
        self.paused = false;
        self.paused_at = None;
        self.started_at = Some(now);
        self.serve(cfg, rng);
    }

    /// Returns false if the match is not in a pausable state.
    pub fn pause(&mut self, now: Instant) -> bool {
        if !self.is_running() {
            return false;
        }
        self.paused = true;
        self.paused_at = Some(now);
        true
    }

    /// Clears the pause flag and returns how long the match was paused.
    pub fn resume(&mut self, now: Instant) -> Option<Duration> {
        if !self.paused || self.finished {
            return None;
        }
        self.paused = false;
        let paused_for = self
            .paused_at
            .take()
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        Some(paused_for)
    }

    /// Reset the ball to center with a random serve direction.
    pub fn serve<R: Rng + ?Sized>(&mut self, cfg: &GameConfig, rng: &mut R) {
        let direction = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        let vy = if cfg.serve_max_vy > 0.0 {
            rng.gen_range(-cfg.serve_max_vy..=cfg.serve_max_vy)
        } else {
            0.0
        };
        self.ball = Ball {
            x: cfg.width / 2.0,
            y: cfg.height / 2.0,
            vx: direction * cfg.serve_speed_x,
            vy,
        };
    }

    pub fn set_paddle(&mut self, cfg: &GameConfig, side: Side, y: f64) {
        self.paddles[side.index()] = cfg.clamp_paddle_y(y);
    }

    pub fn nudge_paddle(&mut self, cfg: &GameConfig, side: Side, delta: f64) {
        let y = self.paddles[side.index()] + delta;
        self.set_paddle(cfg, side, y);
    }

    pub fn winner(&self) -> Option<Side> {
        if !self.finished {
            return None;
        }
        if self.scores[0] > self.scores[1] {
            Some(Side::Left)
        } else if self.scores[1] > self.scores[0] {
            Some(Side::Right)
        } else {
            None
        }
    }

    /// Advance the simulation by one fixed timestep.
    pub fn step<R: Rng + ?Sized>(&mut self, cfg: &GameConfig, rng: &mut R) -> StepEvent {
        if !self.is_running() {
            return StepEvent::Skipped;
        }

        let r = cfg.ball_radius;
        self.ball.x += self.ball.vx;
        self.ball.y += self.ball.vy;

        // Top/bottom walls
        if self.ball.y - r <= 0.0 && self.ball.vy < 0.0 {
            self.ball.y = r;
            self.ball.vy = -self.ball.vy;
        } else if self.ball.y + r >= cfg.height && self.ball.vy > 0.0 {
            self.ball.y = cfg.height - r;
            self.ball.vy = -self.ball.vy;
        }

        // Paddles
        let left_face = cfg.paddle_margin + cfg.paddle_width;
        if self.ball.vx < 0.0
            && self.ball.x - r <= left_face
            && self.ball.x + r >= cfg.paddle_margin
        {
            if let Some(offset) = self.hit_offset(cfg, Side::Left) {
                self.ball.vx = self.ball.vx.abs();
                self.ball.vy = (offset - 0.5) * cfg.spread_factor;
            }
        }
        let right_face = cfg.width - cfg.paddle_margin - cfg.paddle_width;
        if self.ball.vx > 0.0
            && self.ball.x + r >= right_face
            && self.ball.x - r <= cfg.width - cfg.paddle_margin
        {
            if let Some(offset) = self.hit_offset(cfg, Side::Right) {
                self.ball.vx = -self.ball.vx.abs();
                self.ball.vy = (offset - 0.5) * cfg.spread_factor;
            }
        }

        // Goal lines
        let scorer = if self.ball.x < 0.0 {
            Side::Right
        } else if self.ball.x > cfg.width {
            Side::Left
        } else {
            return StepEvent::Moved;
        };

        self.scores[scorer.index()] += 1;
        if self.scores[scorer.index()] >= cfg.win_score {
            self.finished = true;
            return StepEvent::Won { winner: scorer };
        }
        self.serve(cfg, rng);
        StepEvent::Scored { scorer }
    }

    /// Normalized contact point on a paddle (0 = top edge, 1 = bottom edge),
    /// or None if the ball is outside the paddle's vertical extent.
    fn hit_offset(&self, cfg: &GameConfig, side: Side) -> Option<f64> {
        let top = self.paddles[side.index()];
        let bottom = top + cfg.paddle_height;
        if self.ball.y < top || self.ball.y > bottom {
            return None;
        }
        Some((self.ball.y - top) / cfg.paddle_height)
    }
}
