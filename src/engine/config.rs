// Match tuning: field geometry, tick rate, scoring and lifecycle delays.

use std::time::Duration;

// Field geometry (logical units, origin top-left)
pub const FIELD_WIDTH: f64 = 800.0;
pub const FIELD_HEIGHT: f64 = 600.0;
pub const BALL_RADIUS: f64 = 10.0;

pub const PADDLE_WIDTH: f64 = 10.0;
pub const PADDLE_HEIGHT: f64 = 100.0;
/// Gap between a paddle and its goal line.
pub const PADDLE_MARGIN: f64 = 10.0;
/// Distance a paddle travels per PLAYER_MOVE step.
pub const PADDLE_STEP: f64 = 10.0;

// Ball speed (units per tick)
pub const SERVE_SPEED_X: f64 = 5.0;
pub const SERVE_MAX_VY: f64 = 3.0;
/// vy after a paddle hit is (hit_offset - 0.5) * SPREAD_FACTOR.
pub const SPREAD_FACTOR: f64 = 10.0;

pub const TICK_RATE_HZ: u32 = 60;
pub const WIN_SCORE: u32 = 5;

pub const AUTO_START_DELAY: Duration = Duration::from_millis(1500);
pub const ROOM_CLEANUP_DELAY: Duration = Duration::from_secs(10);

/// Runtime tuning for every room the server hosts.
#[derive(Debug, Clone)]
pub struct GameConfig {
    pub width: f64,
    pub height: f64,
    pub ball_radius: f64,
    pub paddle_width: f64,
    pub paddle_height: f64,
    pub paddle_margin: f64,
    pub paddle_step: f64,
    pub serve_speed_x: f64,
    pub serve_max_vy: f64,
    pub spread_factor: f64,
    pub tick_rate_hz: u32,
    pub win_score: u32,
    pub auto_start_delay: Duration,
    pub room_cleanup_delay: Duration,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            width: FIELD_WIDTH,
            height: FIELD_HEIGHT,
            ball_radius: BALL_RADIUS,
            paddle_width: PADDLE_WIDTH,
            paddle_height: PADDLE_HEIGHT,
            paddle_margin: PADDLE_MARGIN,
            paddle_step: PADDLE_STEP,
            serve_speed_x: SERVE_SPEED_X,
            serve_max_vy: SERVE_MAX_VY,
            spread_factor: SPREAD_FACTOR,
            tick_rate_hz: TICK_RATE_HZ,
            win_score: WIN_SCORE,
            auto_start_delay: AUTO_START_DELAY,
            room_cleanup_delay: ROOM_CLEANUP_DELAY,
        }
    }
}

impl GameConfig {
    /// Wall-clock length of one simulation step.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz.max(1) as f64)
    }

    /// Paddles start vertically centered.
    pub fn centered_paddle_y(&self) -> f64 {
        (self.height - self.paddle_height) / 2.0
    }

    /// Clamp a requested paddle top edge into the field.
    pub fn clamp_paddle_y(&self, y: f64) -> f64 {
        y.clamp(0.0, self.height - self.paddle_height)
    }
}
