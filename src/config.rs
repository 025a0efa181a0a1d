// Application configuration, loaded from environment variables and CLI flags.

use crate::engine::config::GameConfig;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Match tuning shared by every room.
    pub game: GameConfig,
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:pong.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `PONG_TICK_RATE` - Simulation steps per second (default: 60)
    /// - `PONG_WIN_SCORE` - Points needed to win a match (default: 5)
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_sources(&args, |key| std::env::var(key).ok())
    }

    fn from_sources(args: &[String], env: impl Fn(&str) -> Option<String>) -> Self {
        let database_url =
            env("DATABASE_URL").unwrap_or_else(|| "sqlite:pong.db?mode=rwc".to_string());

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| env("PORT").and_then(|v| v.parse().ok()))
            .unwrap_or(3000);

        let mut game = GameConfig::default();
        if let Some(rate) = env("PONG_TICK_RATE").and_then(|v| v.parse::<u32>().ok()) {
            if rate > 0 {
                game.tick_rate_hz = rate;
            }
        }
        if let Some(score) = env("PONG_WIN_SCORE").and_then(|v| v.parse::<u32>().ok()) {
            if score > 0 {
                game.win_score = score;
            }
        }

        Config {
            database_url,
            port,
            game,
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(&args(&["pong-backend"]), |_| None);
        assert_eq!(config.database_url, "sqlite:pong.db?mode=rwc");
        assert_eq!(config.port, 3000);
        assert_eq!(config.game.tick_rate_hz, 60);
        assert_eq!(config.game.win_score, 5);
    }

    #[test]
    fn test_cli_port_beats_env() {
        let config = Config::from_sources(&args(&["pong-backend", "--port", "8080"]), |key| {
            (key == "PORT").then(|| "9000".to_string())
        });
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_game_overrides() {
        let config = Config::from_sources(&args(&[]), |key| match key {
            "PONG_TICK_RATE" => Some("120".to_string()),
            "PONG_WIN_SCORE" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.game.tick_rate_hz, 120);
        assert_eq!(config.game.win_score, 5);
    }
}
