// Database access layer (SQLite via sqlx).

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TournamentStatus {
    Waiting,
    InProgress,
    Completed,
}

impl TournamentStatus {
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    Scheduled,
    Ready,
    Accepted,
    InProgress,
    Completed,
}

impl MatchStatus {
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "ready" => Some(Self::Ready),
            "accepted" => Some(Self::Accepted),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Ready => "ready",
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

/// Player slot within a bracket match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSlot {
    Player1,
    Player2,
}

impl MatchSlot {
    fn player_column(self) -> &'static str {
        match self {
            Self::Player1 => "player1_id",
            Self::Player2 => "player2_id",
        }
    }

    fn accepted_column(self) -> &'static str {
        match self {
            Self::Player1 => "player1_accepted",
            Self::Player2 => "player2_accepted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tournament {
    pub id: i64,
    pub name: String,
    pub max_players: i64,
    pub status: String,
    pub creator_id: i64,
    pub winner_id: Option<i64>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl Tournament {
    pub fn status(&self) -> Option<TournamentStatus> {
        TournamentStatus::from_str_name(&self.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TournamentParticipant {
    pub tournament_id: i64,
    pub user_id: i64,
    pub joined_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TournamentMatch {
    pub id: i64,
    pub tournament_id: i64,
    pub round: i64,
    pub match_number: i64,
    pub player1_id: Option<i64>,
    pub player2_id: Option<i64>,
    pub winner_id: Option<i64>,
    pub player1_score: i64,
    pub player2_score: i64,
    pub status: String,
    pub player1_accepted: bool,
    pub player2_accepted: bool,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl TournamentMatch {
    pub fn status(&self) -> Option<MatchStatus> {
        MatchStatus::from_str_name(&self.status)
    }

    pub fn is_completed(&self) -> bool {
        self.status() == Some(MatchStatus::Completed)
    }

    pub fn slot_of(&self, user_id: i64) -> Option<MatchSlot> {
        if self.player1_id == Some(user_id) {
            Some(MatchSlot::Player1)
        } else if self.player2_id == Some(user_id) {
            Some(MatchSlot::Player2)
        } else {
            None
        }
    }

    pub fn player(&self, slot: MatchSlot) -> Option<i64> {
        match slot {
            MatchSlot::Player1 => self.player1_id,
            MatchSlot::Player2 => self.player2_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GameRecord {
    pub id: i64,
    pub player1_id: i64,
    pub player2_id: i64,
    pub winner_id: i64,
    pub player1_score: i64,
    pub player2_score: i64,
    pub game_type: String,
    pub tournament_match_id: Option<i64>,
    pub created_at: String,
}

/// Insert payload for an append-only game record.
#[derive(Debug, Clone)]
pub struct NewGame<'a> {
    pub player1_id: i64,
    pub player2_id: i64,
    pub winner_id: i64,
    pub player1_score: i64,
    pub player2_score: i64,
    pub game_type: &'a str,
    pub tournament_match_id: Option<i64>,
}

const MATCH_COLUMNS: &str = "id, tournament_id, round, match_number, player1_id, player2_id, \
     winner_id, player1_score, player2_score, status, player1_accepted, player2_accepted, \
     created_at, started_at, completed_at";

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        // Each in-memory connection would otherwise see its own empty database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tournaments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                max_players INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'waiting',
                creator_id INTEGER NOT NULL,
                winner_id INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                started_at TEXT,
                completed_at TEXT
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tournament_participants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tournament_id INTEGER NOT NULL REFERENCES tournaments(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL,
                joined_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(tournament_id, user_id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tournament_matches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tournament_id INTEGER NOT NULL REFERENCES tournaments(id) ON DELETE CASCADE,
                round INTEGER NOT NULL,
                match_number INTEGER NOT NULL,
                player1_id INTEGER,
                player2_id INTEGER,
                winner_id INTEGER,
                player1_score INTEGER NOT NULL DEFAULT 0,
                player2_score INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'scheduled',
                player1_accepted INTEGER NOT NULL DEFAULT 0,
                player2_accepted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                started_at TEXT,
                completed_at TEXT,
                UNIQUE(tournament_id, round, match_number)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS games (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                player1_id INTEGER NOT NULL,
                player2_id INTEGER NOT NULL,
                winner_id INTEGER NOT NULL,
                player1_score INTEGER NOT NULL,
                player2_score INTEGER NOT NULL,
                game_type TEXT NOT NULL,
                tournament_match_id INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_games_players ON games(player1_id, player2_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Tournaments ──────────────────────────────────────────────────

    pub async fn create_tournament(
        &self,
        name: &str,
        max_players: i64,
        creator_id: i64,
    ) -> Result<Tournament, sqlx::Error> {
        let id = sqlx::query(
            "INSERT INTO tournaments (name, max_players, creator_id) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(max_players)
        .bind(creator_id)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_tournament(id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn list_tournaments(&self) -> Result<Vec<Tournament>, sqlx::Error> {
        sqlx::query_as::<_, Tournament>("SELECT * FROM tournaments ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn get_tournament(&self, id: i64) -> Result<Option<Tournament>, sqlx::Error> {
        sqlx::query_as::<_, Tournament>("SELECT * FROM tournaments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Delete a tournament and everything hanging off it.
    pub async fn delete_tournament(&self, id: i64) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tournament_matches WHERE tournament_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tournament_participants WHERE tournament_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM tournaments WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// waiting → in_progress. False if the tournament was not waiting.
    pub async fn start_tournament(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tournaments SET status = 'in_progress', started_at = datetime('now') \
             WHERE id = ? AND status = 'waiting'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a tournament completed. False if it already was.
    pub async fn complete_tournament(
        &self,
        id: i64,
        winner_id: Option<i64>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tournaments SET status = 'completed', winner_id = ?, \
             completed_at = datetime('now') WHERE id = ? AND status != 'completed'",
        )
        .bind(winner_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Participants ─────────────────────────────────────────────────

    /// Enroll a user while the tournament is still waiting and has room.
    /// Returns false if the user had already joined, the tournament started
    /// or it is full.
    pub async fn add_participant(
        &self,
        tournament_id: i64,
        user_id: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tournament_participants (tournament_id, user_id)
            SELECT t.id, ? FROM tournaments t
            WHERE t.id = ? AND t.status = 'waiting'
              AND (SELECT COUNT(*) FROM tournament_participants p
                   WHERE p.tournament_id = t.id) < t.max_players
            "#,
        )
        .bind(user_id)
        .bind(tournament_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_participants(
        &self,
        tournament_id: i64,
    ) -> Result<Vec<TournamentParticipant>, sqlx::Error> {
        sqlx::query_as::<_, TournamentParticipant>(
            "SELECT tournament_id, user_id, joined_at FROM tournament_participants \
             WHERE tournament_id = ? ORDER BY id",
        )
        .bind(tournament_id)
        .fetch_all(&self.pool)
        .await
    }

    // ── Tournament matches ───────────────────────────────────────────

    pub async fn create_tournament_match(
        &self,
        tournament_id: i64,
        round: i64,
        match_number: i64,
        player1_id: Option<i64>,
        player2_id: Option<i64>,
    ) -> Result<TournamentMatch, sqlx::Error> {
        let status = if player1_id.is_some() && player2_id.is_some() {
            MatchStatus::Ready
        } else {
            MatchStatus::Scheduled
        };
        let id = sqlx::query(
            "INSERT INTO tournament_matches \
             (tournament_id, round, match_number, player1_id, player2_id, status) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(tournament_id)
        .bind(round)
        .bind(match_number)
        .bind(player1_id)
        .bind(player2_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_tournament_match(id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn get_tournament_match(
        &self,
        id: i64,
    ) -> Result<Option<TournamentMatch>, sqlx::Error> {
        sqlx::query_as::<_, TournamentMatch>(&format!(
            "SELECT {MATCH_COLUMNS} FROM tournament_matches WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Look up a match by its bracket position.
    pub async fn find_tournament_match(
        &self,
        tournament_id: i64,
        round: i64,
        match_number: i64,
    ) -> Result<Option<TournamentMatch>, sqlx::Error> {
        sqlx::query_as::<_, TournamentMatch>(&format!(
            "SELECT {MATCH_COLUMNS} FROM tournament_matches \
             WHERE tournament_id = ? AND round = ? AND match_number = ?"
        ))
        .bind(tournament_id)
        .bind(round)
        .bind(match_number)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_tournament_matches(
        &self,
        tournament_id: i64,
    ) -> Result<Vec<TournamentMatch>, sqlx::Error> {
        sqlx::query_as::<_, TournamentMatch>(&format!(
            "SELECT {MATCH_COLUMNS} FROM tournament_matches \
             WHERE tournament_id = ? ORDER BY round, match_number"
        ))
        .bind(tournament_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Highest round in the bracket, if any matches exist.
    pub async fn max_round(&self, tournament_id: i64) -> Result<Option<i64>, sqlx::Error> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(round) FROM tournament_matches WHERE tournament_id = ?")
                .bind(tournament_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    /// Set one player's acceptance flag. Only allowed while the match is ready.
    pub async fn accept_match(&self, id: i64, slot: MatchSlot) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(&format!(
            "UPDATE tournament_matches SET {} = 1 WHERE id = ? AND status = 'ready'",
            slot.accepted_column()
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// ready → accepted once both flags are set.
    pub async fn promote_accepted(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tournament_matches SET status = 'accepted' \
             WHERE id = ? AND status = 'ready' AND player1_accepted = 1 AND player2_accepted = 1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// accepted → in_progress. False if another path already moved it on.
    pub async fn mark_match_in_progress(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tournament_matches SET status = 'in_progress', started_at = datetime('now') \
             WHERE id = ? AND status = 'accepted'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write the result exactly once. False means another completion won the race.
    pub async fn complete_match(
        &self,
        id: i64,
        winner_id: i64,
        player1_score: i64,
        player2_score: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tournament_matches SET status = 'completed', winner_id = ?, \
             player1_score = ?, player2_score = ?, completed_at = datetime('now') \
             WHERE id = ? AND status != 'completed'",
        )
        .bind(winner_id)
        .bind(player1_score)
        .bind(player2_score)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write a player into an empty slot. Never overwrites.
    pub async fn fill_slot(
        &self,
        id: i64,
        slot: MatchSlot,
        user_id: i64,
    ) -> Result<bool, sqlx::Error> {
        let column = slot.player_column();
        let result = sqlx::query(&format!(
            "UPDATE tournament_matches SET {column} = ? WHERE id = ? AND {column} IS NULL"
        ))
        .bind(user_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// scheduled → ready once both slots are populated.
    pub async fn mark_match_ready(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tournament_matches SET status = 'ready' \
             WHERE id = ? AND status = 'scheduled' \
             AND player1_id IS NOT NULL AND player2_id IS NOT NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Games ────────────────────────────────────────────────────────

    pub async fn insert_game(&self, game: &NewGame<'_>) -> Result<GameRecord, sqlx::Error> {
        let id = sqlx::query(
            "INSERT INTO games (player1_id, player2_id, winner_id, player1_score, player2_score, \
             game_type, tournament_match_id) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(game.player1_id)
        .bind(game.player2_id)
        .bind(game.winner_id)
        .bind(game.player1_score)
        .bind(game.player2_score)
        .bind(game.game_type)
        .bind(game.tournament_match_id)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        sqlx::query_as::<_, GameRecord>("SELECT * FROM games WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn list_games_for_user(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<GameRecord>, sqlx::Error> {
        sqlx::query_as::<_, GameRecord>(
            "SELECT * FROM games WHERE player1_id = ? OR player2_id = ? \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_games_for_match(
        &self,
        tournament_match_id: i64,
    ) -> Result<Vec<GameRecord>, sqlx::Error> {
        sqlx::query_as::<_, GameRecord>(
            "SELECT * FROM games WHERE tournament_match_id = ? ORDER BY id",
        )
        .bind(tournament_match_id)
        .fetch_all(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_tournament_crud() {
        let db = test_db().await;

        let t = db.create_tournament("Spring Cup", 8, 1).await.unwrap();
        assert_eq!(t.name, "Spring Cup");
        assert_eq!(t.status(), Some(TournamentStatus::Waiting));
        assert_eq!(t.winner_id, None);

        assert_eq!(db.list_tournaments().await.unwrap().len(), 1);
        assert!(db.get_tournament(999).await.unwrap().is_none());

        assert!(db.start_tournament(t.id).await.unwrap());
        assert!(!db.start_tournament(t.id).await.unwrap());
        let started = db.get_tournament(t.id).await.unwrap().unwrap();
        assert_eq!(started.status(), Some(TournamentStatus::InProgress));
        assert!(started.started_at.is_some());

        assert!(db.complete_tournament(t.id, Some(4)).await.unwrap());
        assert!(!db.complete_tournament(t.id, Some(5)).await.unwrap());
        let done = db.get_tournament(t.id).await.unwrap().unwrap();
        assert_eq!(done.winner_id, Some(4));
    }

    #[tokio::test]
    async fn test_participants_are_unique() {
        let db = test_db().await;
        let t = db.create_tournament("T", 4, 1).await.unwrap();

        assert!(db.add_participant(t.id, 1).await.unwrap());
        assert!(db.add_participant(t.id, 2).await.unwrap());
        assert!(!db.add_participant(t.id, 1).await.unwrap());

        assert!(db.add_participant(t.id, 3).await.unwrap());
        assert!(db.start_tournament(t.id).await.unwrap());
        assert!(!db.add_participant(t.id, 4).await.unwrap());

        let users: Vec<i64> = db
            .list_participants(t.id)
            .await
            .unwrap()
            .iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(users, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_participants_capped_at_max_players() {
        let db = test_db().await;
        let t = db.create_tournament("T", 2, 1).await.unwrap();

        assert!(db.add_participant(t.id, 1).await.unwrap());
        assert!(db.add_participant(t.id, 2).await.unwrap());
        assert!(!db.add_participant(t.id, 3).await.unwrap());
        assert_eq!(db.list_participants(t.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_match_status_follows_slots() {
        let db = test_db().await;
        let t = db.create_tournament("T", 4, 1).await.unwrap();

        let full = db
            .create_tournament_match(t.id, 1, 1, Some(1), Some(2))
            .await
            .unwrap();
        assert_eq!(full.status(), Some(MatchStatus::Ready));

        let next = db
            .create_tournament_match(t.id, 2, 1, None, None)
            .await
            .unwrap();
        assert_eq!(next.status(), Some(MatchStatus::Scheduled));

        assert!(db.fill_slot(next.id, MatchSlot::Player1, 1).await.unwrap());
        assert!(!db.fill_slot(next.id, MatchSlot::Player1, 3).await.unwrap());
        assert!(!db.mark_match_ready(next.id).await.unwrap());

        assert!(db.fill_slot(next.id, MatchSlot::Player2, 3).await.unwrap());
        assert!(db.mark_match_ready(next.id).await.unwrap());
        assert!(!db.mark_match_ready(next.id).await.unwrap());

        let next = db.get_tournament_match(next.id).await.unwrap().unwrap();
        assert_eq!((next.player1_id, next.player2_id), (Some(1), Some(3)));
        assert_eq!(next.slot_of(3), Some(MatchSlot::Player2));
        assert_eq!(db.max_round(t.id).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_acceptance_flow() {
        let db = test_db().await;
        let t = db.create_tournament("T", 2, 1).await.unwrap();
        let m = db
            .create_tournament_match(t.id, 1, 1, Some(1), Some(2))
            .await
            .unwrap();

        assert!(!db.mark_match_in_progress(m.id).await.unwrap());
        assert!(db.accept_match(m.id, MatchSlot::Player1).await.unwrap());
        assert!(!db.promote_accepted(m.id).await.unwrap());
        assert!(db.accept_match(m.id, MatchSlot::Player2).await.unwrap());
        assert!(db.promote_accepted(m.id).await.unwrap());
        assert!(db.mark_match_in_progress(m.id).await.unwrap());

        let m = db.get_tournament_match(m.id).await.unwrap().unwrap();
        assert_eq!(m.status(), Some(MatchStatus::InProgress));
        assert!(m.player1_accepted && m.player2_accepted);
    }

    #[tokio::test]
    async fn test_complete_match_only_once() {
        let db = test_db().await;
        let t = db.create_tournament("T", 2, 1).await.unwrap();
        let m = db
            .create_tournament_match(t.id, 1, 1, Some(7), Some(9))
            .await
            .unwrap();

        assert!(db.complete_match(m.id, 7, 5, 2).await.unwrap());
        assert!(!db.complete_match(m.id, 9, 0, 5).await.unwrap());

        let m = db.get_tournament_match(m.id).await.unwrap().unwrap();
        assert!(m.is_completed());
        assert_eq!(m.winner_id, Some(7));
        assert_eq!((m.player1_score, m.player2_score), (5, 2));
    }

    #[tokio::test]
    async fn test_games_history() {
        let db = test_db().await;
        let game = db
            .insert_game(&NewGame {
                player1_id: 1,
                player2_id: 2,
                winner_id: 2,
                player1_score: 3,
                player2_score: 5,
                game_type: "remote",
                tournament_match_id: None,
            })
            .await
            .unwrap();
        assert_eq!(game.winner_id, 2);

        db.insert_game(&NewGame {
            player1_id: 3,
            player2_id: 1,
            winner_id: 3,
            player1_score: 5,
            player2_score: 0,
            game_type: "tournament",
            tournament_match_id: Some(11),
        })
        .await
        .unwrap();

        assert_eq!(db.list_games_for_user(1, 50).await.unwrap().len(), 2);
        assert_eq!(db.list_games_for_user(2, 50).await.unwrap().len(), 1);
        assert_eq!(db.list_games_for_match(11).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_tournament_removes_bracket() {
        let db = test_db().await;
        let t = db.create_tournament("T", 2, 1).await.unwrap();
        db.add_participant(t.id, 1).await.unwrap();
        db.create_tournament_match(t.id, 1, 1, Some(1), Some(2))
            .await
            .unwrap();

        assert!(db.delete_tournament(t.id).await.unwrap());
        assert!(!db.delete_tournament(t.id).await.unwrap());
        assert!(db.list_tournament_matches(t.id).await.unwrap().is_empty());
        assert!(db.list_participants(t.id).await.unwrap().is_empty());
    }
}
