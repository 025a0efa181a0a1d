// Single-elimination brackets: generation, byes and winner advancement over
// persisted tournament match rows.

use crate::db::{Database, MatchSlot, TournamentMatch};

/// Result of advancing a completed match's winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advancement {
    /// Winner written into the next round; `ready` if that match now has both players.
    SlotFilled { next_match_id: i64, ready: bool },
    /// The winner was already in place (or the slot is held and left untouched).
    AlreadyAdvanced { next_match_id: i64 },
    /// The final was completed and the tournament closed.
    TournamentCompleted,
    /// The final had already closed the tournament.
    AlreadyCompleted,
    /// The completed match or its successor row could not be found.
    MatchMissing,
}

/// Smallest power of two that holds every participant (at least 2).
pub fn bracket_size(participants: usize) -> usize {
    participants.max(2).next_power_of_two()
}

/// Number of rounds for a bracket of `size` slots.
pub fn total_rounds(size: usize) -> i64 {
    size.max(2).trailing_zeros() as i64
}

/// Round-one pairings. Full pairs come first, then single-player byes, so no
/// match is ever empty on both sides.
///
/// Returns `size / 2` entries of (player1, player2).
pub fn round_one_pairings(participants: &[i64]) -> Vec<(Option<i64>, Option<i64>)> {
    let matches = bracket_size(participants.len()) / 2;
    let full = participants.len().saturating_sub(matches);

    let mut pairs = Vec::with_capacity(matches);
    let mut players = participants.iter().copied();
    for _ in 0..full {
        pairs.push((players.next(), players.next()));
    }
    while pairs.len() < matches {
        pairs.push((players.next(), None));
    }
    pairs
}

/// Where the winner of (round, match_number) plays next.
pub fn feeds_into(round: i64, match_number: i64) -> (i64, i64, MatchSlot) {
    let slot = if match_number % 2 == 1 {
        MatchSlot::Player1
    } else {
        MatchSlot::Player2
    };
    (round + 1, (match_number + 1) / 2, slot)
}

/// Create every round of the bracket and resolve round-one byes.
pub async fn seed_bracket(
    db: &Database,
    tournament_id: i64,
    participants: &[i64],
) -> Result<Vec<TournamentMatch>, sqlx::Error> {
    let size = bracket_size(participants.len());
    let rounds = total_rounds(size);

    let mut byes = Vec::new();
    for (i, (p1, p2)) in round_one_pairings(participants).into_iter().enumerate() {
        let m = db
            .create_tournament_match(tournament_id, 1, i as i64 + 1, p1, p2)
            .await?;
        if let (Some(lone), None) = (p1, p2) {
            byes.push((m.id, lone));
        }
    }

    let mut matches_in_round = size as i64 / 4;
    for round in 2..=rounds {
        for match_number in 1..=matches_in_round {
            db.create_tournament_match(tournament_id, round, match_number, None, None)
                .await?;
        }
        matches_in_round /= 2;
    }

    for (match_id, player) in byes {
        if db.complete_match(match_id, player, 0, 0).await? {
            let outcome = advance(db, tournament_id, match_id, player).await?;
            tracing::debug!(tournament_id, match_id, player, ?outcome, "Resolved bye");
        }
    }

    tracing::info!(
        tournament_id,
        participants = participants.len(),
        rounds,
        "Seeded bracket"
    );
    db.list_tournament_matches(tournament_id).await
}

/// Move `winner_id` out of a completed match into the next round, or close
/// the tournament after the final. Safe to call more than once.
pub async fn advance(
    db: &Database,
    tournament_id: i64,
    match_id: i64,
    winner_id: i64,
) -> Result<Advancement, sqlx::Error> {
    let Some(completed) = db.get_tournament_match(match_id).await? else {
        tracing::warn!(tournament_id, match_id, "Cannot advance unknown match");
        return Ok(Advancement::MatchMissing);
    };

    let (next_round, next_number, slot) = feeds_into(completed.round, completed.match_number);
    let next = db
        .find_tournament_match(tournament_id, next_round, next_number)
        .await?;

    let Some(next) = next else {
        let last_round = db.max_round(tournament_id).await?;
        if last_round.is_some_and(|r| completed.round < r) {
            tracing::warn!(
                tournament_id,
                round = next_round,
                match_number = next_number,
                "Next bracket match is missing"
            );
            return Ok(Advancement::MatchMissing);
        }
        if db.complete_tournament(tournament_id, Some(winner_id)).await? {
            tracing::info!(tournament_id, winner_id, "Tournament completed");
            return Ok(Advancement::TournamentCompleted);
        }
        return Ok(Advancement::AlreadyCompleted);
    };

    match next.player(slot) {
        Some(existing) if existing == winner_id => {
            // A previous call may have died between the two writes.
            db.mark_match_ready(next.id).await?;
            Ok(Advancement::AlreadyAdvanced {
                next_match_id: next.id,
            })
        }
        Some(existing) => {
            tracing::warn!(
                tournament_id,
                match_id,
                next_match_id = next.id,
                existing,
                winner_id,
                "Next-round slot already held by another player"
            );
            Ok(Advancement::AlreadyAdvanced {
                next_match_id: next.id,
            })
        }
        None => {
            if !db.fill_slot(next.id, slot, winner_id).await? {
                tracing::debug!(next_match_id = next.id, "Slot filled concurrently");
                return Ok(Advancement::AlreadyAdvanced {
                    next_match_id: next.id,
                });
            }
            let ready = db.mark_match_ready(next.id).await?;
            Ok(Advancement::SlotFilled {
                next_match_id: next.id,
                ready,
            })
        }
    }
}
