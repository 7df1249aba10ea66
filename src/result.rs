//! The record of one played game.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::action::ActionRecord;
use crate::agent::AgentIndex;
use crate::game_info::GameInfo;

/// History and outcome of a game.
///
/// Created when the game starts, appended to once per turn, and finished when the
/// loop exits. The history is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameResult {
    game_id: u64,
    game_info: GameInfo,
    #[serde(with = "time::serde::rfc3339")]
    start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    end_time: Option<OffsetDateTime>,
    history: Vec<ActionRecord>,
    score: i64,
    turn_count: u64,
    winners: BTreeSet<AgentIndex>,
    timeout: bool,
}

impl GameResult {
    /// An empty result, started now.
    pub fn new(game_id: u64, game_info: GameInfo) -> Self {
        Self {
            game_id,
            game_info,
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            history: Vec::new(),
            score: 0,
            turn_count: 0,
            winners: BTreeSet::new(),
            timeout: false,
        }
    }

    /// Append one decision. `score` and `turn_count` are the state's values after it.
    pub fn record_turn(&mut self, record: ActionRecord, score: i64, turn_count: u64) {
        self.history.push(record);
        self.score = score;
        self.turn_count = turn_count;
    }

    pub(crate) fn finish(&mut self, score: i64, timeout: bool) {
        self.end_time = Some(OffsetDateTime::now_utc());
        self.score = score;
        self.timeout = timeout;
    }

    pub(crate) fn set_winners(&mut self, winners: BTreeSet<AgentIndex>, score: i64) {
        self.winners = winners;
        self.score = score;
    }

    /// Identifier drawn from the game's RNG; replays get the same one.
    pub fn game_id(&self) -> u64 {
        self.game_id
    }

    /// Seed, roster and budgets the game ran with.
    pub fn game_info(&self) -> &GameInfo {
        &self.game_info
    }

    /// When the game started.
    pub fn start_time(&self) -> OffsetDateTime {
        self.start_time
    }

    /// When the game ended, once it did.
    pub fn end_time(&self) -> Option<OffsetDateTime> {
        self.end_time
    }

    /// Wall-clock length of the game, once it ended.
    pub fn duration(&self) -> Option<Duration> {
        self.end_time
            .map(|end| (end - self.start_time).try_into().unwrap_or(Duration::ZERO))
    }

    /// Every decision, in order.
    pub fn history(&self) -> &[ActionRecord] {
        &self.history
    }

    /// Latest score.
    pub fn score(&self) -> i64 {
        self.score
    }

    /// Turns actually played.
    ///
    /// Can be one less than the history length: a crash that ends the game is recorded
    /// without a turn being played.
    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    /// Winners, empty for none or a draw.
    pub fn winners(&self) -> &BTreeSet<AgentIndex> {
        &self.winners
    }

    /// Whether the game was cut by the engine's budget.
    pub fn timeout(&self) -> bool {
        self.timeout
    }

    /// Agents with at least one crashed record.
    pub fn crashed_agents(&self) -> BTreeSet<AgentIndex> {
        self.history
            .iter()
            .filter(|record| record.crashed())
            .map(ActionRecord::agent_index)
            .collect()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a result produced by [`to_json`](Self::to_json).
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
