use std::collections::BTreeMap;
use std::time::Duration;

use ai_game_engine::prelude::*;

/// The worker binary built with this crate.
pub const WORKER: &str = env!("CARGO_BIN_EXE_agent-worker");

pub fn worker_config() -> Configuration {
    Configuration::new()
        .with_worker_command(WORKER, &[])
        .with_allow_uncontained(true)
}

pub fn fast_constraints() -> Constraints {
    ConstraintsBuilder::new()
        .with_action_timeout(Duration::from_millis(300))
        .with_start_timeout(Duration::from_secs(5))
        .with_complete_timeout(Duration::from_millis(500))
        .with_connect_timeout(Duration::from_secs(5))
        .with_join_timeout(Duration::from_millis(200))
        .with_terminate_timeout(Duration::from_millis(200))
        .with_kill_timeout(Duration::from_millis(500))
        .build()
        .unwrap()
}

pub fn scripted(actions: &[&str]) -> AgentInfo {
    AgentInfo::new("scripted").with_arg("actions", serde_json::json!(actions))
}

/// A 3x4 race for `roster`; agents start on the first column, the goal is at (2, 3).
pub fn race(seed: u64, roster: Vec<(AgentIndex, AgentInfo)>) -> (GameInfo, RaceState) {
    let agent_infos: BTreeMap<_, _> = roster.into_iter().collect();
    let state = RaceState::open_field(3, 4, &agent_infos);
    (GameInfo::new(seed, agent_infos), state)
}

pub fn actions(result: &GameResult) -> Vec<(AgentIndex, Action, bool)> {
    result
        .history()
        .iter()
        .map(|record| (record.agent_index(), record.action().clone(), record.crashed()))
        .collect()
}

/// Remembers what the engine told it.
#[derive(Debug, Default)]
pub struct RecordingUi {
    pub started: bool,
    pub updates: usize,
    pub completed: bool,
    pub closed: bool,
}

impl Ui<RaceState> for RecordingUi {
    fn game_start(&mut self, _state: &RaceState, _highlights: &[BoardHighlight]) {
        self.started = true;
    }

    fn update(&mut self, _state: &RaceState, _record: &ActionRecord) {
        self.updates += 1;
    }

    fn game_complete(&mut self, _state: &RaceState) {
        self.completed = true;
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
