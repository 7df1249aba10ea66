//! Replaying a recorded game.
//!
//! A replay runs the recorded decisions through `scripted` agents, in process, with the
//! original seed and move delays. Recorded crashes are crashed again, so the game sees
//! the same crash hooks. Replays are never marked as timed out.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::instrument;

use crate::action::Action;
use crate::agent::{AgentIndex, AgentInfo, AgentRegistry};
use crate::engine::Engine;
use crate::game_info::GameInfo;
use crate::game_state::GameState;
use crate::isolation::{IsolationLevel, NoneIsolator};
use crate::result::GameResult;
use crate::ui::Ui;

#[derive(Default)]
struct Script {
    actions: Vec<Action>,
    crashes: Vec<u64>,
}

/// The game info replaying `result`.
pub fn replay_info(result: &GameResult) -> GameInfo {
    let original = result.game_info();

    let mut scripts: BTreeMap<AgentIndex, Script> = BTreeMap::new();
    for record in result.history() {
        let script = scripts.entry(record.agent_index()).or_default();
        if record.crashed() {
            script.crashes.push(script.actions.len() as u64);
        }
        script.actions.push(record.action().clone());
    }

    let agent_infos = original
        .agent_infos
        .iter()
        .map(|(agent_index, info)| {
            let script = scripts.remove(agent_index).unwrap_or_default();
            let replayed = AgentInfo::new("scripted")
                .with_move_delay(info.move_delay)
                .with_arg("actions", serde_json::json!(script.actions))
                .with_arg("crashes", serde_json::json!(script.crashes));
            (*agent_index, replayed)
        })
        .collect();

    GameInfo {
        seed: original.seed,
        agent_infos,
        isolation_level: IsolationLevel::None,
        max_turns: Some(result.history().len() as u64),
    }
}

impl<S: GameState> Engine<S> {
    /// Play `result` again from `initial_state`, which must be the state the recorded
    /// game started from.
    ///
    /// Replay agents come from the built-in registry, whatever this engine's registry is.
    #[instrument(skip_all, fields(game_id = result.game_id()))]
    pub fn replay(
        &self,
        result: &GameResult,
        initial_state: S,
        ui: &mut dyn Ui<S>,
    ) -> anyhow::Result<GameResult> {
        let game_info = replay_info(result);
        let mut isolator = NoneIsolator::new(Arc::new(AgentRegistry::with_builtin()));
        self.play(&game_info, initial_state, &mut isolator, ui, true)
    }
}
