//! Built-in agents.
//!
//! They work with any [`GameState`] and are available by name through
//! [`AgentRegistry::with_builtin`].

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tracing::debug;

use crate::action::{Action, AgentAction, STOP};
use crate::agent::{Agent, AgentIndex, AgentInfo, AgentRegistry};
use crate::game_state::GameState;
use crate::rng::GameRng;

/// Always stops.
#[derive(Debug, Default)]
pub struct DummyAgent;

impl<S: GameState> Agent<S> for DummyAgent {
    fn get_action(&mut self, _state: &S, _user_inputs: &[Action]) -> anyhow::Result<Action> {
        Ok(STOP)
    }
}

/// Picks a legal action uniformly at random, from a generator seeded by the engine.
#[derive(Debug)]
pub struct RandomAgent {
    rng: GameRng,
}

impl RandomAgent {
    /// A random agent. Its generator is reseeded when the game starts.
    pub fn new() -> Self {
        Self {
            rng: GameRng::new(0),
        }
    }
}

impl Default for RandomAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: GameState> Agent<S> for RandomAgent {
    fn get_action(&mut self, state: &S, _user_inputs: &[Action]) -> anyhow::Result<Action> {
        let actions = state.get_legal_actions();
        Ok(self.rng.choose(&actions).cloned().unwrap_or(STOP))
    }

    fn game_start(
        &mut self,
        _agent_index: AgentIndex,
        seed: u64,
        _initial_state: &S,
    ) -> anyhow::Result<Option<AgentAction>> {
        self.rng = GameRng::new(seed);
        Ok(None)
    }
}

/// Plays a fixed list of actions, then stops.
///
/// Built from the `actions` extra argument (a list of action names), plus an optional
/// `crashes` argument listing the moves (0-based) on which it fails instead of playing.
/// Used for replays, so it does not check legality itself: a script that diverges from
/// the game shows up as an illegal action.
#[derive(Debug)]
pub struct ScriptedAgent {
    actions: std::vec::IntoIter<Action>,
    crashes: BTreeSet<u64>,
    moves: u64,
}

impl ScriptedAgent {
    /// A scripted agent playing `actions`.
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            actions: actions.into_iter(),
            crashes: BTreeSet::new(),
            moves: 0,
        }
    }

    /// Fail on the given moves.
    #[must_use]
    pub fn with_crashes(mut self, crashes: BTreeSet<u64>) -> Self {
        self.crashes = crashes;
        self
    }

    /// Read the script from `info`'s extra arguments.
    pub fn from_info(info: &AgentInfo) -> anyhow::Result<Self> {
        let actions: Vec<Action> = match info.arg("actions") {
            Some(value) => serde_json::from_value(value.clone())
                .context("`actions` must be a list of action names")?,
            None => vec![],
        };
        let crashes: BTreeSet<u64> = match info.arg("crashes") {
            Some(value) => serde_json::from_value(value.clone())
                .context("`crashes` must be a list of move numbers")?,
            None => BTreeSet::new(),
        };
        Ok(Self::new(actions).with_crashes(crashes))
    }
}

impl<S: GameState> Agent<S> for ScriptedAgent {
    fn get_action(&mut self, _state: &S, _user_inputs: &[Action]) -> anyhow::Result<Action> {
        let n = self.moves;
        self.moves += 1;
        let action = self.actions.next().unwrap_or(STOP);
        if self.crashes.contains(&n) {
            bail!("scripted crash on move {n}");
        }
        Ok(action)
    }
}

/// Scores a state for [`GreedyAgent`]. Higher is better.
pub type Evaluation<S> = fn(&S) -> f64;

/// Plays the action whose successor evaluates best, breaking ties at random.
///
/// `STOP` is only played when nothing else is legal.
#[derive(Debug)]
pub struct GreedyAgent<S> {
    evaluation: Evaluation<S>,
    rng: GameRng,
}

impl<S: GameState> GreedyAgent<S> {
    /// A greedy agent maximizing the game score.
    pub fn new() -> Self {
        Self::with_evaluation(|state: &S| state.core().score as f64)
    }

    /// A greedy agent maximizing a custom evaluation.
    pub fn with_evaluation(evaluation: Evaluation<S>) -> Self {
        Self {
            evaluation,
            rng: GameRng::new(0),
        }
    }
}

impl<S: GameState> Default for GreedyAgent<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: GameState> Agent<S> for GreedyAgent<S> {
    fn get_action(&mut self, state: &S, _user_inputs: &[Action]) -> anyhow::Result<Action> {
        let mut actions = state.get_legal_actions();
        if actions.len() > 1 {
            actions.retain(|action| *action != STOP);
        }

        let mut best_score = f64::NEG_INFINITY;
        let mut best_actions = Vec::new();
        for action in actions {
            // lookahead gets its own generator so the agent's stream stays untouched
            let mut lookahead_rng = self.rng.fork();
            let successor = state.generate_successor(&action, &mut lookahead_rng)?;
            let score = (self.evaluation)(&successor);
            if score > best_score {
                best_score = score;
                best_actions.clear();
            }
            if score >= best_score {
                best_actions.push(action);
            }
        }

        Ok(self.rng.choose(&best_actions).cloned().unwrap_or(STOP))
    }

    fn game_start(
        &mut self,
        _agent_index: AgentIndex,
        seed: u64,
        _initial_state: &S,
    ) -> anyhow::Result<Option<AgentAction>> {
        self.rng = GameRng::new(seed);
        Ok(None)
    }
}

/// Follows user input: the most recent legal input, else its previous action if still
/// legal, else `STOP`.
#[derive(Debug, Default)]
pub struct UserInputAgent {
    last_action: Option<Action>,
}

impl<S: GameState> Agent<S> for UserInputAgent {
    fn get_action(&mut self, state: &S, user_inputs: &[Action]) -> anyhow::Result<Action> {
        let legal = state.get_legal_actions();
        let action = user_inputs
            .iter()
            .rev()
            .find(|action| legal.contains(action))
            .or_else(|| self.last_action.as_ref().filter(|action| legal.contains(action)))
            .cloned()
            .unwrap_or(STOP);
        self.last_action = Some(action.clone());
        Ok(action)
    }
}

/// How a [`FaultyAgent`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Return an error.
    Error,
    /// Panic.
    Panic,
    /// Never answer. In process, this blocks the engine: use a worker backend.
    Hang,
    /// Exit the hosting process. Only meaningful in a worker.
    Exit,
}

impl std::str::FromStr for FaultMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(FaultMode::Error),
            "panic" => Ok(FaultMode::Panic),
            "hang" => Ok(FaultMode::Hang),
            "exit" => Ok(FaultMode::Exit),
            _ => Err(anyhow!("unknown fault mode `{s}`")),
        }
    }
}

/// The call in which a [`FaultyAgent`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStage {
    /// `game_start`.
    Start,
    /// `get_action`, after the configured number of good moves.
    Action,
    /// `game_complete`.
    Complete,
}

impl std::str::FromStr for FaultStage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(FaultStage::Start),
            "action" => Ok(FaultStage::Action),
            "complete" => Ok(FaultStage::Complete),
            _ => Err(anyhow!("unknown fault stage `{s}`")),
        }
    }
}

/// Diagnostic agent that misbehaves on purpose.
///
/// Extra arguments: `mode` (`error`, `panic`, `hang`, `exit`; default `error`),
/// `stage` (`start`, `action`, `complete`; default `action`) and `after`, the number
/// of moves (`STOP`) it plays before failing (default 0).
#[derive(Debug)]
pub struct FaultyAgent {
    mode: FaultMode,
    stage: FaultStage,
    after: u64,
    moves: u64,
}

impl FaultyAgent {
    /// A faulty agent.
    pub fn new(mode: FaultMode, stage: FaultStage, after: u64) -> Self {
        Self {
            mode,
            stage,
            after,
            moves: 0,
        }
    }

    /// Read the configuration from `info`'s extra arguments.
    pub fn from_info(info: &AgentInfo) -> anyhow::Result<Self> {
        let mode = match info.arg("mode") {
            Some(value) => value
                .as_str()
                .ok_or_else(|| anyhow!("`mode` must be a string"))?
                .parse()?,
            None => FaultMode::Error,
        };
        let stage = match info.arg("stage") {
            Some(value) => value
                .as_str()
                .ok_or_else(|| anyhow!("`stage` must be a string"))?
                .parse()?,
            None => FaultStage::Action,
        };
        let after = match info.arg("after") {
            Some(value) => value
                .as_u64()
                .ok_or_else(|| anyhow!("`after` must be a non-negative integer"))?,
            None => 0,
        };
        Ok(Self::new(mode, stage, after))
    }

    fn fail(&self) -> anyhow::Result<()> {
        debug!(mode = ?self.mode, stage = ?self.stage, "faulty agent failing on purpose");
        match self.mode {
            FaultMode::Error => bail!("faulty agent failed on purpose"),
            FaultMode::Panic => panic!("faulty agent panicked on purpose"),
            FaultMode::Hang => loop {
                std::thread::sleep(Duration::from_secs(3600));
            },
            FaultMode::Exit => std::process::exit(3),
        }
    }
}

impl<S: GameState> Agent<S> for FaultyAgent {
    fn get_action(&mut self, _state: &S, _user_inputs: &[Action]) -> anyhow::Result<Action> {
        if self.stage == FaultStage::Action && self.moves >= self.after {
            self.fail()?;
        }
        self.moves += 1;
        Ok(STOP)
    }

    fn game_start(
        &mut self,
        _agent_index: AgentIndex,
        _seed: u64,
        _initial_state: &S,
    ) -> anyhow::Result<Option<AgentAction>> {
        if self.stage == FaultStage::Start {
            self.fail()?;
        }
        Ok(None)
    }

    fn game_complete(&mut self, _final_state: &S) -> anyhow::Result<()> {
        if self.stage == FaultStage::Complete {
            self.fail()?;
        }
        Ok(())
    }
}

impl<S: GameState> AgentRegistry<S> {
    /// A registry holding the built-in agents: `dummy`, `random`, `scripted`, `greedy`,
    /// `user-input` and `faulty`.
    pub fn with_builtin() -> Self {
        Self::new()
            .with("dummy", |_| Ok(Box::new(DummyAgent)))
            .with("random", |_| Ok(Box::new(RandomAgent::new())))
            .with("scripted", |info| Ok(Box::new(ScriptedAgent::from_info(info)?)))
            .with("greedy", |_| Ok(Box::new(GreedyAgent::<S>::new())))
            .with("user-input", |_| Ok(Box::new(UserInputAgent::default())))
            .with("faulty", |info| Ok(Box::new(FaultyAgent::from_info(info)?)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::action::{EAST, NORTH, SOUTH, WEST};
    use crate::board::Board;
    use crate::race::RaceState;

    fn started_race() -> RaceState {
        let roster = BTreeMap::from([(0, AgentInfo::new("dummy"))]);
        let mut state = RaceState::open_field(3, 3, &roster);
        state.game_start().unwrap();
        state
    }

    #[test]
    fn builtin_names() {
        let registry = AgentRegistry::<RaceState>::with_builtin();
        assert_eq!(
            registry.names(),
            vec!["dummy", "faulty", "greedy", "random", "scripted", "user-input"]
        );
        let error = registry.create(&AgentInfo::new("nope")).err().unwrap();
        assert!(matches!(
            error.downcast_ref::<crate::error::EngineError>(),
            Some(crate::error::EngineError::UnknownAgent(name)) if name == "nope"
        ));
    }

    #[test]
    fn random_agent_is_seeded() {
        let state = started_race();
        let mut first = RandomAgent::new();
        let mut second = RandomAgent::new();
        Agent::<RaceState>::game_start(&mut first, 0, 9, &state).unwrap();
        Agent::<RaceState>::game_start(&mut second, 0, 9, &state).unwrap();

        for _ in 0..20 {
            let a = first.get_action(&state, &[]).unwrap();
            let b = second.get_action(&state, &[]).unwrap();
            assert_eq!(a, b);
            assert!(state.get_legal_actions().contains(&a));
        }
    }

    #[test]
    fn scripted_agent_plays_then_stops() {
        let state = started_race();
        let info = AgentInfo::new("scripted").with_arg("actions", serde_json::json!(["south", "east"]));
        let mut agent = ScriptedAgent::from_info(&info).unwrap();

        assert_eq!(Agent::<RaceState>::get_action(&mut agent, &state, &[]).unwrap(), SOUTH);
        assert_eq!(Agent::<RaceState>::get_action(&mut agent, &state, &[]).unwrap(), EAST);
        assert_eq!(Agent::<RaceState>::get_action(&mut agent, &state, &[]).unwrap(), STOP);

        let bad = AgentInfo::new("scripted").with_arg("actions", 3);
        assert!(ScriptedAgent::from_info(&bad).is_err());
    }

    #[test]
    fn scripted_agent_replays_crashes() {
        let state = started_race();
        let info = AgentInfo::new("scripted")
            .with_arg("actions", serde_json::json!(["south", "stop", "east"]))
            .with_arg("crashes", serde_json::json!([1]));
        let mut agent = ScriptedAgent::from_info(&info).unwrap();

        assert_eq!(Agent::<RaceState>::get_action(&mut agent, &state, &[]).unwrap(), SOUTH);
        assert!(Agent::<RaceState>::get_action(&mut agent, &state, &[]).is_err());
        assert_eq!(Agent::<RaceState>::get_action(&mut agent, &state, &[]).unwrap(), EAST);
    }

    #[test]
    fn greedy_avoids_stop() {
        let state = started_race();
        let mut agent = GreedyAgent::<RaceState>::new();
        let action = agent.get_action(&state, &[]).unwrap();
        assert_ne!(action, STOP);

        let mut towards_goal = GreedyAgent::<RaceState>::with_evaluation(|state| {
            let distance = state
                .core()
                .board()
                .get_agent_position(0)
                .map(|p| p.manhattan(&state.goal()))
                .unwrap_or(u32::MAX);
            -f64::from(distance)
        });
        let action = towards_goal.get_action(&state, &[]).unwrap();
        assert!(action == SOUTH || action == EAST);
    }

    #[test]
    fn user_input_agent_follows_inputs() {
        let state = started_race();
        let mut agent = UserInputAgent::default();

        // agent 0 sits in the top left corner: north and west are illegal
        assert_eq!(agent.get_action(&state, &[EAST, NORTH]).unwrap(), EAST);
        assert_eq!(agent.get_action(&state, &[]).unwrap(), EAST);
        assert_eq!(agent.get_action(&state, &[SOUTH, WEST]).unwrap(), SOUTH);

        let mut fresh = UserInputAgent::default();
        assert_eq!(Agent::<RaceState>::get_action(&mut fresh, &state, &[NORTH]).unwrap(), STOP);
    }

    #[test]
    fn faulty_agent_fails_after_moves() {
        let state = started_race();
        let info = AgentInfo::new("faulty").with_arg("after", 2);
        let mut agent = FaultyAgent::from_info(&info).unwrap();

        assert!(Agent::<RaceState>::get_action(&mut agent, &state, &[]).is_ok());
        assert!(Agent::<RaceState>::get_action(&mut agent, &state, &[]).is_ok());
        assert!(Agent::<RaceState>::get_action(&mut agent, &state, &[]).is_err());

        let bad = AgentInfo::new("faulty").with_arg("mode", "explode");
        assert!(FaultyAgent::from_info(&bad).is_err());
    }

    #[test]
    fn faulty_agent_start_stage() {
        let state = started_race();
        let info = AgentInfo::new("faulty").with_arg("stage", "start");
        let mut agent = FaultyAgent::from_info(&info).unwrap();
        assert!(Agent::<RaceState>::game_start(&mut agent, 0, 1, &state).is_err());
        assert!(Agent::<RaceState>::get_action(&mut agent, &state, &[]).is_ok());
    }
}
