//! The game loop.
//!
//! An [`Engine`] runs one game at a time: it seeds the game's RNG, sets the agents up
//! through an [`Isolator`], then plays turns until the game ends or a budget runs out:
//!
//! 1. the next agent is picked from the state's tickets,
//! 2. the isolator asks it for an action (agent faults come back as crashed records),
//! 3. the action is checked and played, and the agent gets its next ticket,
//! 4. the record is appended to the [`GameResult`].
//!
//! A game cut by [`GameInfo::max_turns`] or by the constraints' game time budget is
//! marked timed out. Whatever happens in the loop, the isolator is always told the game
//! is over and closed.
//!
//! Isolators turn illegal answers into crashes. An isolator that still returns an
//! illegal action aborts the game with [`EngineError::IllegalAction`]: that is a broken
//! isolation contract, not an agent fault.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use rand::RngCore;
use tracing::{debug, info, instrument, trace, warn};

use crate::action::{Action, ActionRecord, BoardHighlight};
use crate::agent::{AgentIndex, AgentRegistry};
use crate::configuration::Configuration;
use crate::constraints::Constraints;
use crate::error::EngineError;
use crate::game_info::GameInfo;
use crate::game_state::GameState;
use crate::isolation::{safe_default, Isolator};
use crate::logger::init_logger;
use crate::result::GameResult;
use crate::rng::GameRng;
use crate::ui::Ui;

/// Runs games of `S`.
pub struct Engine<S: GameState> {
    registry: Arc<AgentRegistry<S>>,
    config: Configuration,
    constraints: Constraints,
}

impl<S: GameState> Engine<S> {
    /// Create an [`Engine`] building agents from `registry`.
    ///
    /// Installs the file logger when `config.log` is set.
    #[instrument(skip_all)]
    pub fn new(
        registry: impl Into<Arc<AgentRegistry<S>>>,
        config: Configuration,
        constraints: Constraints,
    ) -> Engine<S> {
        if config.log {
            if let Err(e) = init_logger(true) {
                warn!("could not install the logger: {e:#}");
            }
        }
        trace!(?config, ?constraints);

        Engine {
            registry: registry.into(),
            config,
            constraints,
        }
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry<S>> {
        &self.registry
    }

    /// The configuration.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// The constraints.
    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// Play one game from `initial_state`, with the isolation level of `game_info`.
    ///
    /// `initial_state` must be built for the roster of `game_info` and not started yet.
    ///
    /// # Errors
    /// - configuration errors (empty roster, bad move delay, state and roster not
    ///   matching, agents that cannot be built), before any turn is played,
    /// - [`EngineError::IllegalAction`] when an isolator returns an illegal action.
    ///
    /// The isolator is closed, and the UI too, when this returns.
    pub fn run(
        &self,
        game_info: &GameInfo,
        initial_state: S,
        ui: &mut dyn Ui<S>,
    ) -> anyhow::Result<GameResult> {
        let built = game_info
            .isolation_level
            .build(self.registry.clone(), &self.config, &self.constraints);
        let mut isolator = match built {
            Ok(isolator) => isolator,
            Err(e) => {
                ui.close();
                return Err(e.context(format!(
                    "could not set up '{}' isolation",
                    game_info.isolation_level
                )));
            }
        };
        self.play(game_info, initial_state, isolator.as_mut(), ui, false)
    }

    /// Like [`run`](Self::run), with an isolator set up by the caller.
    ///
    /// The isolator is closed when this returns.
    pub fn run_with_isolator(
        &self,
        game_info: &GameInfo,
        initial_state: S,
        isolator: &mut dyn Isolator<S>,
        ui: &mut dyn Ui<S>,
    ) -> anyhow::Result<GameResult> {
        self.play(game_info, initial_state, isolator, ui, false)
    }

    #[instrument(skip_all, fields(seed = game_info.seed))]
    pub(crate) fn play(
        &self,
        game_info: &GameInfo,
        mut state: S,
        isolator: &mut dyn Isolator<S>,
        ui: &mut dyn Ui<S>,
        is_replay: bool,
    ) -> anyhow::Result<GameResult> {
        // 1. Setup, nothing runs yet
        let mut rng = GameRng::new(game_info.seed);
        let game_id = rng.next_u64();
        let mut result = GameResult::new(game_id, game_info.clone());

        info!(
            game_id,
            agents = game_info.agent_infos.len(),
            isolation = %game_info.isolation_level,
            "game setup"
        );
        let setup = set_up(game_info, &mut state).and_then(|()| {
            isolator
                .init_agents(&game_info.agent_infos)
                .context("could not set the agents up")
        });
        if let Err(e) = setup {
            isolator.close();
            ui.close();
            return Err(e);
        }

        // 2. Turns
        let outcome = self.turn_loop(
            game_info,
            &mut state,
            isolator,
            ui,
            &mut rng,
            &mut result,
            is_replay,
        );

        // 3. Teardown, whatever happened
        result.finish(state.core().score, state.core().timeout);
        isolator.game_complete(&state);
        if outcome.is_ok() {
            let winners = state.game_complete();
            result.set_winners(winners, state.core().score);
            ui.game_complete(&state);
        }
        isolator.close();
        ui.close();
        outcome?;

        info!(
            game_id,
            turns = result.turn_count(),
            score = result.score(),
            winners = ?result.winners(),
            timeout = result.timeout(),
            "game over"
        );
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn turn_loop(
        &self,
        game_info: &GameInfo,
        state: &mut S,
        isolator: &mut dyn Isolator<S>,
        ui: &mut dyn Ui<S>,
        rng: &mut GameRng,
        result: &mut GameResult,
        is_replay: bool,
    ) -> anyhow::Result<()> {
        let responses = isolator
            .game_start(rng, state)
            .context("could not start the agents")?;
        state.agents_game_start(&responses);
        let highlights: Vec<BoardHighlight> = responses
            .values()
            .flat_map(|response| response.board_highlights.iter().cloned())
            .collect();
        ui.game_start(state, &highlights);

        let mut user_inputs = UserInputBuffer::new(state.core().agent_indexes());
        let started = Instant::now();
        let natural_end = loop {
            if state.check_end() {
                break true;
            }
            if game_info
                .max_turns
                .is_some_and(|max_turns| state.core().turn_count() >= max_turns)
            {
                debug!("turn budget exhausted");
                break false;
            }
            if self
                .constraints
                .game_time_budget()
                .is_some_and(|budget| started.elapsed() >= budget)
            {
                debug!("time budget exhausted");
                break false;
            }
            self.play_turn(state, isolator, ui, rng, result, &mut user_inputs)?;
        };

        if !natural_end {
            if is_replay {
                state.core_mut().game_over = true;
            } else {
                warn!(turns = state.core().turn_count(), "game cut by the engine");
                state.process_game_timeout();
            }
        }
        Ok(())
    }

    fn play_turn(
        &self,
        state: &mut S,
        isolator: &mut dyn Isolator<S>,
        ui: &mut dyn Ui<S>,
        rng: &mut GameRng,
        result: &mut GameResult,
        user_inputs: &mut UserInputBuffer,
    ) -> anyhow::Result<()> {
        let agent_index = state.select_next_agent()?;
        let inputs = user_inputs.take(agent_index, ui.get_user_inputs());

        let mut record = isolator.get_action(state, &inputs)?;
        if record.agent_index() != agent_index {
            bail!(
                "isolator answered for agent {} while agent {agent_index} was active",
                record.agent_index()
            );
        }
        trace!(
            agent = agent_index,
            action = %record.action(),
            crashed = record.crashed(),
            duration_ms = record.duration_ms(),
            "decision"
        );

        if record.crashed() {
            warn!(agent = agent_index, turn = state.core().turn_count(), "agent crashed");
            state.process_agent_crash(agent_index);
            if state.check_end() {
                // the crash ended the game: recorded, but no turn is played
                state.end_turn()?;
                ui.update(state, &record);
                let (score, turns) = (state.core().score, state.core().turn_count());
                result.record_turn(record, score, turns);
                return Ok(());
            }
            if !state.get_legal_actions().contains(record.action()) {
                let duration = Duration::from_millis(record.duration_ms());
                record = ActionRecord::crash(agent_index, safe_default(state), duration);
            }
        }

        if !state.get_legal_actions().contains(record.action()) {
            return Err(EngineError::IllegalAction {
                agent_index,
                action: record.action().clone(),
            }
            .into());
        }
        state.process_turn(record.action(), rng)?;
        state.end_turn()?;

        ui.update(state, &record);
        let (score, turns) = (state.core().score, state.core().turn_count());
        result.record_turn(record, score, turns);
        Ok(())
    }
}

impl<S: GameState> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("constraints", &self.constraints)
            .finish()
    }
}

fn set_up<S: GameState>(game_info: &GameInfo, state: &mut S) -> anyhow::Result<()> {
    game_info.validate()?;
    check_roster(game_info, state)?;
    state.game_start()?;
    Ok(())
}

fn check_roster<S: GameState>(game_info: &GameInfo, state: &S) -> Result<(), EngineError> {
    let state_agents: Vec<AgentIndex> = state.core().move_delays().keys().copied().collect();
    let roster: Vec<AgentIndex> = game_info.agent_infos.keys().copied().collect();
    if state_agents != roster {
        return Err(EngineError::RosterMismatch {
            state: state_agents,
            roster,
        });
    }
    Ok(())
}

/// User input waiting for each agent.
///
/// Input is broadcast: whatever comes in is queued for every agent, and each agent
/// drains its own queue when it moves.
#[derive(Debug, Default, Clone)]
pub struct UserInputBuffer {
    pending: BTreeMap<AgentIndex, Vec<Action>>,
}

impl UserInputBuffer {
    /// Empty queues for `agent_indexes`.
    pub fn new(agent_indexes: impl IntoIterator<Item = AgentIndex>) -> Self {
        Self {
            pending: agent_indexes
                .into_iter()
                .map(|agent_index| (agent_index, Vec::new()))
                .collect(),
        }
    }

    /// Queue `new_inputs` for everyone, then hand `agent_index` its queue.
    pub fn take(&mut self, agent_index: AgentIndex, new_inputs: Vec<Action>) -> Vec<Action> {
        self.pending.entry(agent_index).or_default();
        for queue in self.pending.values_mut() {
            queue.extend(new_inputs.iter().cloned());
        }
        self.pending
            .get_mut(&agent_index)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::action::{AgentAction, EAST, NORTH, SOUTH, STOP, WEST};
    use crate::agent::AgentInfo;
    use crate::constraints::ConstraintsBuilder;
    use crate::isolation::NoneIsolator;
    use crate::race::RaceState;
    use crate::ui::NullUi;

    fn engine() -> Engine<RaceState> {
        Engine::new(
            AgentRegistry::with_builtin(),
            Configuration::new(),
            Constraints::default(),
        )
    }

    fn scripted(actions: &[&str]) -> AgentInfo {
        AgentInfo::new("scripted").with_arg("actions", serde_json::json!(actions))
    }

    fn game(seed: u64, roster: &[(AgentIndex, AgentInfo)]) -> (GameInfo, RaceState) {
        let agent_infos: BTreeMap<_, _> = roster.iter().cloned().collect();
        let state = RaceState::open_field(2, 3, &agent_infos);
        (GameInfo::new(seed, agent_infos), state)
    }

    /// Counts teardown calls and forwards everything to a [`NoneIsolator`], unless told
    /// to answer `forced` without asking the agent.
    struct Tracking {
        inner: NoneIsolator<RaceState>,
        forced: Option<Action>,
        completed: usize,
        closed: usize,
    }

    impl Tracking {
        fn new() -> Self {
            Self {
                inner: NoneIsolator::new(Arc::new(AgentRegistry::with_builtin())),
                forced: None,
                completed: 0,
                closed: 0,
            }
        }
    }

    impl Isolator<RaceState> for Tracking {
        fn init_agents(
            &mut self,
            agent_infos: &BTreeMap<AgentIndex, AgentInfo>,
        ) -> anyhow::Result<()> {
            self.inner.init_agents(agent_infos)
        }

        fn game_start(
            &mut self,
            rng: &mut GameRng,
            initial_state: &RaceState,
        ) -> anyhow::Result<BTreeMap<AgentIndex, AgentAction>> {
            self.inner.game_start(rng, initial_state)
        }

        fn get_action(
            &mut self,
            state: &RaceState,
            user_inputs: &[Action],
        ) -> anyhow::Result<ActionRecord> {
            match &self.forced {
                Some(action) => Ok(ActionRecord::answered(
                    state.core().agent_index().unwrap(),
                    AgentAction::new(action.clone()),
                    Duration::ZERO,
                )),
                None => self.inner.get_action(state, user_inputs),
            }
        }

        fn game_complete(&mut self, final_state: &RaceState) {
            self.completed += 1;
            self.inner.game_complete(final_state);
        }

        fn close(&mut self) {
            self.closed += 1;
            self.inner.close();
        }
    }

    #[derive(Default)]
    struct Recording {
        started: usize,
        updates: Vec<ActionRecord>,
        completed: bool,
        closed: bool,
        inputs: Vec<Vec<Action>>,
    }

    impl Ui<RaceState> for Recording {
        fn game_start(&mut self, _state: &RaceState, _highlights: &[BoardHighlight]) {
            self.started += 1;
        }

        fn update(&mut self, _state: &RaceState, record: &ActionRecord) {
            self.updates.push(record.clone());
        }

        fn game_complete(&mut self, _state: &RaceState) {
            self.completed = true;
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn get_user_inputs(&mut self) -> Vec<Action> {
            self.inputs.pop().unwrap_or_default()
        }
    }

    #[test]
    fn race_to_the_goal() {
        let (info, state) = game(1, &[(0, scripted(&["east", "east", "south"]))]);
        let mut ui = Recording::default();
        let result = engine().run(&info, state, &mut ui).unwrap();

        assert_eq!(result.turn_count(), 3);
        assert_eq!(result.history().len(), 3);
        assert_eq!(result.score(), -3);
        assert_eq!(result.winners(), &BTreeSet::from([0]));
        assert!(!result.timeout());
        assert!(result.end_time().is_some());

        assert_eq!(ui.started, 1);
        assert_eq!(ui.updates.len(), 3);
        assert!(ui.completed && ui.closed);
    }

    #[test]
    fn turn_budget_times_the_game_out() {
        let (info, state) = game(1, &[(0, AgentInfo::new("dummy")), (1, AgentInfo::new("dummy"))]);
        let result = engine()
            .run(&info.with_max_turns(7), state, &mut NullUi)
            .unwrap();

        assert_eq!(result.turn_count(), 7);
        assert_eq!(result.history().len(), 7);
        assert!(result.timeout());
        assert!(result.winners().is_empty());
    }

    #[test]
    fn time_budget_times_the_game_out() {
        let constraints = ConstraintsBuilder::new()
            .with_game_time_budget(Duration::from_millis(5))
            .build()
            .unwrap();
        let engine = Engine::new(AgentRegistry::with_builtin(), Configuration::new(), constraints);
        let (info, state) = game(1, &[(0, AgentInfo::new("dummy"))]);

        let result = engine.run(&info, state, &mut NullUi).unwrap();
        assert!(result.timeout());
    }

    #[test]
    fn turns_follow_move_delays() {
        let (info, state) = game(
            3,
            &[
                (0, AgentInfo::new("dummy").with_move_delay(100)),
                (1, AgentInfo::new("dummy").with_move_delay(200)),
            ],
        );
        let result = engine()
            .run(&info.with_max_turns(30), state, &mut NullUi)
            .unwrap();

        let moves = |agent| {
            result
                .history()
                .iter()
                .filter(|record| record.agent_index() == agent)
                .count()
        };
        assert_eq!(moves(0), 20);
        assert_eq!(moves(1), 10);
        let order: Vec<_> = result.history()[..3].iter().map(ActionRecord::agent_index).collect();
        assert_eq!(order, vec![0, 1, 0]);
    }

    #[test]
    fn crashes_are_contained() {
        let faulty = AgentInfo::new("faulty").with_arg("mode", "panic");
        let (info, state) = game(1, &[(0, faulty), (1, scripted(&["east", "east"]))]);
        let result = engine().run(&info, state, &mut NullUi).unwrap();

        assert_eq!(result.crashed_agents(), BTreeSet::from([0]));
        assert!(result.history()[0].crashed());
        assert_eq!(result.history()[0].action(), &STOP);
        // agent 1 started on the last row and walked to the goal
        assert_eq!(result.winners(), &BTreeSet::from([1]));
        assert!(!result.timeout());
    }

    #[test]
    fn crash_ending_the_game_is_recorded_without_a_turn() {
        let faulty = AgentInfo::new("faulty").with_arg("mode", "error");
        let (info, state) = game(1, &[(0, faulty)]);
        let result = engine().run(&info, state, &mut NullUi).unwrap();

        assert_eq!(result.history().len(), 1);
        assert_eq!(result.turn_count(), 0);
        assert!(!result.timeout());
        assert!(result.winners().is_empty());
    }

    #[test]
    fn illegal_answers_are_crashes() {
        // agent 0 starts on the first column
        let (info, state) = game(1, &[(0, scripted(&["west"])), (1, scripted(&["east", "east"]))]);
        let result = engine().run(&info, state, &mut NullUi).unwrap();

        assert!(result.history()[0].crashed());
        assert_eq!(result.history()[0].action(), &STOP);
        assert_eq!(result.crashed_agents(), BTreeSet::from([0]));
        assert_eq!(result.winners(), &BTreeSet::from([1]));
    }

    #[test]
    fn illegal_actions_from_the_isolator_abort_but_tear_down() {
        let (info, state) = game(1, &[(0, AgentInfo::new("dummy"))]);
        let mut isolator = Tracking::new();
        isolator.forced = Some(WEST);
        let mut ui = Recording::default();

        let error = engine()
            .run_with_isolator(&info, state, &mut isolator, &mut ui)
            .unwrap_err();
        assert_eq!(
            error.downcast_ref::<EngineError>(),
            Some(&EngineError::IllegalAction {
                agent_index: 0,
                action: WEST
            })
        );
        assert_eq!(isolator.completed, 1);
        assert_eq!(isolator.closed, 1);
        assert!(ui.closed);
        assert!(!ui.completed);
    }

    #[test]
    fn setup_errors_come_before_any_turn() {
        let (info, _) = game(1, &[(0, AgentInfo::new("dummy"))]);
        let other = RaceState::open_field(2, 2, &BTreeMap::from([(5, AgentInfo::new("dummy"))]));
        let error = engine().run(&info, other, &mut NullUi).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<EngineError>(),
            Some(EngineError::RosterMismatch { .. })
        ));

        let (info, state) = game(1, &[(0, AgentInfo::new("ghost"))]);
        let mut isolator = Tracking::new();
        let mut ui = Recording::default();
        assert!(engine()
            .run_with_isolator(&info, state, &mut isolator, &mut ui)
            .is_err());
        assert_eq!(isolator.closed, 1);
        assert_eq!(ui.started, 0);
    }

    #[test]
    fn setup_errors_close_the_isolator() {
        let (info, _) = game(1, &[(0, AgentInfo::new("dummy"))]);
        let mismatched = RaceState::open_field(2, 2, &BTreeMap::from([(5, AgentInfo::new("dummy"))]));
        let (bad_delay, bad_state) = game(1, &[(0, AgentInfo::new("dummy").with_move_delay(0))]);

        for (game_info, state) in [(info, mismatched), (bad_delay, bad_state)] {
            let mut isolator = Tracking::new();
            let mut ui = Recording::default();
            assert!(engine()
                .run_with_isolator(&game_info, state, &mut isolator, &mut ui)
                .is_err());
            assert_eq!(isolator.closed, 1);
            assert!(ui.closed);
            assert_eq!(ui.started, 0);
        }
    }

    #[test]
    fn same_seed_same_game() {
        let roster = [(0, AgentInfo::new("random")), (1, AgentInfo::new("random"))];
        let play = |seed| {
            let (info, state) = game(seed, &roster);
            engine()
                .run(&info.with_max_turns(20), state, &mut NullUi)
                .unwrap()
        };
        let (first, second) = (play(11), play(11));

        assert_eq!(first.game_id(), second.game_id());
        let actions = |result: &GameResult| {
            result
                .history()
                .iter()
                .map(|record| record.action().clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(actions(&first), actions(&second));
        assert_ne!(play(12).game_id(), first.game_id());
    }

    #[test]
    fn user_input_reaches_the_agent() {
        let (info, state) = game(1, &[(0, AgentInfo::new("user-input"))]);
        let mut ui = Recording {
            // popped from the back: first turn gets NORTH (illegal, ignored) then EAST
            inputs: vec![vec![SOUTH], vec![], vec![NORTH, EAST]],
            ..Default::default()
        };
        let result = engine()
            .run(&info.with_max_turns(3), state, &mut ui)
            .unwrap();

        let actions: Vec<_> = result.history().iter().map(|r| r.action().clone()).collect();
        assert_eq!(actions, vec![EAST, EAST, SOUTH]);
        assert_eq!(result.winners(), &BTreeSet::from([0]));
    }

    #[test]
    fn user_input_is_broadcast() {
        let mut buffer = UserInputBuffer::new([0, 1]);
        assert_eq!(buffer.take(0, vec![NORTH]), vec![NORTH]);
        assert_eq!(buffer.take(0, vec![]), vec![]);
        assert_eq!(buffer.take(1, vec![EAST]), vec![NORTH, EAST]);
        assert_eq!(buffer.take(0, vec![]), vec![EAST]);
        assert_eq!(buffer.take(7, vec![STOP]), vec![STOP]);
    }
}
