//! # Ai Game Engine
//!
//! The core of a turn-based, multi-agent game engine: it advances a shared game state one
//! agent turn at a time, and keeps the engine safe from agent code that is slow, buggy or
//! hostile.
//!
//! It provides:
//! - Fair turn ordering for agents of different speeds, through [`Ticket`](crate::ticket::Ticket)s
//! - A state contract every concrete game implements ([`GameState`](crate::game_state::GameState))
//! - Agent isolation with three backends: same thread, one worker process per agent
//!   (optionally in a cgroup v2 with memory and CPU limits), or workers over TCP
//! - The game loop ([`Engine`](crate::engine::Engine)) and its append-only
//!   [`GameResult`](crate::result::GameResult), with replays
//!
//! Agent faults (errors, panics, timeouts, dead workers) never reach the caller: they
//! become crashed records in the game history, and the game decides what a crash costs.
//!
//! # Documentation Overview
//!
//! - For the turn protocol and what a game must implement, see [`game_state`].
//! - For isolation backends and the worker protocol, see [`isolation`].
//! - For budgets and resource limits, see [`Configuration`](crate::configuration::Configuration)
//!   and [`constraints`].
//! - For agents, see [`agent`] and the built-in ones in [`agents`].
//!
//! # Usage Example
//!
//! Below is a race on a small field between a random agent and a scripted one:
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::time::Duration;
//!
//! use ai_game_engine::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let constraints = ConstraintsBuilder::new()
//!         .with_action_timeout(Duration::from_millis(100))
//!         .build()?;
//!     let config = Configuration::new();
//!     let engine = Engine::new(AgentRegistry::with_builtin(), config, constraints);
//!
//!     let roster = BTreeMap::from([
//!         (0, AgentInfo::new("random")),
//!         (1, AgentInfo::new("scripted").with_arg("actions", serde_json::json!(["east"]))),
//!     ]);
//!     let state = RaceState::open_field(3, 3, &roster);
//!     let game_info = GameInfo::new(42, roster).with_max_turns(100);
//!
//!     let result = engine.run(&game_info, state, &mut NullUi)?;
//!     println!("winners: {:?}, score: {}", result.winners(), result.score());
//!     Ok(())
//! }
//! ```
//!
//! # Worker Processes
//!
//! The process and TCP backends run agents in a worker program that hosts one agent and
//! answers the engine's commands. For a game of your own, the worker is a few lines around
//! [`run_worker`](crate::isolation::worker::run_worker); the `agent-worker` binary of
//! this crate is the one for [`RaceState`](crate::race::RaceState).
#![warn(missing_docs)]

pub use anyhow;

pub mod action;
pub mod agent;
pub mod agents;
pub mod board;
mod cgroup_manager;
pub mod configuration;
pub mod constraints;
pub mod engine;
pub mod error;
pub mod game_info;
pub mod game_state;
pub mod isolation;
pub mod logger;
pub mod race;
pub mod replay;
pub mod result;
pub mod rng;
pub mod ticket;
pub mod ui;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use ai_game_engine::prelude::*;
/// ```
///
/// Includes:
/// - [`Engine`](crate::engine::Engine), [`GameInfo`](crate::game_info::GameInfo) and
///   [`GameResult`](crate::result::GameResult)
/// - [`Configuration`](crate::configuration::Configuration) and
///   [`ConstraintsBuilder`](crate::constraints::ConstraintsBuilder)
/// - the [`GameState`](crate::game_state::GameState), [`Agent`](crate::agent::Agent),
///   [`Board`](crate::board::Board), [`Isolator`](crate::isolation::Isolator) and
///   [`Ui`](crate::ui::Ui) traits
pub mod prelude {
    pub use crate::action::{
        Action, ActionRecord, AgentAction, BoardHighlight, EAST, NORTH, SOUTH, STOP, WEST,
    };
    pub use crate::agent::{Agent, AgentIndex, AgentInfo, AgentRegistry};
    pub use crate::board::{Board, GridBoard, Position};
    pub use crate::configuration::Configuration;
    pub use crate::constraints::{Constraints, ConstraintsBuilder};
    pub use crate::engine::Engine;
    pub use crate::error::EngineError;
    pub use crate::game_info::GameInfo;
    pub use crate::game_state::{GameState, StateCore};
    pub use crate::isolation::{IsolationLevel, Isolator};
    pub use crate::race::RaceState;
    pub use crate::result::GameResult;
    pub use crate::rng::GameRng;
    pub use crate::ui::{NullUi, Ui};
}
