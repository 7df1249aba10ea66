//! Hooks for whatever displays a game.
//!
//! The engine only notifies a [`Ui`] and asks it for buffered user input; it never
//! depends on what is rendered.

use crate::action::{Action, ActionRecord, BoardHighlight};
use crate::game_state::GameState;

/// Receives game events from the engine loop. Every method defaults to doing nothing.
pub trait Ui<S: GameState> {
    /// The game starts. `highlights` are those agents sent back while starting.
    fn game_start(&mut self, _state: &S, _highlights: &[BoardHighlight]) {}

    /// A turn was played (or an agent crashed); `state` is the state after it.
    fn update(&mut self, _state: &S, _record: &ActionRecord) {}

    /// The game is over.
    fn game_complete(&mut self, _state: &S) {}

    /// Release the display. Called once, after [`game_complete`](Ui::game_complete).
    fn close(&mut self) {}

    /// User input collected since the last call.
    fn get_user_inputs(&mut self) -> Vec<Action> {
        vec![]
    }
}

/// A UI that shows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUi;

impl<S: GameState> Ui<S> for NullUi {}
