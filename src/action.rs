//! Actions and the records the isolators hand back to the engine.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentIndex;
use crate::board::Position;
use crate::error::EngineError;

/// An action an agent may take.
///
/// The standard actions are provided as constants, but games are free to define their own
/// (e.g. an "exit" action).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(Cow<'static, str>);

/// Move up one row.
pub const NORTH: Action = Action(Cow::Borrowed("north"));
/// Move right one column.
pub const EAST: Action = Action(Cow::Borrowed("east"));
/// Move down one row.
pub const SOUTH: Action = Action(Cow::Borrowed("south"));
/// Move left one column.
pub const WEST: Action = Action(Cow::Borrowed("west"));
/// Do nothing. Conventionally always legal.
pub const STOP: Action = Action(Cow::Borrowed("stop"));

/// The four cardinal moves, in clockwise order starting north.
pub const CARDINAL_DIRECTIONS: [Action; 4] = [NORTH, EAST, SOUTH, WEST];

impl Action {
    /// Create a custom action.
    pub fn new(name: impl Into<String>) -> Self {
        Action(Cow::Owned(name.into()))
    }

    /// The action's name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The opposite cardinal direction, `None` for anything else (including `STOP`).
    pub fn reverse(&self) -> Option<Action> {
        match self.as_str() {
            "north" => Some(SOUTH),
            "east" => Some(WEST),
            "south" => Some(NORTH),
            "west" => Some(EAST),
            _ => None,
        }
    }

    /// Row/column offset of a cardinal move, `None` for anything else.
    pub fn offset(&self) -> Option<(i32, i32)> {
        match self.as_str() {
            "north" => Some((-1, 0)),
            "east" => Some((0, 1)),
            "south" => Some((1, 0)),
            "west" => Some((0, -1)),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Action {
    fn from(value: &str) -> Self {
        Action::new(value)
    }
}

/// Upper bound of an integer highlight intensity.
pub const MAX_INTENSITY: u32 = 1000;

/// A request from an agent to emphasize a board position (e.g. to visualize values).
///
/// Intensities above [`MAX_INTENSITY`] are rejected, including when deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawHighlight")]
pub struct BoardHighlight {
    /// Highlighted position.
    pub position: Position,
    /// Intensity in `[0, MAX_INTENSITY]`, or `None` to clear a previous highlight.
    pub intensity: Option<u32>,
}

impl BoardHighlight {
    /// Highlight with an integer intensity.
    pub fn new(position: Position, intensity: Option<u32>) -> Result<Self, EngineError> {
        if let Some(value) = intensity {
            if value > MAX_INTENSITY {
                return Err(EngineError::InvalidHighlight(value.to_string()));
            }
        }
        Ok(Self {
            position,
            intensity,
        })
    }

    /// Highlight with a ratio in `[0.0, 1.0]`, scaled to the integer range.
    pub fn from_ratio(position: Position, ratio: f64) -> Result<Self, EngineError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(EngineError::InvalidHighlight(ratio.to_string()));
        }
        let intensity = (ratio * f64::from(MAX_INTENSITY)) as u32;
        Self::new(position, Some(intensity))
    }
}

#[derive(Deserialize)]
struct RawHighlight {
    position: Position,
    intensity: Option<u32>,
}

impl TryFrom<RawHighlight> for BoardHighlight {
    type Error = EngineError;

    fn try_from(raw: RawHighlight) -> Result<Self, Self::Error> {
        BoardHighlight::new(raw.position, raw.intensity)
    }
}

/// Everything an agent answers when asked for an action.
///
/// Most agents only provide the action; highlights and `other_info` are optional
/// extras that specific games may use or ignore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAction {
    /// The chosen action.
    pub action: Action,
    /// Positions the agent would like emphasized.
    #[serde(default)]
    pub board_highlights: Vec<BoardHighlight>,
    /// Free-form data for the game.
    #[serde(default)]
    pub other_info: serde_json::Map<String, serde_json::Value>,
}

impl AgentAction {
    /// A bare action.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            board_highlights: vec![],
            other_info: serde_json::Map::new(),
        }
    }
}

impl From<Action> for AgentAction {
    fn from(action: Action) -> Self {
        AgentAction::new(action)
    }
}

/// One decision, as seen by the engine.
///
/// Built once by an isolator and never changed afterwards; the engine only reads it
/// and appends it to the game history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    agent_index: AgentIndex,
    action: Action,
    duration_ms: u64,
    crashed: bool,
    #[serde(default)]
    board_highlights: Vec<BoardHighlight>,
    #[serde(default)]
    other_info: serde_json::Map<String, serde_json::Value>,
}

impl ActionRecord {
    /// Record of an agent that answered.
    pub fn answered(agent_index: AgentIndex, response: AgentAction, duration: Duration) -> Self {
        Self {
            agent_index,
            action: response.action,
            duration_ms: duration_to_ms(duration),
            crashed: false,
            board_highlights: response.board_highlights,
            other_info: response.other_info,
        }
    }

    /// Record of an agent that failed; `fallback` is the action played in its place.
    pub fn crash(agent_index: AgentIndex, fallback: Action, duration: Duration) -> Self {
        Self {
            agent_index,
            action: fallback,
            duration_ms: duration_to_ms(duration),
            crashed: true,
            board_highlights: vec![],
            other_info: serde_json::Map::new(),
        }
    }

    /// The agent that made this decision.
    pub fn agent_index(&self) -> AgentIndex {
        self.agent_index
    }

    /// The action to play (the fallback when the agent crashed).
    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Wall-clock time spent deciding, in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Whether the agent failed to produce an action within contract.
    pub fn crashed(&self) -> bool {
        self.crashed
    }

    /// Highlights the agent asked for.
    pub fn board_highlights(&self) -> &[BoardHighlight] {
        &self.board_highlights
    }

    /// Extra data the agent sent along.
    pub fn other_info(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.other_info
    }

    /// The agent's answer, without the bookkeeping.
    pub(crate) fn into_response(self) -> AgentAction {
        AgentAction {
            action: self.action,
            board_highlights: self.board_highlights,
            other_info: self.other_info,
        }
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_and_offsets() {
        for action in CARDINAL_DIRECTIONS {
            let reverse = action.reverse().unwrap();
            let (dr, dc) = action.offset().unwrap();
            let (rr, rc) = reverse.offset().unwrap();
            assert_eq!((dr + rr, dc + rc), (0, 0), "{action}");
        }
        assert_eq!(STOP.reverse(), None);
        assert_eq!(Action::new("exit").offset(), None);
    }

    #[test]
    fn custom_action_equals_constant() {
        assert_eq!(Action::new("north"), NORTH);
        assert_eq!(Action::from("stop"), STOP);
    }

    #[test]
    fn action_serializes_as_plain_string() {
        let json = serde_json::to_string(&WEST).unwrap();
        assert_eq!(json, "\"west\"");
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(back, WEST);
    }

    #[test]
    fn highlight_bounds() {
        let position = Position::new(1, 2);
        assert!(BoardHighlight::new(position, Some(MAX_INTENSITY)).is_ok());
        assert!(BoardHighlight::new(position, None).is_ok());
        assert!(matches!(
            BoardHighlight::new(position, Some(MAX_INTENSITY + 1)),
            Err(EngineError::InvalidHighlight(_))
        ));

        let half = BoardHighlight::from_ratio(position, 0.5).unwrap();
        assert_eq!(half.intensity, Some(500));
        assert!(BoardHighlight::from_ratio(position, 1.5).is_err());
        assert!(BoardHighlight::from_ratio(position, -0.1).is_err());
    }

    #[test]
    fn crashed_record_drops_extras() {
        let record = ActionRecord::crash(3, STOP, Duration::from_millis(12));
        assert!(record.crashed());
        assert_eq!(record.action(), &STOP);
        assert_eq!(record.agent_index(), 3);
        assert_eq!(record.duration_ms(), 12);
        assert!(record.board_highlights().is_empty());
    }

    #[test]
    fn out_of_range_highlights_do_not_deserialize() {
        let valid = r#"{"position": {"row": 1, "col": 0}, "intensity": 1000}"#;
        let highlight: BoardHighlight = serde_json::from_str(valid).unwrap();
        assert_eq!(highlight.intensity, Some(MAX_INTENSITY));

        let too_bright = r#"{"action": "east", "board_highlights": [{"position": {"row": 1, "col": 0}, "intensity": 1001}]}"#;
        assert!(serde_json::from_str::<AgentAction>(too_bright).is_err());
    }
}
