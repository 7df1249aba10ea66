//! Messages exchanged between an isolator and a worker hosting one agent.
//!
//! Both the process and the network backends use the same framing: one JSON document
//! per line, in each direction. The engine always speaks first, with `init`.
//!
//! ```text
//! engine                         worker
//!   init            ----------->
//!                   <-----------  ready | failed
//!   start           ----------->
//!                   <-----------  started | failed
//!   action_request  ----------->
//!                   <-----------  action_response
//!   complete        ----------->
//!                   <-----------  completed | failed
//! ```
//!
//! Every message is `{"type": <kind>, "body": <fields>}`; kinds without fields have no
//! body. Lines longer than [`MAX_MESSAGE_LEN`] are rejected.
//!
//! Messages to one worker are strictly FIFO, and an `action_request` is answered before
//! the next one is sent.

use std::io::{BufRead, Read, Write};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::{Action, ActionRecord, AgentAction};
use crate::agent::{AgentIndex, AgentInfo};

/// Engine to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Command<S> {
    /// Build the agent.
    Init {
        /// Index of the hosted agent.
        agent_index: AgentIndex,
        /// What to build.
        agent_info: AgentInfo,
    },
    /// The game starts.
    Start {
        /// Index of the hosted agent.
        agent_index: AgentIndex,
        /// Seed the agent should use.
        seed: u64,
        /// State after the game started.
        initial_state: S,
    },
    /// The hosted agent must choose an action.
    ActionRequest {
        /// Echoed in the response.
        request_id: u64,
        /// Current state. Its active agent is the hosted one.
        state: S,
        /// Inputs the user gave since the agent last moved.
        user_inputs: Vec<Action>,
    },
    /// The game is over.
    Complete {
        /// Final state.
        final_state: S,
    },
}

/// Worker to engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Response {
    /// The agent was built.
    Ready,
    /// The agent started.
    Started {
        /// What the agent answered while starting, if anything.
        #[serde(default)]
        info: Option<AgentAction>,
    },
    /// Answer to an `action_request`.
    ActionResponse {
        /// Id of the request this answers.
        request_id: u64,
        /// The decision, possibly a crash record built by the worker.
        record: ActionRecord,
    },
    /// The agent acknowledged the end of the game.
    Completed,
    /// The last command could not be carried out.
    Failed {
        /// Why.
        message: String,
    },
}

impl Response {
    /// Short name of the message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Ready => "ready",
            Response::Started { .. } => "started",
            Response::ActionResponse { .. } => "action_response",
            Response::Completed => "completed",
            Response::Failed { .. } => "failed",
        }
    }
}

/// Write one message and flush.
pub fn write_message<T: Serialize>(writer: &mut impl Write, message: &T) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(message).context("could not serialize message")?;
    line.push(b'\n');
    writer.write_all(&line).context("could not send message")?;
    writer.flush().context("could not flush message")
}

/// Longest line accepted, newline included.
pub const MAX_MESSAGE_LEN: u64 = 16 * 1024 * 1024;

/// A line that is not a message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// No newline within [`MAX_MESSAGE_LEN`] bytes.
    #[error("message longer than {MAX_MESSAGE_LEN} bytes")]
    TooLong,
    /// Not valid JSON for the expected message.
    #[error("malformed message: {line}")]
    Malformed {
        /// The offending line, cut to a readable length.
        line: String,
        /// What serde_json complained about.
        #[source]
        source: serde_json::Error,
    },
}

/// Read one message. `Ok(None)` on end of stream.
///
/// # Errors
/// [`ProtocolError`] for an oversized or malformed line, an I/O error otherwise.
pub fn read_message<T: DeserializeOwned>(reader: &mut impl BufRead) -> anyhow::Result<Option<T>> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = (&mut *reader)
            .take(MAX_MESSAGE_LEN)
            .read_line(&mut line)
            .context("could not read message")?;
        if n == 0 {
            return Ok(None);
        }
        if n as u64 == MAX_MESSAGE_LEN && !line.ends_with('\n') {
            return Err(ProtocolError::TooLong.into());
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    let line = line.trim_end();
    match serde_json::from_str(line) {
        Ok(message) => Ok(Some(message)),
        Err(source) => Err(ProtocolError::Malformed {
            line: line.chars().take(200).collect(),
            source,
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Cursor;

    use serde_json::json;

    use super::*;
    use crate::action::{EAST, STOP};
    use crate::game_state::GameState;
    use crate::race::RaceState;

    #[test]
    fn commands_are_tagged() {
        let command: Command<u32> = Command::ActionRequest {
            request_id: 7,
            state: 3,
            user_inputs: vec![STOP],
        };
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["type"], "action_request");
        assert_eq!(json["body"]["request_id"], 7);
        assert_eq!(json["body"]["user_inputs"][0], "stop");
        assert_eq!(serde_json::to_value(Response::Ready).unwrap(), json!({"type": "ready"}));
    }

    #[test]
    fn states_survive_the_trip() {
        let roster = BTreeMap::from([
            (0, AgentInfo::new("dummy")),
            (3, AgentInfo::new("dummy").with_move_delay(40)),
        ]);
        let mut state = RaceState::open_field(3, 4, &roster);
        state.game_start().unwrap();
        let command = Command::ActionRequest {
            request_id: 1,
            state,
            user_inputs: vec![EAST],
        };

        let mut buffer = Vec::new();
        write_message(&mut buffer, &command).unwrap();
        let back: Command<RaceState> = read_message(&mut Cursor::new(buffer)).unwrap().unwrap();

        let Command::ActionRequest { request_id, state: received, user_inputs } = &back else {
            panic!("unexpected {back:?}");
        };
        assert_eq!(*request_id, 1);
        assert_eq!(user_inputs, &vec![EAST]);
        assert_eq!(received.core().tickets().len(), 2);
        assert_eq!(received.core().move_delays()[&3], 40);
        assert_eq!(
            serde_json::to_value(&back).unwrap(),
            serde_json::to_value(&command).unwrap()
        );
    }

    #[test]
    fn oversized_lines_are_rejected() {
        let long = vec![b'x'; MAX_MESSAGE_LEN as usize + 10];
        let result: anyhow::Result<Option<Response>> = read_message(&mut Cursor::new(long));
        let error = result.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::TooLong)
        ));
    }

    #[test]
    fn one_message_per_line() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &Response::Ready).unwrap();
        write_message(&mut buffer, &Response::Completed).unwrap();
        assert_eq!(buffer.iter().filter(|b| **b == b'\n').count(), 2);

        let mut reader = Cursor::new(buffer);
        let first: Option<Response> = read_message(&mut reader).unwrap();
        let second: Option<Response> = read_message(&mut reader).unwrap();
        let end: Option<Response> = read_message(&mut reader).unwrap();
        assert_eq!(first, Some(Response::Ready));
        assert_eq!(second, Some(Response::Completed));
        assert_eq!(end, None);
    }

    #[test]
    fn started_info_is_optional() {
        let response: Response =
            serde_json::from_str(r#"{"type": "started", "body": {}}"#).unwrap();
        assert_eq!(response, Response::Started { info: None });
    }

    #[test]
    fn garbage_is_an_error() {
        let mut reader = Cursor::new(b"\n{not json}\n".to_vec());
        let result: anyhow::Result<Option<Response>> = read_message(&mut reader);
        assert!(matches!(
            result.unwrap_err().downcast_ref::<ProtocolError>(),
            Some(ProtocolError::Malformed { .. })
        ));
    }
}
