//! The other end of the process and network backends: hosts one agent and answers the
//! engine's commands.
//!
//! A worker program for a game is a few lines:
//!
//! ```no_run
//! # use ai_game_engine::prelude::*;
//! use ai_game_engine::isolation::worker::run_worker;
//!
//! fn main() -> anyhow::Result<()> {
//!     let registry = AgentRegistry::<RaceState>::with_builtin();
//!     let stdin = std::io::stdin().lock();
//!     run_worker(&registry, stdin, std::io::stdout())
//! }
//! ```

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Instant;

use anyhow::Context;
use tracing::{debug, info, warn};

use super::protocol::{read_message, write_message, Command, Response};
use super::{call_agent, checked_record};
use crate::agent::{Agent, AgentIndex, AgentRegistry};
use crate::game_state::GameState;

/// Serve commands from `reader` until the engine closes it.
///
/// Agent failures are reported to the engine (as `failed` messages or crash records),
/// they never end the loop.
///
/// # Errors
/// When the engine cannot be written to anymore.
pub fn run_worker<S: GameState>(
    registry: &AgentRegistry<S>,
    mut reader: impl BufRead,
    mut writer: impl Write,
) -> anyhow::Result<()> {
    let mut agent: Option<(AgentIndex, Box<dyn Agent<S>>)> = None;

    loop {
        let command = match read_message::<Command<S>>(&mut reader) {
            Ok(Some(command)) => command,
            Ok(None) => break,
            Err(e) => {
                warn!("bad command: {e:#}");
                write_message(&mut writer, &Response::Failed {
                    message: format!("{e:#}"),
                })?;
                continue;
            }
        };

        let response = match command {
            Command::Init {
                agent_index,
                agent_info,
            } => match registry.create(&agent_info) {
                Ok(built) => {
                    debug!(agent = agent_index, name = %agent_info.name, "agent built");
                    agent = Some((agent_index, built));
                    Response::Ready
                }
                Err(e) => Response::Failed {
                    message: format!("{e:#}"),
                },
            },
            Command::Start {
                agent_index,
                seed,
                initial_state,
            } => match agent.as_mut() {
                Some((_, hosted)) => {
                    match call_agent(|| hosted.game_start(agent_index, seed, &initial_state)) {
                        Ok(info) => Response::Started { info },
                        Err(e) => Response::Failed {
                            message: format!("{e:#}"),
                        },
                    }
                }
                None => not_initialized(),
            },
            Command::ActionRequest {
                request_id,
                state,
                user_inputs,
            } => match agent.as_mut() {
                Some((agent_index, hosted)) => {
                    let start = Instant::now();
                    let result = call_agent(|| hosted.get_action_full(&state, &user_inputs));
                    let duration = start.elapsed();
                    let record = checked_record(&state, *agent_index, result, duration);
                    Response::ActionResponse { request_id, record }
                }
                None => not_initialized(),
            },
            Command::Complete { final_state } => match agent.as_mut() {
                Some((_, hosted)) => match call_agent(|| hosted.game_complete(&final_state)) {
                    Ok(()) => Response::Completed,
                    Err(e) => Response::Failed {
                        message: format!("{e:#}"),
                    },
                },
                None => not_initialized(),
            },
        };

        write_message(&mut writer, &response).context("engine is gone")?;
    }

    debug!("engine closed the channel");
    Ok(())
}

fn not_initialized() -> Response {
    Response::Failed {
        message: "no agent: init was not received".to_string(),
    }
}

/// Connect to a network isolator at `address` and serve it.
pub fn connect_worker<S: GameState>(
    registry: &AgentRegistry<S>,
    address: SocketAddr,
) -> anyhow::Result<()> {
    let stream =
        TcpStream::connect(address).with_context(|| format!("could not connect to {address}"))?;
    stream.set_nodelay(true).ok();
    info!(%address, "connected to engine");
    let reader = BufReader::new(stream.try_clone().context("could not clone stream")?);
    run_worker(registry, reader, stream)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Cursor;

    use super::*;
    use crate::action::{AgentAction, EAST, STOP};
    use crate::agent::AgentInfo;
    use crate::race::RaceState;

    fn script(commands: &[Command<RaceState>]) -> Cursor<Vec<u8>> {
        let mut input = Vec::new();
        for command in commands {
            write_message(&mut input, command).unwrap();
        }
        Cursor::new(input)
    }

    fn responses(output: Vec<u8>) -> Vec<Response> {
        let mut reader = Cursor::new(output);
        let mut responses = Vec::new();
        while let Some(response) = read_message(&mut reader).unwrap() {
            responses.push(response);
        }
        responses
    }

    fn state(info: &AgentInfo) -> RaceState {
        let roster = BTreeMap::from([(0, info.clone())]);
        let mut state = RaceState::open_field(2, 2, &roster);
        state.game_start().unwrap();
        state
    }

    #[test]
    fn full_session() {
        let info = AgentInfo::new("scripted").with_arg("actions", serde_json::json!(["east"]));
        let state = state(&info);
        let input = script(&[
            Command::Init {
                agent_index: 0,
                agent_info: info,
            },
            Command::Start {
                agent_index: 0,
                seed: 3,
                initial_state: state.clone(),
            },
            Command::ActionRequest {
                request_id: 0,
                state: state.clone(),
                user_inputs: vec![],
            },
            Command::Complete { final_state: state },
        ]);
        let mut output = Vec::new();
        run_worker(&AgentRegistry::<RaceState>::with_builtin(), input, &mut output).unwrap();

        let responses = responses(output);
        assert_eq!(responses.len(), 4);
        assert_eq!(responses[0], Response::Ready);
        assert_eq!(responses[1], Response::Started { info: None });
        match &responses[2] {
            Response::ActionResponse { request_id, record } => {
                assert_eq!(*request_id, 0);
                assert_eq!(record.action(), &EAST);
                assert!(!record.crashed());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(responses[3], Response::Completed);
    }

    #[test]
    fn crashes_become_records() {
        let info = AgentInfo::new("faulty").with_arg("mode", "panic");
        let state = state(&info);
        let input = script(&[
            Command::Init {
                agent_index: 0,
                agent_info: info,
            },
            Command::ActionRequest {
                request_id: 9,
                state,
                user_inputs: vec![],
            },
        ]);
        let mut output = Vec::new();
        run_worker(&AgentRegistry::<RaceState>::with_builtin(), input, &mut output).unwrap();

        let expected_fallback = AgentAction::new(STOP);
        match &responses(output)[1] {
            Response::ActionResponse { request_id, record } => {
                assert_eq!(*request_id, 9);
                assert!(record.crashed());
                assert_eq!(record.action(), &expected_fallback.action);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn commands_before_init_fail() {
        let info = AgentInfo::new("dummy");
        let input = script(&[Command::Complete {
            final_state: state(&info),
        }]);
        let mut output = Vec::new();
        run_worker(&AgentRegistry::<RaceState>::with_builtin(), input, &mut output).unwrap();
        assert!(matches!(responses(output)[0], Response::Failed { .. }));
    }

    #[test]
    fn unknown_agent_and_garbage() {
        let mut input = b"not json\n".to_vec();
        write_message(
            &mut input,
            &Command::<RaceState>::Init {
                agent_index: 0,
                agent_info: AgentInfo::new("ghost"),
            },
        )
        .unwrap();
        let mut output = Vec::new();
        run_worker(&AgentRegistry::<RaceState>::with_builtin(), Cursor::new(input), &mut output)
            .unwrap();

        let responses = responses(output);
        assert_eq!(responses.len(), 2);
        assert!(responses
            .iter()
            .all(|response| matches!(response, Response::Failed { .. })));
    }
}
