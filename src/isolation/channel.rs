//! One engine-side connection to a worker: a writer for commands and a reader thread
//! feeding responses into an mpsc channel, so every wait can be bounded.

use std::io::{BufReader, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::protocol::{read_message, write_message, Command, ProtocolError, Response};
use crate::action::{Action, ActionRecord, AgentAction};
use crate::agent::{AgentIndex, AgentInfo};

enum Incoming {
    Message(Response),
    Malformed(String),
    Closed,
}

pub(crate) struct AgentChannel {
    agent_index: AgentIndex,
    writer: Option<Box<dyn Write + Send>>,
    responses: Receiver<Incoming>,
    reader: Option<JoinHandle<()>>,
    dead: bool,
    next_request_id: u64,
    /// Action request sent but not answered yet (it timed out).
    pending: Option<u64>,
}

impl std::fmt::Debug for AgentChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentChannel")
            .field("agent_index", &self.agent_index)
            .field("dead", &self.dead)
            .field("pending", &self.pending)
            .finish()
    }
}

impl AgentChannel {
    pub(crate) fn new<R, W>(agent_index: AgentIndex, reader: R, writer: W) -> anyhow::Result<Self>
    where
        R: std::io::Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (sender, responses) = mpsc::channel();
        let reader = thread::Builder::new()
            .name(format!("agent-{agent_index}-reader"))
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                loop {
                    let incoming = match read_message::<Response>(&mut reader) {
                        Ok(Some(response)) => Incoming::Message(response),
                        Ok(None) => Incoming::Closed,
                        Err(e) if e.downcast_ref::<ProtocolError>().is_some() => {
                            Incoming::Malformed(format!("{e:#}"))
                        }
                        Err(_) => Incoming::Closed,
                    };
                    // nothing after a broken message is trusted
                    let last = !matches!(incoming, Incoming::Message(_));
                    if sender.send(incoming).is_err() || last {
                        break;
                    }
                }
            })
            .context("could not spawn reader thread")?;

        Ok(Self {
            agent_index,
            writer: Some(Box::new(writer)),
            responses,
            reader: Some(reader),
            dead: false,
            next_request_id: 0,
            pending: None,
        })
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead
    }

    pub(crate) fn send<S: Serialize>(&mut self, command: &Command<S>) -> anyhow::Result<()> {
        if self.dead {
            bail!("agent {} is gone", self.agent_index);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("channel to agent {} is closed", self.agent_index))?;
        if let Err(e) = write_message(writer, command) {
            self.dead = true;
            return Err(e.context(format!("agent {} stopped listening", self.agent_index)));
        }
        Ok(())
    }

    /// Next response, waiting until `deadline` at most.
    pub(crate) fn recv(&mut self, deadline: Instant) -> anyhow::Result<Response> {
        if self.dead {
            bail!("agent {} is gone", self.agent_index);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.responses.recv_timeout(remaining) {
            Ok(Incoming::Message(response)) => {
                trace!(agent = self.agent_index, kind = response.kind(), "received");
                Ok(response)
            }
            Ok(Incoming::Malformed(message)) => {
                self.dead = true;
                Err(anyhow!(
                    "agent {} broke the protocol: {message}",
                    self.agent_index
                ))
            }
            Ok(Incoming::Closed) | Err(RecvTimeoutError::Disconnected) => {
                self.dead = true;
                Err(anyhow!("agent {} closed its channel", self.agent_index))
            }
            Err(RecvTimeoutError::Timeout) => Err(anyhow!(
                "agent {} did not answer in time",
                self.agent_index
            )),
        }
    }

    /// Send `init` and wait for the agent to be built.
    pub(crate) fn init(&mut self, agent_info: &AgentInfo, timeout: Duration) -> anyhow::Result<()> {
        self.send(&Command::<()>::Init {
            agent_index: self.agent_index,
            agent_info: agent_info.clone(),
        })?;
        let deadline = Instant::now() + timeout;
        loop {
            match self.recv(deadline)? {
                Response::Ready => return Ok(()),
                Response::Failed { message } => {
                    bail!("agent {} could not be built: {message}", self.agent_index)
                }
                other => debug!(agent = self.agent_index, kind = other.kind(), "unexpected response"),
            }
        }
    }

    /// Wait for the acknowledgement of a `start` sent earlier.
    pub(crate) fn await_started(&mut self, deadline: Instant) -> anyhow::Result<Option<AgentAction>> {
        loop {
            match self.recv(deadline)? {
                Response::Started { info } => return Ok(info),
                Response::Failed { message } => {
                    bail!("agent {} failed to start: {message}", self.agent_index)
                }
                other => debug!(agent = self.agent_index, kind = other.kind(), "unexpected response"),
            }
        }
    }

    /// Ask for an action and wait for the matching answer.
    ///
    /// A request that timed out earlier is waited for first (its answer is dropped), so
    /// a worker never has two requests in flight.
    pub(crate) fn request_action<S: Serialize>(
        &mut self,
        state: &S,
        user_inputs: &[Action],
        timeout: Duration,
    ) -> anyhow::Result<ActionRecord> {
        let deadline = Instant::now() + timeout;

        if let Some(stale) = self.pending {
            let record = self
                .await_action(stale, deadline)
                .context("previous request still unanswered")?;
            debug!(
                agent = self.agent_index,
                request_id = stale,
                action = %record.action(),
                "discarding late answer"
            );
            self.pending = None;
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.send(&Command::ActionRequest {
            request_id,
            state,
            user_inputs: user_inputs.to_vec(),
        })?;
        self.pending = Some(request_id);

        let record = self.await_action(request_id, deadline)?;
        self.pending = None;
        Ok(record)
    }

    fn await_action(&mut self, request_id: u64, deadline: Instant) -> anyhow::Result<ActionRecord> {
        loop {
            match self.recv(deadline)? {
                Response::ActionResponse {
                    request_id: id,
                    record,
                } if id == request_id => return Ok(record),
                Response::ActionResponse { request_id: id, .. } => {
                    debug!(agent = self.agent_index, request_id = id, "discarding stale answer");
                }
                Response::Failed { message } => {
                    bail!("agent {} failed: {message}", self.agent_index)
                }
                other => debug!(agent = self.agent_index, kind = other.kind(), "unexpected response"),
            }
        }
    }

    /// Send `complete` and wait for the acknowledgement.
    pub(crate) fn complete<S: Serialize>(&mut self, final_state: &S, timeout: Duration) -> anyhow::Result<()> {
        self.send(&Command::Complete { final_state })?;
        let deadline = Instant::now() + timeout;
        loop {
            match self.recv(deadline)? {
                Response::Completed => return Ok(()),
                Response::Failed { message } => {
                    bail!("agent {} failed to complete: {message}", self.agent_index)
                }
                // late action answers may still be queued
                other => trace!(agent = self.agent_index, kind = other.kind(), "skipping"),
            }
        }
    }

    /// Close the command side. The worker sees end of input and should exit.
    pub(crate) fn close_writer(&mut self) {
        self.writer = None;
    }

    /// Drop whatever is still queued and wait (briefly) for the reader thread.
    pub(crate) fn drain(&mut self, max_duration: Duration) {
        let deadline = Instant::now() + max_duration;
        self.discard_queued();
        if let Some(reader) = self.reader.take() {
            while !reader.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
                self.discard_queued();
            }
            if reader.is_finished() {
                if reader.join().is_err() {
                    warn!(agent = self.agent_index, "reader thread panicked");
                }
            } else {
                // detached: it ends once the stream is closed
                debug!(agent = self.agent_index, "reader thread still blocked, detaching");
            }
        }
        self.dead = true;
    }

    fn discard_queued(&mut self) {
        while let Ok(incoming) = self.responses.try_recv() {
            if let Incoming::Message(response) = incoming {
                trace!(agent = self.agent_index, kind = response.kind(), "drained");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::isolation::protocol::MAX_MESSAGE_LEN;

    fn channel(output: Vec<u8>) -> AgentChannel {
        AgentChannel::new(0, Cursor::new(output), std::io::sink()).unwrap()
    }

    #[test]
    fn endless_line_kills_the_channel() {
        let mut flood = vec![b'{'; MAX_MESSAGE_LEN as usize + 1];
        write_message(&mut flood, &Response::Ready).unwrap();
        let mut channel = channel(flood);

        let error = channel.recv(Instant::now() + Duration::from_secs(5)).unwrap_err();
        assert!(format!("{error:#}").contains("broke the protocol"), "{error:#}");
        assert!(channel.is_dead());
    }

    #[test]
    fn late_answers_are_skipped() {
        let mut output = Vec::new();
        for request_id in [0, 1] {
            let record = ActionRecord::answered(0, AgentAction::new(crate::action::STOP), Duration::ZERO);
            write_message(&mut output, &Response::ActionResponse { request_id, record }).unwrap();
        }
        let mut channel = channel(output);
        channel.next_request_id = 1;
        channel.pending = Some(0);

        let record = channel
            .request_action(&(), &[], Duration::from_secs(5))
            .unwrap();
        assert_eq!(record.agent_index(), 0);
        assert_eq!(channel.pending, None);
    }

    #[test]
    fn drain_consumes_everything_left() {
        let mut output = Vec::new();
        for _ in 0..50 {
            write_message(&mut output, &Response::Completed).unwrap();
        }
        let mut channel = channel(output);
        channel.close_writer();
        channel.drain(Duration::from_secs(5));

        assert!(channel.is_dead());
        assert!(channel.reader.is_none());
        assert!(channel.responses.try_recv().is_err());
    }
}
