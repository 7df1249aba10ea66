//! Agents connecting to the engine over TCP.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tracing::{debug, info, instrument, warn};

use super::channel::AgentChannel;
use super::protocol::Command;
use super::{active_agent, checked_record, child_seeds, spawn_worker, worker_answer, Isolator};
use crate::action::{Action, ActionRecord, AgentAction};
use crate::agent::{AgentIndex, AgentInfo};
use crate::cgroup_manager::{LimitedProcess, ShutdownBudgets};
use crate::configuration::Configuration;
use crate::constraints::Constraints;
use crate::game_state::GameState;
use crate::rng::GameRng;

#[derive(Debug)]
struct Peer {
    stream: TcpStream,
    channel: AgentChannel,
}

/// Opens a TCP listener for agents to connect on.
///
/// Agents can run anywhere: other processes, other machines, containers. They connect
/// to [`local_addr`](TcpIsolator::local_addr) and are assigned to agent indexes in
/// connection order, the engine sending `init` as the first message on each
/// connection. The protocol is the same as the process backend's.
///
/// With [`Configuration::with_spawn_tcp_workers`], the isolator launches one worker
/// per agent itself (`<worker command> --connect <address>`).
#[derive(Debug)]
pub struct TcpIsolator<S> {
    config: Configuration,
    constraints: Constraints,
    listener: Option<TcpListener>,
    peers: BTreeMap<AgentIndex, Peer>,
    spawned: Vec<LimitedProcess>,
    _state: PhantomData<fn() -> S>,
}

impl<S: GameState> TcpIsolator<S> {
    /// An isolator that binds its listener when agents are initialized.
    pub fn new(config: Configuration, constraints: Constraints) -> Self {
        Self {
            config,
            constraints,
            listener: None,
            peers: BTreeMap::new(),
            spawned: Vec::new(),
            _state: PhantomData,
        }
    }

    /// An isolator listening right away, so agents can be pointed at
    /// [`local_addr`](Self::local_addr) before [`init_agents`](Isolator::init_agents).
    pub fn bind(config: Configuration, constraints: Constraints) -> anyhow::Result<Self> {
        let mut isolator = Self::new(config, constraints);
        isolator.listen()?;
        Ok(isolator)
    }

    /// Address agents should connect to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref()?.local_addr().ok()
    }

    fn listen(&mut self) -> anyhow::Result<SocketAddr> {
        if self.listener.is_none() {
            let listener = TcpListener::bind(&self.config.tcp_address)
                .with_context(|| format!("could not listen on {}", self.config.tcp_address))?;
            listener
                .set_nonblocking(true)
                .context("server error: setting non-blocking to true")?;
            self.listener = Some(listener);
        }
        self.local_addr().context("listener has no local address")
    }

    /// Accept `count` connections before the connect deadline.
    fn accept(&self, count: usize) -> anyhow::Result<Vec<TcpStream>> {
        let listener = self
            .listener
            .as_ref()
            .context("not listening")?;
        let deadline = Instant::now() + self.constraints.connect_timeout;
        let mut streams = Vec::with_capacity(count);
        while streams.len() < count {
            match listener.accept() {
                Ok((stream, address)) => {
                    debug!(%address, "agent connected");
                    stream
                        .set_nonblocking(false)
                        .context("server error: setting blocking for agent stream")?;
                    stream.set_nodelay(true).ok();
                    streams.push(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(anyhow!(
                            "only {}/{count} agents connected in time",
                            streams.len()
                        ));
                    }
                    // at least 10 tries
                    thread::sleep(
                        Duration::from_millis(10).min(self.constraints.connect_timeout / 10),
                    );
                }
                Err(e) => return Err(e).context("could not accept agent connection"),
            }
        }
        Ok(streams)
    }

    fn connect_peer(
        &self,
        agent_index: AgentIndex,
        agent_info: &AgentInfo,
        stream: TcpStream,
    ) -> anyhow::Result<Peer> {
        let reader = stream.try_clone().context("could not clone agent stream")?;
        let writer = stream.try_clone().context("could not clone agent stream")?;
        let mut peer = Peer {
            channel: AgentChannel::new(agent_index, reader, writer)?,
            stream,
        };
        if let Err(e) = peer.channel.init(agent_info, self.constraints.start_timeout) {
            close_peer(agent_index, &mut peer);
            return Err(e);
        }
        Ok(peer)
    }
}

impl<S> TcpIsolator<S> {
    /// Disconnect every peer and stop spawned workers. The listener stays open.
    fn release_agents(&mut self) {
        for (agent_index, mut peer) in std::mem::take(&mut self.peers) {
            close_peer(agent_index, &mut peer);
        }
        let budgets = ShutdownBudgets::from_constraints(&self.constraints);
        for mut process in std::mem::take(&mut self.spawned) {
            process.shutdown(&budgets);
        }
    }
}

fn close_peer(agent_index: AgentIndex, peer: &mut Peer) {
    peer.channel.close_writer();
    if let Err(e) = peer.stream.shutdown(Shutdown::Both) {
        debug!(agent = agent_index, "connection already closed: {e}");
    }
    peer.channel.drain(Duration::from_millis(100));
}

impl<S: GameState> Isolator<S> for TcpIsolator<S> {
    #[instrument(skip_all)]
    fn init_agents(&mut self, agent_infos: &BTreeMap<AgentIndex, AgentInfo>) -> anyhow::Result<()> {
        self.release_agents();
        let address = self.listen()?;
        info!(%address, agents = agent_infos.len(), "waiting for agents to connect");

        if self.config.spawn_tcp_workers {
            let args = ["--connect".to_string(), address.to_string()];
            for _ in agent_infos {
                let process = spawn_worker(&self.config, &self.constraints, &args)?;
                self.spawned.push(process);
            }
        }

        let streams = self.accept(agent_infos.len())?;
        for ((agent_index, agent_info), stream) in agent_infos.iter().zip(streams) {
            let peer = self
                .connect_peer(*agent_index, agent_info, stream)
                .with_context(|| format!("could not set up agent {agent_index} ('{}')", agent_info.name))?;
            self.peers.insert(*agent_index, peer);
        }
        Ok(())
    }

    #[instrument(skip_all)]
    fn game_start(
        &mut self,
        rng: &mut GameRng,
        initial_state: &S,
    ) -> anyhow::Result<BTreeMap<AgentIndex, AgentAction>> {
        let seeds = child_seeds(rng, self.peers.keys().copied().collect::<Vec<_>>());

        for (agent_index, peer) in &mut self.peers {
            let command = Command::Start {
                agent_index: *agent_index,
                seed: seeds[agent_index],
                initial_state,
            };
            if let Err(e) = peer.channel.send(&command) {
                warn!(agent = agent_index, "could not start agent: {e:#}");
            }
        }

        let deadline = Instant::now() + self.constraints.start_timeout;
        let mut responses = BTreeMap::new();
        for (agent_index, peer) in &mut self.peers {
            if peer.channel.is_dead() {
                continue;
            }
            match peer.channel.await_started(deadline) {
                Ok(Some(info)) => {
                    responses.insert(*agent_index, info);
                }
                Ok(None) => {}
                Err(e) => warn!(agent = agent_index, "agent failed to start: {e:#}"),
            }
        }
        Ok(responses)
    }

    fn get_action(&mut self, state: &S, user_inputs: &[Action]) -> anyhow::Result<ActionRecord> {
        let agent_index = active_agent(state)?;
        let peer = self
            .peers
            .get_mut(&agent_index)
            .with_context(|| format!("no agent with index {agent_index}"))?;

        let start = Instant::now();
        let result = peer
            .channel
            .request_action(state, user_inputs, self.constraints.action_timeout);
        let duration = start.elapsed();

        let answer = worker_answer(agent_index, result);
        Ok(checked_record(state, agent_index, answer, duration))
    }

    fn game_complete(&mut self, final_state: &S) {
        for (agent_index, peer) in &mut self.peers {
            if peer.channel.is_dead() {
                continue;
            }
            if let Err(e) = peer
                .channel
                .complete(final_state, self.constraints.complete_timeout)
            {
                warn!(agent = agent_index, "agent failed to complete: {e:#}");
            }
        }
    }

    fn close(&mut self) {
        self.release_agents();
        if self.listener.take().is_some() {
            debug!("listener closed");
        }
    }
}

impl<S> Drop for TcpIsolator<S> {
    fn drop(&mut self) {
        for (agent_index, mut peer) in std::mem::take(&mut self.peers) {
            close_peer(agent_index, &mut peer);
        }
        // spawned workers are shut down by their own drop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{EAST, STOP};
    use crate::agent::AgentRegistry;
    use crate::engine::Engine;
    use crate::game_info::GameInfo;
    use crate::isolation::worker::connect_worker;
    use crate::race::RaceState;
    use crate::ui::NullUi;

    fn spawn_thread_agent(address: SocketAddr) -> thread::JoinHandle<anyhow::Result<()>> {
        thread::spawn(move || {
            let registry = AgentRegistry::<RaceState>::with_builtin();
            connect_worker(&registry, address)
        })
    }

    fn constraints() -> Constraints {
        Constraints::builder()
            .with_action_timeout(Duration::from_millis(500))
            .with_connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[test]
    fn thread_agents_play_over_loopback() {
        let mut isolator = TcpIsolator::<RaceState>::bind(Configuration::new(), constraints()).unwrap();
        let address = isolator.local_addr().unwrap();
        let workers: Vec<_> = (0..2).map(|_| spawn_thread_agent(address)).collect();

        let roster = BTreeMap::from([
            (0, AgentInfo::new("scripted").with_arg("actions", serde_json::json!(["east"]))),
            (1, AgentInfo::new("dummy")),
        ]);
        isolator.init_agents(&roster).unwrap();

        let mut state = RaceState::open_field(3, 3, &roster);
        state.game_start().unwrap();
        let mut rng = GameRng::new(4);
        isolator.game_start(&mut rng, &state).unwrap();

        let record = isolator.get_action(&state, &[]).unwrap();
        assert_eq!(record.action(), &EAST);
        assert!(!record.crashed());

        isolator.game_complete(&state);
        isolator.close();
        isolator.close();

        for worker in workers {
            worker.join().unwrap().unwrap();
        }
    }

    #[test]
    fn hung_peer_times_out() {
        let mut isolator = TcpIsolator::<RaceState>::bind(Configuration::new(), constraints()).unwrap();
        let address = isolator.local_addr().unwrap();
        let worker = spawn_thread_agent(address);

        let roster = BTreeMap::from([(0, AgentInfo::new("faulty").with_arg("mode", "hang"))]);
        isolator.init_agents(&roster).unwrap();

        let mut state = RaceState::open_field(2, 2, &roster);
        state.game_start().unwrap();

        let start = Instant::now();
        let record = isolator.get_action(&state, &[]).unwrap();
        assert!(record.crashed());
        assert_eq!(record.action(), &STOP);
        assert!(start.elapsed() < Duration::from_secs(3));

        isolator.close();
        // the hanging thread never returns; it is left behind with the test process
        drop(worker);
    }

    #[test]
    fn missing_agents_fail_setup() {
        let constraints = Constraints::builder()
            .with_connect_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let mut isolator = TcpIsolator::<RaceState>::new(Configuration::new(), constraints);
        let roster = BTreeMap::from([(0, AgentInfo::new("dummy"))]);
        let error = isolator.init_agents(&roster).unwrap_err();
        assert!(format!("{error:#}").contains("0/1"), "{error:#}");
    }

    #[test]
    fn unknown_agent_is_reported_by_the_peer() {
        let mut isolator = TcpIsolator::<RaceState>::bind(Configuration::new(), constraints()).unwrap();
        let address = isolator.local_addr().unwrap();
        let worker = spawn_thread_agent(address);

        let roster = BTreeMap::from([(0, AgentInfo::new("ghost"))]);
        assert!(isolator.init_agents(&roster).is_err());
        isolator.close();
        let _ = worker.join().unwrap();
    }

    #[test]
    fn close_releases_the_port() {
        let mut isolator = TcpIsolator::<RaceState>::bind(Configuration::new(), constraints()).unwrap();
        let address = isolator.local_addr().unwrap();
        isolator.close();
        assert!(isolator.local_addr().is_none());
        TcpListener::bind(address).unwrap();
    }

    #[test]
    fn setup_errors_release_the_port() {
        let mut isolator = TcpIsolator::<RaceState>::bind(Configuration::new(), constraints()).unwrap();
        let address = isolator.local_addr().unwrap();

        let game_info = GameInfo::new(1, BTreeMap::from([(0, AgentInfo::new("dummy"))]));
        let mismatched = RaceState::open_field(2, 2, &BTreeMap::from([(5, AgentInfo::new("dummy"))]));
        let engine = Engine::new(AgentRegistry::with_builtin(), Configuration::new(), constraints());
        assert!(engine
            .run_with_isolator(&game_info, mismatched, &mut isolator, &mut NullUi)
            .is_err());

        assert!(isolator.local_addr().is_none());
        TcpListener::bind(address).unwrap();
    }
}
