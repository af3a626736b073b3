//! Controller session
//!
//! Owns the channel for one agent. Commands are queued into the shared
//! message store as they are added; [`Controller::send_batch`] hands the turn
//! to the agent, waits for the answer and moves every returned value into a
//! FIFO read with [`Controller::take_value`].

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use ape_shared::{
    BatchOutcome, Bootstrap, Channel, ChannelId, ControlIdentifier, DEFAULT_DOMAIN, Error, Handle,
    Handshake, HandshakeConfig, HandshakeState, MAX_PARAMETERS, MESSAGE_RECORDS, MemberKind,
    MessageStore, MouseButton, ObjectSlot, PeerLiveness, ProcessWatch, Result, Role, StringArena,
    Value,
};
use tracing::{debug, trace, warn};

use crate::batch::{BatchBuilder, Command};

/// Controller tunables
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Handshake wait slices
    pub handshake: HandshakeConfig,
    /// Directory published to the agent; the current directory when unset
    pub working_directory: Option<PathBuf>,
}

/// One controller ↔ agent session
pub struct Controller<L: PeerLiveness = ProcessWatch> {
    channel: Channel,
    handshake: Handshake<L>,
    batch: BatchBuilder,
    results: VecDeque<Vec<Value>>,
}

impl Controller<ProcessWatch> {
    /// Create the channel for the agent in process `agent_pid`
    pub fn connect(agent_pid: u32, domain: Option<&str>) -> Result<Self> {
        let id = ChannelId::new(
            std::process::id(),
            agent_pid,
            domain.unwrap_or(DEFAULT_DOMAIN),
        );
        Self::connect_with(id, ProcessWatch::new(agent_pid), ControllerConfig::default())
    }
}

impl<L: PeerLiveness> Controller<L> {
    /// Create the channel `id` and publish the bootstrap block; `agent`
    /// reports whether the agent's process is still running
    pub fn connect_with(id: ChannelId, agent: L, config: ControllerConfig) -> Result<Self> {
        let mut channel = Channel::open(id, true)?;
        let working_directory = match config.working_directory {
            Some(dir) => dir,
            None => std::env::current_dir().unwrap_or_default(),
        };
        let bootstrap = Bootstrap {
            working_directory: working_directory.display().to_string(),
            domain: channel.id().domain.clone(),
        };
        channel.write_bootstrap(&bootstrap)?;
        debug!(channel = %channel.id(), "controller connected");

        Ok(Self {
            channel,
            handshake: Handshake::new(Role::Controller, agent, config.handshake),
            batch: BatchBuilder::new(),
            results: VecDeque::new(),
        })
    }

    /// Channel identity
    pub fn channel_id(&self) -> &ChannelId {
        self.channel.id()
    }

    /// Commands queued for the next [`Controller::send_batch`]
    pub fn queued(&self) -> usize {
        if self.batch.is_open() { self.batch.len() } else { 0 }
    }

    /// Queue a prepared command
    pub fn push(&mut self, command: Command) -> Result<()> {
        let (mut store, mut arena) = self.channel.parts()?;
        self.batch.append(&command, &mut store, &mut arena)
    }

    /// Find a control; its identifier is returned after the batch runs
    pub fn locate(&mut self, dest: ObjectSlot, ident: &ControlIdentifier) -> Result<()> {
        self.push(Command::locate(dest, ident))
    }

    /// Resolve a known window handle into `dest`
    pub fn relocate(&mut self, dest: ObjectSlot, parent: Handle, handle: Handle) -> Result<()> {
        self.push(Command::relocate(dest, parent, handle))
    }

    /// Access or invoke member `name` of the object in `source`
    pub fn query_member(
        &mut self,
        source: ObjectSlot,
        dest: ObjectSlot,
        kind: MemberKind,
        name: &str,
        params: &[Value],
    ) -> Result<()> {
        self.push(Command::query_member(source, dest, kind, name, params)?)
    }

    /// Read property `name` of the object in `source`
    pub fn get_property(&mut self, source: ObjectSlot, dest: ObjectSlot, name: &str) -> Result<()> {
        self.query_member(source, dest, MemberKind::Property, name, &[])
    }

    /// Call method `name` on the object in `source`
    pub fn call_method(
        &mut self,
        source: ObjectSlot,
        dest: ObjectSlot,
        name: &str,
        params: &[Value],
    ) -> Result<()> {
        self.query_member(source, dest, MemberKind::Method, name, params)
    }

    /// Construct a `type_name` in the agent
    pub fn construct(&mut self, dest: ObjectSlot, type_name: &str, params: &[Value]) -> Result<()> {
        self.query_member(dest, dest, MemberKind::Constructor, type_name, params)
    }

    /// Wait in the agent until member `name` reads `target`
    pub fn poll_member(
        &mut self,
        source: ObjectSlot,
        kind: MemberKind,
        name: &str,
        target: impl Into<Value>,
    ) -> Result<()> {
        self.push(Command::poll_member(source, kind, name, target.into()))
    }

    /// Return the value in `source` after the batch runs
    pub fn fetch_result(&mut self, source: ObjectSlot) -> Result<()> {
        self.push(Command::fetch_result(source))
    }

    /// Start recording mouse transitions for `window`
    pub fn add_input_hook(&mut self, window: Handle) -> Result<()> {
        self.push(Command::add_input_hook(window))
    }

    /// Stop recording mouse transitions
    pub fn remove_input_hook(&mut self, window: Handle) -> Result<()> {
        self.push(Command::remove_input_hook(window))
    }

    /// Wait in the agent for a button transition
    pub fn wait_for_input_state(
        &mut self,
        button: MouseButton,
        mouse_down: bool,
        first_click: bool,
    ) -> Result<()> {
        self.push(Command::wait_for_input_state(button, mouse_down, first_click))
    }

    /// Collect garbage in the agent process
    pub fn garbage_collect(&mut self, generation: i32) -> Result<()> {
        self.push(Command::garbage_collect(generation))
    }

    /// Change the agent's wait timeout
    pub fn set_timeouts(&mut self, timeout: Duration) -> Result<()> {
        self.push(Command::set_timeouts(timeout))
    }

    /// List the agent's logical domains
    pub fn get_app_domains(&mut self) -> Result<()> {
        self.push(Command::get_app_domains())
    }

    /// File name of the module that created `window`, returned as a string
    pub fn get_module_filename(&mut self, window: Handle) -> Result<()> {
        self.push(Command::get_module_filename(window))
    }

    /// Run the queued batch in the agent.
    ///
    /// Values returned by `Locate`, `FetchResult`, `GetAppDomains` and
    /// `GetModuleFilename` are available through the `take_*` methods until
    /// the next batch is sent.
    /// A failure of any command surfaces as [`Error::RemoteExecution`] and
    /// yields no values.
    pub fn send_batch(&mut self) -> Result<()> {
        let count = self.batch.finish()?;
        self.results.clear();
        debug!(count, "sending batch");

        self.handshake.send(&self.channel)?;
        self.handshake.wait(&self.channel)?;

        let (mut store, arena) = self.channel.parts()?;
        let outcome = read_response(&store, &arena, &mut self.results);
        store.clear_all();
        store.reset();

        let outcome = outcome?;
        if !matches!(outcome, BatchOutcome::Success) {
            self.results.clear();
        }
        trace!(results = self.results.len(), "batch answered");
        outcome.into_result()
    }

    /// Next value list returned by the last batch
    pub fn take_values(&mut self) -> Result<Vec<Value>> {
        self.results
            .pop_front()
            .ok_or(Error::ProtocolSequence("no results left from the last batch"))
    }

    /// Next single value returned by the last batch
    pub fn take_value(&mut self) -> Result<Value> {
        let mut values = self.take_values()?;
        match values.len() {
            1 => Ok(values.pop().unwrap_or(Value::Empty)),
            n => Err(Error::MalformedMessage(format!(
                "expected a single value, found {n}"
            ))),
        }
    }

    /// Next control identifier returned by a `Locate`
    pub fn take_identifier(&mut self) -> Result<ControlIdentifier> {
        ControlIdentifier::from_values(&self.take_values()?)
    }

    /// Results of the last batch not yet taken
    pub fn pending_results(&self) -> usize {
        self.results.len()
    }

    /// Stop the agent and close the channel
    pub fn teardown(mut self) -> Result<()> {
        self.shutdown()
    }

    fn send_teardown(&mut self) -> Result<()> {
        // Unsent commands are discarded
        self.batch = BatchBuilder::new();
        self.push(Command::teardown())?;
        self.batch.finish()?;
        self.handshake.notify(&self.channel)
    }

    fn shutdown(&mut self) -> Result<()> {
        if !self.channel.is_open() {
            return Ok(());
        }
        let result = if self.handshake.state() == HandshakeState::Aborted {
            Ok(())
        } else {
            self.send_teardown()
        };
        self.channel.close();
        result
    }
}

impl<L: PeerLiveness> Drop for Controller<L> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "teardown failed");
        }
    }
}

/// Copy every output record into `results` and decode the trailing outcome
fn read_response(
    store: &MessageStore<'_>,
    arena: &StringArena<'_>,
    results: &mut VecDeque<Vec<Value>>,
) -> Result<BatchOutcome> {
    let count = store.count();
    if count == 0 || count > MESSAGE_RECORDS {
        return Err(Error::MalformedMessage(format!(
            "agent answered with {count} records"
        )));
    }

    for index in 0..count - 1 {
        let record = store.record(index)?;
        let n = (record.parameter_count as usize).min(MAX_PARAMETERS);
        let values = record.parameters[..n]
            .iter()
            .map(|slot| Value::decode(slot, arena))
            .collect::<Result<Vec<_>>>()?;
        results.push_back(values);
    }
    BatchOutcome::decode(store.record(count - 1)?, arena)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::unique_id;
    use ape_shared::{Action, AlwaysAlive, ManualLiveness};
    use std::time::Instant;

    fn fast() -> ControllerConfig {
        ControllerConfig {
            handshake: HandshakeConfig {
                controller_slice: Duration::from_millis(20),
                agent_slice: Duration::from_millis(20),
            },
            working_directory: Some(PathBuf::from("/work")),
        }
    }

    #[test]
    fn test_connect_publishes_bootstrap() {
        let id = unique_id();
        let _controller = Controller::connect_with(id.clone(), AlwaysAlive(1), fast()).unwrap();

        let mut agent_side = Channel::open(id.clone(), false).unwrap();
        let bootstrap = agent_side.take_bootstrap().unwrap().unwrap();
        assert_eq!(bootstrap.working_directory, "/work");
        assert_eq!(bootstrap.domain, id.domain);
    }

    #[test]
    fn test_send_without_commands() {
        let mut controller = Controller::connect_with(unique_id(), AlwaysAlive(1), fast()).unwrap();
        assert!(matches!(
            controller.send_batch(),
            Err(Error::ProtocolSequence(_))
        ));
        assert!(controller.take_value().is_err());
    }

    #[test]
    fn test_peer_exit_aborts_send() {
        let liveness = ManualLiveness::new(31337);
        let killer = liveness.clone();
        let mut controller = Controller::connect_with(unique_id(), liveness, fast()).unwrap();
        controller.get_app_domains().unwrap();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(40));
            killer.kill();
        });

        let started = Instant::now();
        let err = controller.send_batch().unwrap_err();
        assert!(matches!(err, Error::PeerExited { pid: 31337 }));
        assert!(started.elapsed() < Duration::from_millis(500));

        // Teardown after an abort only closes the channel
        assert!(controller.teardown().is_ok());
    }

    #[test]
    fn test_drop_queues_teardown() {
        let id = unique_id();
        let mut agent_side = Channel::open(id.clone(), true).unwrap();
        let mut controller = Controller::connect_with(id, AlwaysAlive(1), fast()).unwrap();
        controller.get_app_domains().unwrap();
        drop(controller);

        let store = agent_side.store().unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.record(0).unwrap().action, Action::Teardown as u32);
        assert!(agent_side.signal().unwrap().wait(Duration::from_millis(100)).unwrap());
    }
}
