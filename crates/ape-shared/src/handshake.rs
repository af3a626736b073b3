//! Turn-taking between controller and agent
//!
//! One auto-reset event carries the wakeups; the header's `last_waker` word
//! records which side most recently woke up. A sender sets the event and then
//! yields (at lowered priority) until the peer has claimed its turn, so it can
//! never race back into a wait before the peer is scheduled.
//!
//! ```text
//!  Controller                         Agent
//!  ──────────                         ─────
//!  write batch                        wait()  ── slices, liveness checks
//!  send() ─── set event ───────────▶  wake, last_waker = Agent
//!    spin until last_waker != Ctl     dispatch batch
//!  wait()                             send() ─── set event ──┐
//!  wake, last_waker = Controller ◀────────────────────────────┘
//!  read results                         spin until last_waker != Agent
//! ```

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::os::{PeerLiveness, PriorityNudge};

/// Which side of the channel this is
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The driver issuing batches
    Controller = 0,
    /// The component executing batches inside the target
    Agent = 1,
}

/// Where this side is in the round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent yet
    Idle,
    /// Event set, peer not yet awake
    Signaled,
    /// Peer has the turn
    Processing,
    /// Woken by the peer; this side has the turn
    Responded,
    /// Peer exited; the channel is dead
    Aborted,
}

/// Wait-slice lengths; liveness is checked once per slice
#[derive(Debug, Clone, Copy)]
pub struct HandshakeConfig {
    /// Slice used by the controller
    pub controller_slice: Duration,
    /// Slice used by the agent
    pub agent_slice: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            controller_slice: Duration::from_millis(100),
            agent_slice: Duration::from_secs(30),
        }
    }
}

/// One side's view of the handshake
pub struct Handshake<L: PeerLiveness> {
    role: Role,
    config: HandshakeConfig,
    peer: L,
    state: HandshakeState,
}

impl<L: PeerLiveness> Handshake<L> {
    /// Start in [`HandshakeState::Idle`]
    pub fn new(role: Role, peer: L, config: HandshakeConfig) -> Self {
        Self {
            role,
            config,
            peer,
            state: HandshakeState::Idle,
        }
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// This side's role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Process id of the peer
    pub fn peer_pid(&self) -> u32 {
        self.peer.pid()
    }

    fn slice(&self) -> Duration {
        match self.role {
            Role::Controller => self.config.controller_slice,
            Role::Agent => self.config.agent_slice,
        }
    }

    fn aborted(&self) -> Error {
        Error::PeerExited {
            pid: self.peer.pid(),
        }
    }

    /// Ask the peer's liveness check. Check errors count as alive; only a
    /// positive "exited" answer returns `false`.
    pub fn peer_alive(&mut self) -> bool {
        match self.peer.is_alive() {
            Ok(alive) => alive,
            Err(e) => {
                warn!(pid = self.peer.pid(), error = %e, "liveness check failed, assuming alive");
                true
            }
        }
    }

    fn abort(&mut self) -> Error {
        warn!(role = ?self.role, pid = self.peer.pid(), "peer exited");
        self.state = HandshakeState::Aborted;
        self.aborted()
    }

    /// Hand the turn to the peer and wait until it has picked it up
    pub fn send(&mut self, channel: &Channel) -> Result<()> {
        if self.state == HandshakeState::Aborted {
            return Err(self.aborted());
        }
        let header = channel.header()?;
        channel.signal()?.set()?;
        self.state = HandshakeState::Signaled;
        trace!(role = ?self.role, "signaled peer");

        let _nudge = PriorityNudge::lower();
        let slice = self.slice();
        let mut checked = Instant::now();
        while header.last_waker.load(Ordering::Acquire) == self.role as u32 {
            std::thread::yield_now();
            if checked.elapsed() >= slice {
                checked = Instant::now();
                if !self.peer_alive() {
                    return Err(self.abort());
                }
            }
        }

        self.state = HandshakeState::Processing;
        Ok(())
    }

    /// Signal the peer without waiting for it to wake (used for teardown)
    pub fn notify(&mut self, channel: &Channel) -> Result<()> {
        if self.state == HandshakeState::Aborted {
            return Err(self.aborted());
        }
        channel.signal()?.set()?;
        self.state = HandshakeState::Signaled;
        Ok(())
    }

    /// Block until the peer hands the turn back
    pub fn wait(&mut self, channel: &Channel) -> Result<()> {
        if self.state == HandshakeState::Aborted {
            return Err(self.aborted());
        }
        let header = channel.header()?;
        let signal = channel.signal()?;
        let slice = self.slice();

        loop {
            if signal.wait(slice)? {
                header.last_waker.store(self.role as u32, Ordering::Release);
                self.state = HandshakeState::Responded;
                trace!(role = ?self.role, "woken by peer");
                return Ok(());
            }
            if !self.peer_alive() {
                return Err(self.abort());
            }
        }
    }
}
