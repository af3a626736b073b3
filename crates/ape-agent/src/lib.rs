//! APE agent: executes controller batches inside the target application
//!
//! The hosting code describes its UI through [`UiHost`], its object model
//! through a [`TypeRegistry`], and which thread owns UI objects through a
//! [`Dispatcher`]. [`Agent::run`] then serves batches until the controller
//! tears the channel down or exits.
//!
//! ```ignore
//! let agent = Agent::connect(controller_pid, "DefaultDomain", host, registry)?
//!     .with_dispatcher(Arc::new(UiThread::spawn("ui")?));
//! let serving = ape_agent::spawn(agent)?;
//! ```

#![deny(missing_docs)]

pub mod cache;
pub mod dispatch;
pub mod error;
pub mod input;
pub mod locate;
pub mod object;
pub mod registry;
pub mod slots;
pub mod ui;

use std::thread::JoinHandle;
use std::time::Duration;

use ape_shared::{HandshakeConfig, PeerLiveness};

pub use cache::{BoundedCache, InvocationCache};
pub use dispatch::Agent;
pub use error::HandlerError;
pub use input::{InputMonitor, MouseTransition};
pub use locate::{Found, Locator};
pub use object::{Item, Object};
pub use registry::{TypeRegistry, object_at, value_at};
pub use slots::ObjectTable;
pub use ui::{Dispatcher, Inline, Job, UiElement, UiHost, UiThread, invoke};

/// Agent tunables
#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    /// Upper bound for locate, poll and input waits; changed by `SetTimeouts`
    pub timeout: Duration,
    /// Pause between locate passes
    pub locate_interval: Duration,
    /// Pause between member polls
    pub poll_interval: Duration,
    /// Sleep after a garbage collection
    pub gc_settle: Duration,
    /// Handshake wait slices
    pub handshake: HandshakeConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            locate_interval: Duration::from_millis(15),
            poll_interval: Duration::from_millis(50),
            gc_settle: Duration::from_millis(150),
            handshake: HandshakeConfig::default(),
        }
    }
}

/// Serve `agent` on a background thread named `ape-agent`
pub fn spawn<L: PeerLiveness + 'static>(
    agent: Agent<L>,
) -> std::io::Result<JoinHandle<ape_shared::Result<()>>> {
    std::thread::Builder::new()
        .name("ape-agent".to_string())
        .spawn(move || agent.run())
}
