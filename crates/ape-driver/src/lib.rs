//! APE driver: the controller side of remote UI control
//!
//! A test process builds batches of commands with a [`Controller`], sends
//! them to the agent running inside the application under test, and reads
//! back the values the batch returned.
//!
//! ```ignore
//! let slot = |i| ObjectSlot::new(i).unwrap();
//! let mut controller = Controller::connect(agent_pid, None)?;
//! controller.locate(slot(0), &ControlIdentifier::named("MainForm"))?;
//! controller.get_property(slot(0), slot(1), "Text")?;
//! controller.fetch_result(slot(1))?;
//! controller.send_batch()?;
//! let found = controller.take_identifier()?;
//! let text = controller.take_value()?;
//! ```

#![deny(missing_docs)]

pub mod batch;
pub mod controller;

pub use batch::{BatchBuilder, Command};
pub use controller::{Controller, ControllerConfig};
