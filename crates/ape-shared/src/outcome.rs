//! The trailing result record of a batch

use crate::arena::StringArena;
use crate::error::{Error, Result};
use crate::layout::{MessageRecord, ParameterSlot};
use crate::message::Action;
use crate::value::{TypeTag, Value};

const SUCCESS: i32 = 1;
const FAILURE: i32 = 2;

/// Whether the agent ran the whole batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every command ran
    Success,
    /// A command failed; nothing after it ran
    Failure {
        /// Error type name
        type_name: String,
        /// Error message
        message: String,
        /// Stack or cause chain
        stack: String,
    },
}

impl BatchOutcome {
    /// Write the outcome into `record`. Failure texts are cut to whatever
    /// still fits in the arena instead of failing.
    pub fn encode(
        &self,
        record: &mut MessageRecord,
        arena: &mut StringArena<'_>,
        cursor: &mut usize,
    ) -> Result<()> {
        record.clear();
        record.action = Action::Result as u32;

        match self {
            BatchOutcome::Success => {
                Value::Int32(SUCCESS).encode(&mut record.parameters[0], arena, cursor)?;
                record.parameter_count = 1;
            }
            BatchOutcome::Failure {
                type_name,
                message,
                stack,
            } => {
                Value::Int32(FAILURE).encode(&mut record.parameters[0], arena, cursor)?;
                for (slot, text) in record.parameters[1..4]
                    .iter_mut()
                    .zip([type_name, message, stack])
                {
                    let (offset, length) = arena.write_truncated(cursor, text);
                    *slot = ParameterSlot {
                        tag: TypeTag::String as u32,
                        string_length: length,
                        string_offset: offset,
                        ..Default::default()
                    };
                }
                record.parameter_count = 4;
            }
        }
        Ok(())
    }

    /// Read an outcome written by [`BatchOutcome::encode`]
    pub fn decode(record: &MessageRecord, arena: &StringArena<'_>) -> Result<Self> {
        if record.action != Action::Result as u32 {
            return Err(Error::MalformedMessage(format!(
                "expected a result record, found action {}",
                record.action
            )));
        }

        let text = |i: usize| -> Result<String> {
            Ok(Value::decode(&record.parameters[i], arena)?
                .as_str()
                .unwrap_or_default()
                .to_string())
        };

        match Value::decode(&record.parameters[0], arena)? {
            Value::Int32(SUCCESS) => Ok(BatchOutcome::Success),
            Value::Int32(FAILURE) => Ok(BatchOutcome::Failure {
                type_name: text(1)?,
                message: text(2)?,
                stack: text(3)?,
            }),
            other => Err(Error::MalformedMessage(format!(
                "unknown result flag {other:?}"
            ))),
        }
    }

    /// Turn a failure into [`Error::RemoteExecution`]
    pub fn into_result(self) -> Result<()> {
        match self {
            BatchOutcome::Success => Ok(()),
            BatchOutcome::Failure {
                type_name,
                message,
                stack,
            } => Err(Error::RemoteExecution {
                type_name,
                message,
                stack,
            }),
        }
    }
}
