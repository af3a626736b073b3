//! Control identifiers: search criteria on the way in, identity on the way out
//!
//! An identifier always travels as exactly [`MAX_PARAMETERS`] values in a
//! fixed order, so a locate request and its response share one record.

use crate::MAX_PARAMETERS;
use crate::error::{Error, Result};
use crate::value::{Handle, Value};

/// UI technology stack a control belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Technology {
    /// Classic window-handle based forms
    WinForms,
    /// Retained-mode presentation framework
    Wpf,
}

impl Technology {
    /// Name used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Technology::WinForms => "Windows Forms (WinForms)",
            Technology::Wpf => "Windows Presentation Foundation (WPF)",
        }
    }

    /// Parse the wire name
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "Windows Forms (WinForms)" => Ok(Technology::WinForms),
            "Windows Presentation Foundation (WPF)" => Ok(Technology::Wpf),
            other => Err(Error::UnsupportedOperand(format!("technology {other:?}"))),
        }
    }
}

impl std::fmt::Display for Technology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Criteria for finding a control, filled in with its identity once found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlIdentifier {
    /// Window to search under; null searches top-level windows
    pub parent_handle: Handle,
    /// Exact handle; when set the agent resolves it directly
    pub handle: Handle,
    /// Control name
    pub name: Option<String>,
    /// UI technology
    pub technology: Option<Technology>,
    /// Namespace of the control's type
    pub type_namespace: Option<String>,
    /// Name of the control's type
    pub type_name: Option<String>,
    /// Module declaring the type
    pub module_name: Option<String>,
    /// Assembly declaring the type
    pub assembly_name: Option<String>,
    /// 1-based position among matching controls, 0 for "first"
    pub index: u32,
    /// Regular expression the display text must match
    pub text: Option<String>,
    /// Handle the control must be a descendant of
    pub child_of: Handle,
    /// Handle the control must share a parent with
    pub sibling_of: Handle,
}

impl ControlIdentifier {
    /// Identifier matching a control name
    pub fn named(name: impl Into<String>) -> Self {
        ControlIdentifier {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Identifier resolving an existing handle
    pub fn from_handle(handle: Handle) -> Self {
        ControlIdentifier {
            handle,
            ..Default::default()
        }
    }

    /// Restrict the search to children of `parent`
    pub fn under(mut self, parent: Handle) -> Self {
        self.parent_handle = parent;
        self
    }

    /// Require the display text to match `pattern`
    pub fn with_text(mut self, pattern: impl Into<String>) -> Self {
        self.text = Some(pattern.into());
        self
    }

    /// Pick the `index`th match (1-based)
    pub fn nth(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    /// Require a UI technology
    pub fn with_technology(mut self, technology: Technology) -> Self {
        self.technology = Some(technology);
        self
    }

    /// Require a type name
    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    /// Wire form, always [`MAX_PARAMETERS`] values
    pub fn to_values(&self) -> [Value; MAX_PARAMETERS] {
        [
            Value::Handle(self.parent_handle),
            Value::Handle(self.handle),
            Value::String(self.name.clone()),
            Value::String(self.technology.map(|t| t.as_str().to_string())),
            Value::String(self.type_namespace.clone()),
            Value::String(self.type_name.clone()),
            Value::String(self.module_name.clone()),
            Value::String(self.assembly_name.clone()),
            Value::UInt32(self.index),
            Value::String(self.text.clone()),
            Value::Handle(self.child_of),
            Value::Handle(self.sibling_of),
        ]
    }

    /// Rebuild from the wire form
    pub fn from_values(values: &[Value]) -> Result<Self> {
        let [
            parent_handle,
            handle,
            name,
            technology,
            type_namespace,
            type_name,
            module_name,
            assembly_name,
            index,
            text,
            child_of,
            sibling_of,
        ] = values
        else {
            return Err(Error::MalformedMessage(format!(
                "control identifier needs {MAX_PARAMETERS} values, got {}",
                values.len()
            )));
        };

        Ok(ControlIdentifier {
            parent_handle: handle_at(parent_handle, "parent handle")?,
            handle: handle_at(handle, "handle")?,
            name: string_at(name, "name")?,
            technology: string_at(technology, "technology")?
                .map(|t| Technology::parse(&t))
                .transpose()?,
            type_namespace: string_at(type_namespace, "type namespace")?,
            type_name: string_at(type_name, "type name")?,
            module_name: string_at(module_name, "module name")?,
            assembly_name: string_at(assembly_name, "assembly name")?,
            index: match index {
                Value::UInt32(i) => *i,
                other => return Err(mismatch("index", other)),
            },
            text: string_at(text, "text")?,
            child_of: handle_at(child_of, "child-of handle")?,
            sibling_of: handle_at(sibling_of, "sibling-of handle")?,
        })
    }
}

fn mismatch(field: &str, got: &Value) -> Error {
    Error::MalformedMessage(format!("identifier {field}: unexpected {:?}", got.tag()))
}

fn handle_at(value: &Value, field: &str) -> Result<Handle> {
    value.as_handle().ok_or_else(|| mismatch(field, value))
}

fn string_at(value: &Value, field: &str) -> Result<Option<String>> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(mismatch(field, other)),
    }
}
