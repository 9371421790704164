//! Configuration model.
//!
//! The boot configuration is a list of commands operating on an environment. This
//! module defines the value sum type, the command list produced by the
//! [`parser`](crate::config::parser) and the [`Environment`] tree the
//! [`executor`](crate::config::exec) mutates.

pub mod exec;
pub mod parser;

use core::fmt::{self, Display};

use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::device::Device;
use crate::errors::ConfigError;
use crate::fs::FsHandle;
use crate::loader::LoaderBinding;

/// Entry names maintained by the loader itself; `set`/`unset` reject them.
pub const RESERVED_NAMES: [&str; 3] = ["device", "device_label", "device_uuid"];

/// A configuration value.
///
/// Equality is defined on the primitive variants only: two lists or command lists never
/// compare equal. Deep copy is `Clone`; destructive move is the language's move.
#[derive(Clone, Debug)]
pub enum Value {
    Integer(u64),
    Boolean(bool),
    String(String),
    /// A variable reference (`$name`), substituted at execution time.
    Reference(String),
    List(ValueList),
    Commands(CommandList),
}

pub type ValueList = Vec<Value>;

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Human-readable variant name, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Boolean(_) => "boolean",
            Value::String(_) => "string",
            Value::Reference(_) => "reference",
            Value::List(_) => "list",
            Value::Commands(_) => "command list",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<u64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl Display for Value {
    /// Writes the value in configuration syntax, so that parsing the output yields the
    /// same structure back.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{i}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::String(s) => {
                // A raw `$` stays raw: a stored `\$` sequence prints as `\\$`, which
                // parses back to the same two characters.
                f.write_str("\"")?;
                for c in s.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        _ => write!(f, "{c}")?,
                    }
                }
                f.write_str("\"")
            }
            Value::Reference(name) => write!(f, "${name}"),
            Value::List(values) => {
                f.write_str("[")?;
                for (i, v) in values.iter().enumerate() {
                    if i != 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            Value::Commands(cmds) => {
                f.write_str("{\n")?;
                for cmd in cmds {
                    write!(f, "{cmd}\n")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// A parsed command: a name and its argument list. Commands never outlive the command
/// list that owns them.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: ValueList,
    /// Source location, for error attribution.
    pub line: u32,
    pub column: u32,
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

pub type CommandList = Vec<Command>;

/// An execution environment.
///
/// Environments form a tree: a child inherits its parent's device, directory handle
/// and a deep copy of its entries at creation, then evolves independently. Entry keys
/// are unique; the names in [`RESERVED_NAMES`] are maintained by the loader and cannot
/// be set or unset from configuration.
pub struct Environment {
    entries: HashMap<String, Value>,
    device: Option<Weak<Device>>,
    directory: Option<Arc<FsHandle>>,
    loader: Option<LoaderBinding>,
}

impl Environment {
    /// Creates an environment, inheriting from `parent` when given.
    pub fn new(parent: Option<&Environment>) -> Self {
        match parent {
            Some(parent) => Self {
                entries: parent.entries.clone(),
                device: parent.device.clone(),
                directory: parent.directory.clone(),
                loader: None,
            },
            None => Self {
                entries: HashMap::new(),
                device: None,
                directory: None,
                loader: None,
            },
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    /// Sets an entry from configuration. Reserved names are rejected.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), ConfigError> {
        if RESERVED_NAMES.contains(&name) {
            config_error!("cannot set reserved variable '{name}'");
        }

        self.entries.insert(name.to_string(), value);
        Ok(())
    }

    /// Removes an entry from configuration. Reserved names are rejected.
    pub fn unset(&mut self, name: &str) -> Result<(), ConfigError> {
        if RESERVED_NAMES.contains(&name) {
            config_error!("cannot unset reserved variable '{name}'");
        }

        self.entries.remove(name);
        Ok(())
    }

    /// Iterates entries in unspecified order.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.as_ref().and_then(Weak::upgrade)
    }

    /// Binds the environment to a device, refreshing the reserved entries that
    /// describe it.
    pub fn set_device(&mut self, device: &Arc<Device>) {
        self.device = Some(Arc::downgrade(device));
        self.directory = None;

        self.entries.insert(
            String::from("device"),
            Value::String(device.name().to_string()),
        );
        self.entries.remove("device_label");
        self.entries.remove("device_uuid");

        if let Some(mount) = device.mount() {
            if let Some(label) = &mount.label {
                self.entries
                    .insert(String::from("device_label"), Value::String(label.clone()));
            }
            if let Some(uuid) = &mount.uuid {
                self.entries
                    .insert(String::from("device_uuid"), Value::String(uuid.clone()));
            }
        }
    }

    pub fn directory(&self) -> Option<Arc<FsHandle>> {
        self.directory.clone()
    }

    pub fn set_directory(&mut self, directory: Arc<FsHandle>) {
        self.directory = Some(directory);
    }

    pub fn loader(&self) -> Option<&LoaderBinding> {
        self.loader.as_ref()
    }

    pub fn loader_mut(&mut self) -> Option<&mut LoaderBinding> {
        self.loader.as_mut()
    }

    /// Binds a loader. Once bound, no further command may execute against this
    /// environment.
    pub fn bind_loader(&mut self, binding: LoaderBinding) {
        assert!(self.loader.is_none(), "environment already has a loader");
        self.loader = Some(binding);
    }

    /// Open context for filesystem operations relative to this environment.
    pub fn open_context(&self) -> crate::fs::OpenContext<'_> {
        crate::fs::OpenContext {
            registry: None,
            device: self.device(),
            directory: self.directory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_primitive_only() {
        assert_eq!(Value::Integer(3), Value::Integer(3));
        assert_ne!(Value::Integer(3), Value::Integer(4));
        assert_ne!(Value::Integer(3), Value::Boolean(true));
        assert_eq!(
            Value::String("a".into()),
            Value::String("a".into())
        );
        assert_ne!(
            Value::List(alloc::vec![Value::Integer(1)]),
            Value::List(alloc::vec![Value::Integer(1)])
        );
    }

    #[test]
    fn child_inherits_deep_copy() {
        let mut parent = Environment::new(None);
        parent.set("root", Value::String("hd0".into())).unwrap();

        let mut child = Environment::new(Some(&parent));
        assert_eq!(child.lookup("root"), Some(&Value::String("hd0".into())));

        child.set("root", Value::String("hd1".into())).unwrap();
        assert_eq!(parent.lookup("root"), Some(&Value::String("hd0".into())));
    }

    #[test]
    fn reserved_names_are_protected() {
        let mut env = Environment::new(None);
        assert!(env.set("device", Value::Integer(1)).is_err());
        assert!(env.unset("device_uuid").is_err());
        assert!(env.set("devices", Value::Integer(1)).is_ok());
    }
}
