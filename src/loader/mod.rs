//! OS loader framework.
//!
//! Loader commands (`kboot`, `linux`, ...) do not load anything: they validate their
//! image and bind a [`LoaderOps`] plus an opaque state onto the environment. The boot
//! then happens once, through [`environ_boot`], after which control never returns.

pub mod elf;
#[cfg(feature = "x86_64")]
pub mod kboot;
#[cfg(feature = "x86_64")]
pub mod linux;

use core::any::Any;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{Environment, Value, ValueList};
use crate::errors::ConfigError;

/// Extracts a required string argument from a loader command's argument list.
pub(crate) fn arg_string(
    args: &ValueList,
    index: usize,
    what: &str,
) -> Result<String, ConfigError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => config_error!("expected {what} (string), got {}", other.type_name()),
        None => config_error!("missing {what} argument"),
    }
}

/// Operation set of an OS loader.
pub trait LoaderOps: Send + Sync {
    fn name(&self) -> &'static str;

    /// Loads the OS described by the environment's loader state and transfers control
    /// to it. Never returns.
    fn load(&self, env: &mut Environment) -> !;
}

/// A loader bound to an environment: the operations and the loader-private state built
/// by its command.
pub struct LoaderBinding {
    pub ops: &'static dyn LoaderOps,
    pub state: Box<dyn Any + Send>,
}

impl LoaderBinding {
    pub fn new(ops: &'static dyn LoaderOps, state: Box<dyn Any + Send>) -> Self {
        Self { ops, state }
    }

    /// Downcasts the loader state.
    pub fn state<T: 'static>(&self) -> Option<&T> {
        self.state.downcast_ref()
    }
}

/// Hooks run immediately before the bound loader takes over, in registration order.
/// Used by platforms and drivers to quiesce hardware (mask interrupts, stop DMA,
/// flush consoles).
static PREBOOT_HOOKS: Mutex<Vec<fn()>> = Mutex::new(Vec::new());

pub fn register_preboot_hook(hook: fn()) {
    PREBOOT_HOOKS.lock().push(hook);
}

fn run_preboot_hooks() {
    let hooks: Vec<fn()> = PREBOOT_HOOKS.lock().clone();
    for hook in hooks {
        hook();
    }
}

/// Boots the environment's bound loader. The environment must be loader-bound; this is
/// the `booted` transition and never returns.
pub fn environ_boot(env: &mut Environment) -> ! {
    let Some(binding) = env.loader() else {
        boot_error!("no operating system loader is bound");
    };
    let ops = binding.ops;

    info!("loader", "booting via {}", ops.name());
    run_preboot_hooks();
    ops.load(env)
}
