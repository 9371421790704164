use core::fmt::{self, Debug, Display};

use alloc::string::String;

/// `BaseError` is a common trait implemented by every error type defined in Frostboot.
///
/// It is dependent on the [`Debug`] trait, which makes sense as we are dealing with errors.
pub trait BaseError: Debug {}

/// `CanFail` is a return type for functions that are allowed to fail, and don't need to return
/// anything.
pub type CanFail<T> = Result<(), T>;

/// Outcome of a device, filesystem or loader operation.
///
/// These are expected conditions: the caller decides whether to propagate, retry (next
/// filesystem driver on [`Status::UnknownFs`], next configuration path on
/// [`Status::NotFound`]) or translate into a [`ConfigError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// The device does not hold a filesystem this driver recognises. The mount probe moves
    /// on to the next registered driver.
    UnknownFs,

    /// The filesystem was recognised but its on-disk structures are damaged.
    CorruptFs,

    /// The operation is valid but not supported by this implementation.
    NotSupported,

    /// The named entry, device or path component does not exist.
    NotFound,

    /// An I/O transfer with the underlying device failed.
    Io,

    /// A read reached the end of the stream before completion.
    EndOfFile,

    /// Symbolic link resolution exceeded the recursion limit.
    SymlinkLimit,

    /// A regular file was found where a directory was required, or vice-versa.
    TypeMismatch,

    /// An argument was malformed (bad path syntax, bad alignment, ...).
    InvalidArg,

    /// A memory allocation could not be satisfied.
    NoMemory,

    /// The device exists but carries no usable partition scheme.
    UnknownScheme,
}

impl BaseError for Status {}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Status::UnknownFs => "unknown filesystem",
            Status::CorruptFs => "corrupt filesystem",
            Status::NotSupported => "not supported",
            Status::NotFound => "not found",
            Status::Io => "input/output error",
            Status::EndOfFile => "end of file",
            Status::SymlinkLimit => "too many levels of symbolic links",
            Status::TypeMismatch => "entry type mismatch",
            Status::InvalidArg => "invalid argument",
            Status::NoMemory => "out of memory",
            Status::UnknownScheme => "unknown partition scheme",
        };

        f.write_str(msg)
    }
}

/// Return type for filesystem and device operations.
pub type FsResult<T> = Result<T, Status>;

/// An error raised while parsing or executing a configuration.
///
/// Carries the source location when raised by the parser (1-based line and column), or the
/// location of the failing command when raised during execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl ConfigError {
    pub fn new(message: String, line: u32, column: u32) -> Self {
        Self {
            message,
            line,
            column,
        }
    }
}

impl BaseError for ConfigError {}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

/// Raises a [`ConfigError`] from inside a command or the parser.
///
/// The expansion evaluates to `return Err(...)`, so it can only be used in functions
/// returning `Result<_, ConfigError>`. The location is filled in by the executor when
/// it knows the failing command.
#[macro_export]
macro_rules! config_error {
    ($($arg: tt)*) => {
        return Err($crate::errors::ConfigError::new(
            alloc::format!($($arg)*),
            0,
            0,
        ))
    };
}

/// Reports an unrecoverable environmental problem (missing configuration, unloadable
/// kernel) and aborts the boot.
///
/// The message goes through the registered console sink before the abort, so it reaches
/// the user even when no error UI is available.
#[macro_export]
macro_rules! boot_error {
    ($($arg: tt)*) => {{
        $crate::error!("boot", $($arg)*);
        panic!($($arg)*);
    }};
}

/// Reports an invariant violation. This indicates a defect in the loader itself, not an
/// environmental problem.
#[macro_export]
macro_rules! internal_error {
    ($($arg: tt)*) => {{
        $crate::error!("internal", $($arg)*);
        panic!($($arg)*);
    }};
}
