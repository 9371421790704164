//! Console output plumbing and boot log.
//!
//! The core never talks to hardware directly: platforms register a [`ConsoleOut`] sink
//! (serial, VGA text, framebuffer, ...) and everything above goes through the `print!`,
//! `info!`, `warn!` and `error!` macros. Every line is also appended to a fixed-size
//! in-RAM ring so the native loader can hand the kernel a copy of the boot log.

pub mod log;

use core::fmt;

use conquer_once::spin::OnceCell;

/// An output-only console sink.
///
/// Implementors are expected to block until the full string has been accepted by the
/// device (serial FIFO drain, ...).
pub trait ConsoleOut: Send + Sync {
    fn write_str(&self, s: &str);
}

/// An input-only console.
pub trait ConsoleIn: Send + Sync {
    /// Returns the next pending input byte, if any. Never blocks.
    fn poll_char(&self) -> Option<u8>;
}

static CONSOLE: OnceCell<&'static dyn ConsoleOut> = OnceCell::uninit();

/// Registers the console sink used by the output macros.
///
/// Only the first registration wins; a platform that wants to switch away from an early
/// console registers a multiplexing sink up front.
pub fn console_register(console: &'static dyn ConsoleOut) {
    CONSOLE.init_once(|| console);
}

struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Ok(console) = CONSOLE.try_get() {
            console.write_str(s);
        }

        log::boot_log_append(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn __console_print(args: fmt::Arguments) {
    use core::fmt::Write;

    // The sink itself never fails, so neither can the formatter.
    let _ = ConsoleWriter.write_fmt(args);
}

/// Prints to the registered console sink.
#[macro_export]
macro_rules! print {
    ($($t_elm: tt)*) => {
        $crate::io::__console_print(format_args!($($t_elm)*))
    };
}

/// Prints to the registered console sink, with a trailing newline.
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($t_elm: tt)*) => {{
        $crate::io::__console_print(format_args!($($t_elm)*));
        $crate::print!("\n");
    }};
}

/// Prints a standard information message to the output.
///
/// You can specify a 'context' as the first argument when calling the macro, which will
/// be inserted at the beginning of the message.
///
/// # Examples
///
/// ```
/// use frostboot::info;
///
/// info!("fs", "mounted boot device");
/// ```
#[macro_export]
macro_rules! info {
    ($ctx: literal, $($arg: tt)*) => {{
        $crate::print!("[info] {} : ", $ctx);
        $crate::println!($($arg)*);
    }};
    ($($arg: tt)*) => {{
        $crate::print!("[info] ");
        $crate::println!($($arg)*);
    }};
}

/// Prints a warning message to the output.
#[macro_export]
macro_rules! warn {
    ($ctx: literal, $($arg: tt)*) => {{
        $crate::print!("[warn] {} : ", $ctx);
        $crate::println!($($arg)*);
    }};
    ($($arg: tt)*) => {{
        $crate::print!("[warn] ");
        $crate::println!($($arg)*);
    }};
}

/// Prints an error message to the output.
///
/// # Examples
///
/// ```
/// use frostboot::error;
///
/// error!("fs", "failed to mount boot device");
/// ```
#[macro_export]
macro_rules! error {
    ($ctx: literal, $($arg: tt)*) => {{
        $crate::print!("[error] {} : ", $ctx);
        $crate::println!($($arg)*);
    }};
    ($($arg: tt)*) => {{
        $crate::print!("[error] ");
        $crate::println!($($arg)*);
    }};
}
