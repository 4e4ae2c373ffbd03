/*!

Logging for simulation code. The `log` facade macros are re-exported here so modules can write
`use crate::log::{debug, trace};`, and `log4rs` provides a console backend that can be switched
on, off, or to a particular level at runtime.

If the host process has already installed its own logger, the functions in this module leave
it in place and only the `log` facade macros are used.

*/

pub use log::{debug, error, info, trace, warn, LevelFilter};

use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    Config, Handle,
};
use std::sync::{Mutex, PoisonError};

const DEFAULT_LOG_PATTERN: &str = "{h({l})} {M}: {m}{n}";
const CONSOLE_APPENDER: &str = "stdout";

static LOG_HANDLE: Mutex<Option<Handle>> = Mutex::new(None);

fn console_config(level: LevelFilter) -> Config {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(DEFAULT_LOG_PATTERN)))
        .build();

    Config::builder()
        .appender(Appender::builder().build(CONSOLE_APPENDER, Box::new(stdout)))
        .build(Root::builder().appender(CONSOLE_APPENDER).build(level))
        .unwrap() // Will never panic: the only appender referenced is the one registered above
}

/// Sets the maximum level emitted to the console, installing the console logger on first use.
pub fn set_log_level(level: LevelFilter) {
    let config = console_config(level);
    let mut handle = LOG_HANDLE.lock().unwrap_or_else(PoisonError::into_inner);

    match handle.as_ref() {
        Some(existing) => existing.set_config(config),
        None => {
            if let Ok(new_handle) = log4rs::init_config(config) {
                *handle = Some(new_handle);
            }
        }
    }
}

/// Emits everything down to `trace`.
pub fn enable_logging() {
    set_log_level(LevelFilter::Trace);
}

pub fn disable_logging() {
    set_log_level(LevelFilter::Off);
}
