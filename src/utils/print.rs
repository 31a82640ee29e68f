//! Logging macros. Every line is prefixed with the process tag, e.g. `(p1)`,
//! so interleaved output of a local cluster stays readable.

use std::sync::OnceLock;

use env_logger::Env;

/// Process tag used as logging prefix, set once the server knows its ID.
pub static ME: OnceLock<String> = OnceLock::new();

/// Current logging prefix, `-` before the process tag is known.
#[doc(hidden)]
pub fn me_tag() -> &'static str {
    ME.get().map_or("-", String::as_str)
}

/// Logs at the given `log` level with the process tag prefix.
#[doc(hidden)]
#[macro_export]
macro_rules! pf_log {
    ($level:ident, $($fmt_args:tt)*) => {
        log::$level!("({}) {}", $crate::me_tag(), format_args!($($fmt_args)*))
    };
}

/// Log TRACE message with process tag prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!("recv <{}> '{}'", conn, line);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => { $crate::pf_log!(trace, $($fmt_args)*) };
}

/// Log DEBUG message with process tag prefix.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => { $crate::pf_log!(debug, $($fmt_args)*) };
}

/// Log INFO message with process tag prefix.
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => { $crate::pf_log!(info, $($fmt_args)*) };
}

/// Log WARN message with process tag prefix.
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => { $crate::pf_log!(warn, $($fmt_args)*) };
}

/// Log ERROR message with process tag prefix.
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => { $crate::pf_log!(error, $($fmt_args)*) };
}

/// Installs `env_logger` with `level` as the default filter, unless a logger
/// is already installed. `RUST_LOG` still takes precedence.
pub fn logger_init(level: &str) {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .format_module_path(false)
        .format_target(false)
        .try_init();
}

/// Logs an error and evaluates to `Err(LendsetError)` holding the same text.
///
/// Example:
/// ```no_compile
/// return logged_err!("invalid peer ID {} to connect", pid);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::LendsetError::msg(format!($($fmt_args)*)))
        }
    };
}
