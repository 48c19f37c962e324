//! Logging macros that put the acting agent or operation in front of every
//! line.

use std::fmt;
use std::sync::OnceLock;

use env_logger::Env;

/// Identity of this agent, e.g. `"rs0/node1:27017"`. Prefixes log lines that
/// carry no explicit context.
pub static ME: OnceLock<String> = OnceLock::new();

/// Sets the global agent identity. Only the first call takes effect.
pub fn set_me(me: impl Into<String>) {
    let _ = ME.set(me.into());
}

/// Prefix of log lines without an explicit context: the agent identity, or
/// `-` before it is set.
#[doc(hidden)]
pub fn me_prefix() -> &'static str {
    ME.get().map_or("-", |me| me.as_str())
}

/// Shared body of the `pf_*!` macros: formats the message and hands it to
/// `log` at `$lvl` behind a parenthesized prefix.
#[doc(hidden)]
#[macro_export]
macro_rules! pf_log {
    ($lvl:expr, $ctx:expr; $($fmt_args:tt)*) => {
        log::log!($lvl, "({}) {}", $ctx, format!($($fmt_args)*))
    };
}

/// Trace-level line. Prefixed by the agent identity, or by a context given
/// ahead of a `;`:
///
/// ```no_compile
/// pf_trace!("polling {} shards", n);
/// pf_trace!(ev; "chunk {} opened", chunk.fname);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($ctx:expr; $($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Trace, $ctx; $($fmt_args)*)
    };
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Trace, $crate::me_prefix(); $($fmt_args)*)
    };
}

/// Debug-level line, prefixed like [`pf_trace!`].
#[macro_export]
macro_rules! pf_debug {
    ($ctx:expr; $($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Debug, $ctx; $($fmt_args)*)
    };
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Debug, $crate::me_prefix(); $($fmt_args)*)
    };
}

/// Info-level line.
#[macro_export]
macro_rules! pf_info {
    ($ctx:expr; $($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Info, $ctx; $($fmt_args)*)
    };
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Info, $crate::me_prefix(); $($fmt_args)*)
    };
}

/// Warn-level line.
#[macro_export]
macro_rules! pf_warn {
    ($ctx:expr; $($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Warn, $ctx; $($fmt_args)*)
    };
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Warn, $crate::me_prefix(); $($fmt_args)*)
    };
}

/// Error-level line.
#[macro_export]
macro_rules! pf_error {
    ($ctx:expr; $($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Error, $ctx; $($fmt_args)*)
    };
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Error, $crate::me_prefix(); $($fmt_args)*)
    };
}

/// Per-operation logging context, used as the explicit prefix form of the
/// `pf_*!` macros. Displays as `<operation>/<name>/<replset>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub operation: &'static str,
    pub name: String,
    pub replset: String,
}

impl LogEvent {
    pub fn restore(
        name: impl Into<String>,
        replset: impl Into<String>,
    ) -> Self {
        LogEvent {
            operation: "restore",
            name: name.into(),
            replset: replset.into(),
        }
    }

    pub fn backup(name: impl Into<String>, replset: impl Into<String>) -> Self {
        LogEvent {
            operation: "backup",
            name: name.into(),
            replset: replset.into(),
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.operation, self.name, self.replset)
    }
}

/// Installs `env_logger` once per process. `RUST_LOG` overrides
/// `default_filter`; later calls are no-ops.
pub fn logger_init(default_filter: &str) {
    let env = Env::default().default_filter_or(default_filter);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .try_init();
}

/// Logs at error level and evaluates to `Err(PitrError)` of kind `Other`
/// holding the same message.
///
/// ```no_compile
/// return logged_err!(ev; "chunk {} missing", fname);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($ctx:expr; $($fmt_args:tt)*) => {
        {
            $crate::pf_error!($ctx; $($fmt_args)*);
            Err($crate::PitrError::msg(format!($($fmt_args)*)))
        }
    };
    ($($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::PitrError::msg(format!($($fmt_args)*)))
        }
    };
}
