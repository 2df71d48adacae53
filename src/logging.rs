//! Internal logging helpers for structured slicestore events.

/// Single logging target for slicestore.
pub(crate) const LOG_TARGET: &str = "slicestore";

/// Common key/value fields appended to all logs in a scope.
#[derive(Clone, Debug, Default)]
pub(crate) struct LogContext {
    common_kv: String,
}

impl LogContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append `key=value` to the common fields.
    pub(crate) fn with(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        if !self.common_kv.is_empty() {
            self.common_kv.push(' ');
        }
        self.common_kv.push_str(key);
        self.common_kv.push('=');
        self.common_kv.push_str(&value.to_string());
        self
    }

    pub(crate) fn common_kv(&self) -> Option<&str> {
        if self.common_kv.is_empty() {
            None
        } else {
            Some(&self.common_kv)
        }
    }
}

macro_rules! slicestore_log {
    ($level:expr, ctx: $ctx:expr, $event:expr, $fmt:expr $(, $args:expr)* $(,)?) => {{
        if log::log_enabled!(target: crate::logging::LOG_TARGET, $level) {
            if let Some(common_kv) = $ctx.common_kv() {
                log::log!(
                    target: crate::logging::LOG_TARGET,
                    $level,
                    "event={} {} {}",
                    $event,
                    common_kv,
                    format_args!($fmt $(, $args)*)
                );
            } else {
                log::log!(
                    target: crate::logging::LOG_TARGET,
                    $level,
                    "event={} {}",
                    $event,
                    format_args!($fmt $(, $args)*)
                );
            }
        }
    }};
    ($level:expr, $event:expr, $fmt:expr $(, $args:expr)* $(,)?) => {{
        if log::log_enabled!(target: crate::logging::LOG_TARGET, $level) {
            log::log!(
                target: crate::logging::LOG_TARGET,
                $level,
                "event={} {}",
                $event,
                format_args!($fmt $(, $args)*)
            );
        }
    }};
}

pub(crate) use slicestore_log;
