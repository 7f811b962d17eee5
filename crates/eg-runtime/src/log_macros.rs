/// Domain-aware logging macros.
///
/// Each macro injects a `domain` field automatically so callers never need
/// to remember the string literal. Domains: `sys` (lifecycle), `conn`
/// (sidecar/telemetry links), `pipe` (data plane), `res` (resource
/// accounting), `conf` (configuration/reload).
///
/// # Usage
///
/// ```ignore
/// eg_info!(sys, adapters = 2, sinks = 3, "gateway bootstrap complete");
/// eg_warn!(pipe, error = %e, rule = %rule_id, "action pipeline error");
/// eg_debug!(conn, peer = %peer, "sidecar connected");
/// ```

/// Internal helper. Do not call directly; use `eg_error!` … `eg_trace!`.
#[doc(hidden)]
macro_rules! eg_log {
    ($level:ident, $domain:ident, $($field:tt)*) => {
        tracing::$level!(domain = stringify!($domain), $($field)*)
    };
}

/// Log at ERROR level with an automatic `domain` field.
macro_rules! eg_error {
    ($domain:ident, $($rest:tt)*) => {
        eg_log!(error, $domain, $($rest)*)
    };
}

/// Log at WARN level with an automatic `domain` field.
macro_rules! eg_warn {
    ($domain:ident, $($rest:tt)*) => {
        eg_log!(warn, $domain, $($rest)*)
    };
}

/// Log at INFO level with an automatic `domain` field.
macro_rules! eg_info {
    ($domain:ident, $($rest:tt)*) => {
        eg_log!(info, $domain, $($rest)*)
    };
}

/// Log at DEBUG level with an automatic `domain` field.
macro_rules! eg_debug {
    ($domain:ident, $($rest:tt)*) => {
        eg_log!(debug, $domain, $($rest)*)
    };
}

/// Log at TRACE level with an automatic `domain` field.
#[allow(unused_macros)]
macro_rules! eg_trace {
    ($domain:ident, $($rest:tt)*) => {
        eg_log!(trace, $domain, $($rest)*)
    };
}
