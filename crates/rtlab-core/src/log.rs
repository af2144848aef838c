//! Logging facilities.

use atty::Stream;
use colored::{Color, ColoredString, Colorize};
use log::{debug, error};
use serde_json::json;
use serde_type_name::type_name;

use crate::event::Event;

/// Colors the level label when stderr is a terminal.
pub fn get_colored(s: &str, color: Color) -> ColoredString {
    if atty::is(Stream::Stderr) {
        s.color(color)
    } else {
        s.normal()
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __log_component {
    ($level:ident, $label:literal, $pad:literal, $color:ident, $ctx:expr, $format:expr, $($arg:tt)+) => (
        log::$level!(
            target: $ctx.name(),
            concat!("[{:.3} {}", $pad, "{}] ", $format),
            $ctx.time(),
            $crate::log::get_colored($label, $crate::colored::Color::$color),
            $ctx.name(),
            $($arg)+
        )
    );
}

/// Logs a message at the info level.
///
/// Messages are prefixed with the current simulation time, the level and the component name,
/// and use the component name as the log target.
///
/// # Examples
///
/// ```rust
/// use std::io::Write;
/// use env_logger::Builder;
/// use rtlab_core::{log_info, Simulation, SimulationContext};
///
/// struct Probe {
///     ctx: SimulationContext,
/// }
///
/// impl Probe {
///     fn report(&self, frames: u64) {
///         log_info!(self.ctx, "seen {} frames", frames);
///     }
/// }
///
/// Builder::from_default_env()
///     .format(|buf, record| writeln!(buf, "{}", record.args()))
///     .init();
///
/// let mut sim = Simulation::new(123);
/// let probe = Probe { ctx: sim.create_context("probe") };
/// probe.report(3);
/// ```
#[macro_export]
macro_rules! log_info {
    ($ctx:expr, $msg:expr) => ($crate::__log_component!(info, "INFO", "  ", Green, $ctx, "{}", $msg));
    ($ctx:expr, $format:expr, $($arg:tt)+) => (
        $crate::__log_component!(info, "INFO", "  ", Green, $ctx, $format, $($arg)+)
    );
}

/// Logs a message at the warn level, see [`log_info!`](crate::log_info!).
#[macro_export]
macro_rules! log_warn {
    ($ctx:expr, $msg:expr) => ($crate::__log_component!(warn, "WARN", "  ", Yellow, $ctx, "{}", $msg));
    ($ctx:expr, $format:expr, $($arg:tt)+) => (
        $crate::__log_component!(warn, "WARN", "  ", Yellow, $ctx, $format, $($arg)+)
    );
}

/// Logs a message at the error level, see [`log_info!`](crate::log_info!).
#[macro_export]
macro_rules! log_error {
    ($ctx:expr, $msg:expr) => ($crate::__log_component!(error, "ERROR", " ", Red, $ctx, "{}", $msg));
    ($ctx:expr, $format:expr, $($arg:tt)+) => (
        $crate::__log_component!(error, "ERROR", " ", Red, $ctx, $format, $($arg)+)
    );
}

/// Logs a message at the debug level, see [`log_info!`](crate::log_info!).
#[macro_export]
macro_rules! log_debug {
    ($ctx:expr, $msg:expr) => ($crate::__log_component!(debug, "DEBUG", " ", Blue, $ctx, "{}", $msg));
    ($ctx:expr, $format:expr, $($arg:tt)+) => (
        $crate::__log_component!(debug, "DEBUG", " ", Blue, $ctx, $format, $($arg)+)
    );
}

/// Logs a message at the trace level, see [`log_info!`](crate::log_info!).
#[macro_export]
macro_rules! log_trace {
    ($ctx:expr, $msg:expr) => ($crate::__log_component!(trace, "TRACE", " ", Cyan, $ctx, "{}", $msg));
    ($ctx:expr, $format:expr, $($arg:tt)+) => (
        $crate::__log_component!(trace, "TRACE", " ", Cyan, $ctx, $format, $($arg)+)
    );
}

// Simulation-level event records -----------------------------------------------------------------------------------

fn describe(event: &Event, with_data: bool) -> serde_json::Value {
    let mut record = json!({
        "type": type_name(&event.data).unwrap_or("unknown"),
        "src": event.src,
        "dst": event.dst,
    });
    if with_data {
        record["data"] = json!(event.data);
    }
    record
}

/// Logs an event whose payload matched no arm of [`cast!`](crate::cast!).
pub fn log_unhandled_event(event: Event) {
    error!(
        target: "simulation",
        "[{:.3} {} simulation] Unhandled event: {}",
        event.time,
        get_colored("ERROR", Color::Red),
        describe(&event, true)
    );
}

pub(crate) fn log_undelivered_event(event: Event) {
    error!(
        target: "simulation",
        "[{:.3} {} simulation] No handler for event: {}",
        event.time,
        get_colored("ERROR", Color::Red),
        describe(&event, true)
    );
}

pub(crate) fn log_incorrect_event(event: Event, msg: &str) {
    error!(
        target: "simulation",
        "[{:.3} {} simulation] Incorrect event ({}): {}",
        event.time,
        get_colored("ERROR", Color::Red),
        msg,
        describe(&event, true)
    );
}

pub(crate) fn log_rejected_event(event: Event) {
    debug!(
        target: "simulation",
        "[{:.3} {} simulation] Rejected event after stop: {}",
        event.time,
        get_colored("DEBUG", Color::Blue),
        describe(&event, false)
    );
}
