//! Log setup and the scoped event macros used across the relay.
//!
//! Events are grouped under three spans: `internal` for the relay's own
//! lifecycle, `outgoing` for commands written to a remote server and
//! `incoming` for what the server sends back.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

/// Environment variable that overrides the configured level.
pub const LEVEL_ENV: &str = "CARRIER_LOG";

/// ```ron
/// logging: (level: "debug", ansi: false)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `trace` through `error`, or `off`. Unset means `trace` in debug
    /// builds and `info` otherwise.
    #[serde(default)]
    pub level: Option<String>,

    /// Colour the output. Turn off when logs go to a file or journal.
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

const fn default_ansi() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: None,
            ansi: default_ansi(),
        }
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! scoped_event {
    ($scope:literal, $level:ident, $($msg:tt)+) => {{
        let span = $crate::tracing::span!($crate::tracing::Level::$level, $scope);
        let _enter = span.enter();

        $crate::tracing::event!($crate::tracing::Level::$level, $($msg)+)
    }};
}

/// A command we sent to a remote server. `TRACE` unless a level is given.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)+) => {
        $crate::scoped_event!("outgoing", $level, $($msg)+)
    };
    ($($msg:tt)+) => {
        $crate::scoped_event!("outgoing", TRACE, $($msg)+)
    };
}

/// A reply from a remote server.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:tt)+) => {
        $crate::scoped_event!("incoming", $level, $($msg)+)
    };
    ($($msg:tt)+) => {
        $crate::scoped_event!("incoming", TRACE, $($msg)+)
    };
}

/// Relay lifecycle: startup, shutdown, sessions opening and closing.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)+) => {
        $crate::scoped_event!("internal", $level, $($msg)+)
    };
    ($($msg:tt)+) => {
        $crate::scoped_event!("internal", TRACE, $($msg)+)
    };
}

/// The level to log at: the environment wins over the config file, and
/// an unparseable value in either falls through to the next.
fn resolve_level(from_env: Option<&str>, configured: Option<&str>) -> LevelFilter {
    let fallback = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    [(LEVEL_ENV, from_env), ("logging.level", configured)]
        .into_iter()
        .filter_map(|(source, value)| value.map(|value| (source, value)))
        .find_map(|(source, value)| match LevelFilter::from_str(value.trim()) {
            Ok(level) => Some(level),
            Err(_) => {
                eprintln!("Ignoring invalid log level {value:?} from {source}");
                None
            }
        })
        .unwrap_or(fallback)
}

/// Installs the global subscriber. Only events from the relay's own crates
/// are emitted.
pub fn init(config: &LogConfig) {
    let from_env = std::env::var(LEVEL_ENV).ok();
    let level = resolve_level(from_env.as_deref(), config.level.as_deref());

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .with_target(false)
                .compact()
                .with_ansi(config.ansi)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("carrier")
                })),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_overrides_the_config_file() {
        assert_eq!(resolve_level(Some("warn"), Some("debug")), LevelFilter::WARN);
        assert_eq!(resolve_level(None, Some("debug")), LevelFilter::DEBUG);
    }

    #[test]
    fn invalid_levels_fall_through() {
        assert_eq!(resolve_level(Some("loud"), Some(" error ")), LevelFilter::ERROR);

        let fallback = resolve_level(None, None);
        assert_eq!(resolve_level(Some("loud"), Some("quiet")), fallback);
    }

    #[test]
    fn colour_is_on_unless_disabled() {
        assert!(LogConfig::default().ansi);
        assert!(LogConfig::default().level.is_none());
    }
}
