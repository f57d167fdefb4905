//! tracing setup whose level can be changed once the final config is known
//!
//! The subscriber starts from the environment config; bootstrap may deliver a
//! different `log.level`, applied through a reload handle. `RUST_LOG` wins over
//! both.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

pub struct LogLevel {
    handle: reload::Handle<EnvFilter, Registry>,
    pinned: bool,
}

/// `edge_agent=<level>`, falling back to `info` for an unknown level
pub fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_new(format!("edge_agent={level}")).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber
pub fn init(level: &str) -> LogLevel {
    let (filter, pinned) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (filter_for(level), false),
    };
    let (layer, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(layer)
        .with(fmt::layer())
        .init();
    LogLevel { handle, pinned }
}

impl LogLevel {
    /// Switch to `level` unless `RUST_LOG` pinned the filter
    pub fn apply(&self, level: &str) -> Result<(), reload::Error> {
        if self.pinned {
            return Ok(());
        }
        self.handle.reload(filter_for(level))
    }

    /// Active filter directives, lowercased
    pub fn current(&self) -> Option<String> {
        self.handle
            .with_current(|filter| filter.to_string().to_lowercase())
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_changes_after_start() {
        let (layer, handle) = reload::Layer::new(filter_for("info"));
        let _subscriber = tracing_subscriber::registry().with(layer);
        let level = LogLevel {
            handle,
            pinned: false,
        };
        assert_eq!(level.current().as_deref(), Some("edge_agent=info"));

        level.apply("debug").unwrap();
        assert_eq!(level.current().as_deref(), Some("edge_agent=debug"));
    }

    #[test]
    fn test_rust_log_pins_the_filter() {
        let (layer, handle) = reload::Layer::new(filter_for("warn"));
        let _subscriber = tracing_subscriber::registry().with(layer);
        let level = LogLevel {
            handle,
            pinned: true,
        };
        level.apply("trace").unwrap();
        assert_eq!(level.current().as_deref(), Some("edge_agent=warn"));
    }
}
