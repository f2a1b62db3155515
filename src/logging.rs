//! Logging setup and the runtime debug switch.

use crate::error::{Result, SyncError};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, Registry};

/// Something whose log verbosity can be flipped at runtime.
pub trait Verbosity: Send + Sync {
    fn set_debug(&self, enabled: bool) -> Result<()>;
    fn is_debug(&self) -> bool;
}

/// Handle to the global subscriber's level filter.
pub struct LevelSwitch {
    handle: reload::Handle<LevelFilter, Registry>,
    debug: AtomicBool,
}

impl Verbosity for LevelSwitch {
    fn set_debug(&self, enabled: bool) -> Result<()> {
        self.handle
            .reload(level_for(enabled))
            .map_err(|e| SyncError::Config(format!("cannot reload log level: {e}")))?;
        self.debug.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn is_debug(&self) -> bool {
        self.debug.load(Ordering::SeqCst)
    }
}

/// Flag-only verbosity for embedders that own the subscriber themselves.
#[derive(Default)]
pub struct StaticVerbosity {
    debug: AtomicBool,
}

impl StaticVerbosity {
    pub fn new(debug: bool) -> Self {
        Self {
            debug: AtomicBool::new(debug),
        }
    }
}

impl Verbosity for StaticVerbosity {
    fn set_debug(&self, enabled: bool) -> Result<()> {
        self.debug.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn is_debug(&self) -> bool {
        self.debug.load(Ordering::SeqCst)
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(debug: bool) -> Result<LevelSwitch> {
    let (filter, handle) = reload::Layer::new(level_for(debug));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| SyncError::Config(format!("cannot install log subscriber: {e}")))?;

    Ok(LevelSwitch {
        handle,
        debug: AtomicBool::new(debug),
    })
}

fn level_for(debug: bool) -> LevelFilter {
    if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_toggle() {
        let verbosity = StaticVerbosity::new(false);
        assert!(!verbosity.is_debug());
        verbosity.set_debug(true).unwrap();
        assert!(verbosity.is_debug());
    }

    #[test]
    fn test_global_switch_installs_once() {
        let switch = init(false).unwrap();
        assert!(!switch.is_debug());
        switch.set_debug(true).unwrap();
        assert!(switch.is_debug());
        assert!(init(false).is_err());
    }

    #[test]
    fn test_level_for() {
        assert_eq!(level_for(true), LevelFilter::DEBUG);
        assert_eq!(level_for(false), LevelFilter::INFO);
    }
}
