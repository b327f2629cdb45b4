pub mod agenda;
pub mod init_config;
pub mod next;
pub mod run;

use std::sync::Arc;

use alarmd_core::{AlarmdConfig, Engine};
use alarmd_source_ics::discover_sources;
use anyhow::Result;
use chrono_tz::Tz;
use tracing::{info, warn};

/// The zone to work in: the configured one, else the system's, else UTC.
pub fn timezone(config: &AlarmdConfig) -> Result<Tz> {
    let system = iana_time_zone::get_timezone()
        .ok()
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or_else(|| {
            warn!("could not determine system timezone, using UTC");
            chrono_tz::UTC
        });

    Ok(config.resolve_timezone(system)?)
}

/// An engine with every enabled calendar under the calendar directory.
pub fn build_engine(config: &AlarmdConfig, tz: Tz) -> Result<Engine> {
    let calendar_dir = config.calendar_dir();
    if !calendar_dir.is_dir() {
        anyhow::bail!(
            "Calendar directory {} not found.\n\n\
            Create it, or point calendar_dir at your calendars in the config.\n\
            A default config can be written with:\n  \
            alarmd init-config",
            calendar_dir.display()
        );
    }

    let engine = Engine::new(config.engine);
    for source in discover_sources(&calendar_dir, tz)? {
        info!(calendar = %source.name(), path = %source.dir().display(), "calendar added");
        engine.add_source(Arc::new(source));
    }
    Ok(engine)
}
