//! Logger setup
//!
//! The runtime logs through the `log` facade only. Extensions that do not
//! install their own logger get `env_logger` from [`init_logging`], which the
//! generated entry point calls once at library load.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install `env_logger` once; later calls are ignored.
///
/// `filter` uses `env_logger` syntax (e.g. `"tether_core=debug"`). Without
/// one, `RUST_LOG` is used, then `warn`. An already installed global logger
/// is left in place.
pub fn init_logging(filter: Option<&str>) {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();

        if let Some(filter) = filter {
            builder.parse_filters(filter);
        } else if let Ok(filter) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filter);
        } else {
            builder.filter_level(log::LevelFilter::Warn);
        }

        if builder.try_init().is_ok() {
            log::debug!("logging initialized");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_logging(Some("tether_core=trace"));
        init_logging(None);
        log::trace!("still fine");
    }
}
