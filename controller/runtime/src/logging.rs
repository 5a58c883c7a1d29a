//! Maps the controller's verbosity flags onto a log filter. The kubert runtime
//! installs the subscriber.

use anyhow::{anyhow, Result};

/// The crate-name prefix shared by every controller crate.
const TARGET: &str = "startup_scaler_controller";

#[derive(Clone, Debug)]
pub struct LogSettings {
    /// Overrides the verbosity-derived filter.
    pub filter: Option<String>,
    pub verbosity: u8,
}

impl LogSettings {
    fn directives(&self) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        let level = match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        format!("{TARGET}={level},warn")
    }

    pub fn filter(&self) -> Result<kubert::LogFilter> {
        let directives = self.directives();
        directives
            .parse::<kubert::LogFilter>()
            .map_err(|error| anyhow!("invalid log filter {directives:?}: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(filter: Option<&str>, verbosity: u8) -> LogSettings {
        LogSettings {
            filter: filter.map(Into::into),
            verbosity,
        }
    }

    #[test]
    fn verbosity_selects_controller_level() {
        assert_eq!(settings(None, 0).directives(), "startup_scaler_controller=info,warn");
        assert_eq!(settings(None, 1).directives(), "startup_scaler_controller=debug,warn");
        assert_eq!(settings(None, 2).directives(), "startup_scaler_controller=trace,warn");
        assert!(settings(None, 2).filter().is_ok());
    }

    #[test]
    fn explicit_filter_wins() {
        assert_eq!(settings(Some("kube=debug"), 2).directives(), "kube=debug");
        assert!(settings(Some("kube=debug"), 0).filter().is_ok());
        assert!(settings(Some("kube=loud"), 0).filter().is_err());
    }
}
