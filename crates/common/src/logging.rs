//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Crates whose events follow the configured level; everything else is
/// held at `warn`
const OWN_TARGETS: [&str; 4] = ["host", "protocol", "common", "recovery_usb"];

/// Filter directives for `level` scoped to this workspace's crates
///
/// A value that already looks like a directive list (`host=trace,...`) is
/// passed through unchanged.
pub fn directives_for(level: &str) -> String {
    if level.contains('=') || level.contains(',') {
        return level.to_string();
    }

    let mut directives = String::from("warn");
    for target in OWN_TARGETS {
        directives.push_str(&format!(",{}={}", target, level));
    }
    directives
}

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level`. Log lines go to stderr so
/// command output on stdout stays machine readable.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives_for(default_level)))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_scoped_to_workspace() {
        let directives = directives_for("debug");
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("host=debug"));
        assert!(directives.contains("recovery_usb=debug"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_directive_list_passthrough() {
        assert_eq!(directives_for("host=trace,rusb=debug"), "host=trace,rusb=debug");
    }

    #[test]
    fn test_second_setup_is_config_error() {
        let _ = setup_logging("info");
        let err = setup_logging("info").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
        assert!(err.to_string().contains("already initialized"));
    }
}
