//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` takes precedence; `default_directive` (e.g. `"tabula=info"`) is
/// added on top of it. Returns `false` when a subscriber was already installed,
/// which is expected when several tests initialise logging.
pub fn init(default_directive: &str) -> bool {
    let mut filter = EnvFilter::from_default_env();
    match default_directive.parse() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(e) => eprintln!("ignoring invalid log directive {default_directive:?}: {e}"),
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        let _ = init("tabula=debug");
        assert!(!init("tabula=info"));
    }
}
