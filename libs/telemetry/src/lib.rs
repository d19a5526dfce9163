//! Lightweight tracing setup shared by the collector and agent binaries.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! hg_telemetry::init("hg-collector")?;
//! tracing::info!("logging configured");
//! # Ok(())
//! # }
//! ```
//!
//! The filter comes from `RUST_LOG` (default `info`); `LOG_FORMAT=json`
//! switches to JSON lines for log shippers.

use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Call once, first thing in `main`.
pub fn init(service: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = json_logs(std::env::var("LOG_FORMAT").ok().as_deref());

    let result = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    result.map_err(|err| anyhow!("install tracing subscriber: {err}"))?;
    tracing::debug!(service, "telemetry initialised");
    Ok(())
}

fn json_logs(var: Option<&str>) -> bool {
    matches!(var, Some(v) if v.eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flag_parsing() {
        assert!(json_logs(Some("json")));
        assert!(json_logs(Some("JSON")));
        assert!(!json_logs(Some("text")));
        assert!(!json_logs(None));
    }

    #[test]
    fn init_is_safe_to_call() {
        // The global subscriber may already be installed by another test
        // binary section; either outcome is acceptable here.
        let _ = init("test-service");
        tracing::info!("still alive");
    }
}
