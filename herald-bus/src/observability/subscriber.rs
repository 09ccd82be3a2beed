use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{BusError, BusResult};

/// Install a global subscriber: `RUST_LOG`-style filtering (default `info`)
/// with plain or JSON lines.
pub fn init_tracing(json: bool) -> BusResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    installed.map_err(|e| BusError::Internal(format!("tracing subscriber: {e}")))
}
