use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Transport mode for MCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// stdio transport (default) - for local MCP clients
    Stdio,
    /// Streamable HTTP transport - for remote/web access
    Stream,
}

/// Initialize logging based on transport mode
///
/// # stdio mode
/// - NO stderr output (stderr noise during the handshake breaks MCP clients)
/// - File logging only when `log_file` is Some
///
/// # Stream mode
/// - Console (stderr) logging always on
/// - File logging in addition when `log_file` is Some
pub fn init_logging(mode: TransportMode, log_file: Option<&Path>) -> anyhow::Result<()> {
    let console = (mode == TransportMode::Stream).then(|| fmt::layer().with_writer(std::io::stderr));

    let file = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        }
        None => None,
    };

    if console.is_none() && file.is_none() {
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(console)
        .with(file)
        .try_init()?;
    Ok(())
}
