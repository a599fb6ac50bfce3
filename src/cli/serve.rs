use tracing_subscriber::EnvFilter;

use crate::error::Result;
use crate::server;
use crate::settings::load_settings;

pub fn run(host: Option<String>, port: Option<u16>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tirelire=info")),
        )
        .init();

    let mut settings = load_settings();
    if let Some(host) = host {
        settings.host = host;
    }
    if let Some(port) = port {
        settings.port = port;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(server::run(settings))
}
