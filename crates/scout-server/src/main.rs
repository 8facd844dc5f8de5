//! Scout server launcher.
//!
//! Exit codes: 0 on clean shutdown, 1 on configuration errors, 2 on runtime
//! aborts.

use scout_core::Settings;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = scout_server::start_server(settings).await {
        tracing::error!("server aborted: {e:#}");
        std::process::exit(2);
    }
}
