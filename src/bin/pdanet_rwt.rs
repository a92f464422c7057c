//! pdanet-rwt binary
//!
//! Takes no arguments. Configuration comes from `$PDANET_RWT_CONFIG` or
//! `/etc/pdanet-rwt/config.toml`; run it with sudo and stop it with Ctrl+C.

use log::{debug, info};
use pdanet_rwt::{
    config::Config, HostFacts, LifecycleController, SystemCommandRunner, TerminationSignals,
};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = match Config::load().and_then(|config| config.validate().map(|()| config)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    info!("Starting {} v{}", pdanet_rwt::NAME, pdanet_rwt::VERSION);
    debug!("Proxy: {}:{}", config.proxy.host, config.proxy.port);

    // Installed before anything on the host changes
    let mut signals = match TerminationSignals::install() {
        Ok(signals) => signals,
        Err(e) => {
            eprintln!("Error: cannot install signal handlers: {e}");
            process::exit(1);
        }
    };

    let mut controller =
        LifecycleController::new(config, HostFacts::detect(), Arc::new(SystemCommandRunner));
    let code = controller.run(signals.recv()).await;

    debug!("Exiting with status {code}");
    process::exit(code);
}
