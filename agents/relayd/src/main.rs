//! The relay daemon binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use eyre::Result;
use tracing::info;

use relayd::Relayd;
use txrelay_base::RelaySettings;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // Logging is not initialised at this point, so, using `println!`
    println!("Relay daemon starting up...");

    let settings = RelaySettings::load()?;
    settings.tracing.start_tracing()?;
    info!(?settings, "Loaded settings");

    Relayd::from_settings(settings)?.run().await
}
