//! Submit signed transactions to a running relay daemon.
//!
//! Every input is either a hex encoded transaction or a file with one hex
//! transaction per line. The hash of each queued transaction is printed.

use std::path::PathBuf;

use clap::Parser;
use eyre::{Result, WrapErr};

use relayd::{default_sources, load_transactions, SocketClient};
use txrelay_base::RelaySettings;

#[derive(Parser, Debug)]
#[command(version, about = "Queue signed transactions with relayd")]
struct Args {
    /// Socket of the daemon, defaults to the one in the relay settings
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Hex transactions or files of them
    #[arg(required = true)]
    inputs: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let socket = match args.socket {
        Some(socket) => socket,
        None => RelaySettings::load()?.session.socket_path(),
    };
    let client = SocketClient::new(&socket);
    let sources = default_sources();

    for input in &args.inputs {
        for raw in load_transactions(&sources, input)? {
            let hash = client
                .submit(&raw)
                .await
                .wrap_err_with(|| format!("Failed to submit via {socket:?}"))?;
            println!("{hash:?}");
        }
    }
    Ok(())
}
