//! Two-process bring-up demo over a TCP control channel.
//!
//! With `IBLINK_PEER=<host:port>` set, connects to a waiting peer and
//! plays the responder (the connecting side arms the receive slot);
//! otherwise listens on `IBLINK_LISTEN` (default `0.0.0.0:18515`) and
//! plays the initiator. All other tuning comes from the `IBLINK_*`
//! variables read by `BringupConfig::from_env`.

use iblink::verbs::sys::SysVerbs;
use iblink::{BringupConfig, Endpoint, Role};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = BringupConfig::from_env();

    let mut stream = match std::env::var("IBLINK_PEER") {
        Ok(peer) => {
            config.role = Role::Responder;
            tracing::info!(%peer, "connecting to control channel");
            TcpStream::connect(&peer)?
        }
        Err(_) => {
            config.role = Role::Initiator;
            let listen =
                std::env::var("IBLINK_LISTEN").unwrap_or_else(|_| "0.0.0.0:18515".to_string());
            let listener = TcpListener::bind(&listen)?;
            tracing::info!(%listen, "waiting for peer on control channel");
            let (stream, remote_addr) = listener.accept()?;
            tracing::info!(%remote_addr, "peer connected");
            stream
        }
    };
    stream.set_nodelay(true)?;

    let endpoint = Endpoint::bring_up(Arc::new(SysVerbs::new()), &config, &mut stream)?;

    tracing::info!(
        device = %endpoint.device_name(),
        state = %endpoint.state(),
        local = %endpoint.local_identity(),
        remote = %endpoint.remote_identity(),
        "bring-up complete; queue pair is ready to send"
    );

    Ok(())
}
