use std::net::SocketAddr;

use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
use meshwire::core::{IncomingStream, Keypair};
use meshwire::{Host, HostEvent, noise, pnet, yamux};

const ECHO: &str = "/echo/1.0.0";

async fn echo(incoming: IncomingStream) {
    let IncomingStream {
        connection,
        mut stream,
        ..
    } = incoming;
    let peer = connection.remote_peer();
    tracing::info!(peer=%peer, stream=%stream.id(), "Echo stream opened");
    let mut buf = vec![0; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() || stream.flush().await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(peer=%peer, "Read error: {}", e);
                break;
            }
        }
    }
    tracing::info!(peer=%peer, "Echo stream closed");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:8088".to_owned())
        .parse::<SocketAddr>()?;

    let keypair = Keypair::generate();
    let mut builder = Host::builder(keypair.clone())
        .encrypter(noise::Config::new(keypair)?)
        .muxer(yamux::Config::new());
    // A swarm key file makes this a private network.
    if let Ok(path) = std::env::var("MESHWIRE_SWARM_KEY") {
        let key: pnet::PreSharedKey = std::fs::read_to_string(path)?.parse()?;
        builder = builder.protector(pnet::PnetConfig::new(key));
    }
    let host = builder.build()?;
    host.handle([ECHO], echo)?;

    let bound = host.listen(addr).await?;
    tracing::info!(peer=%host.local_peer(), addr=%bound, "Echo server listening");

    let mut events = host.events();
    loop {
        tokio::select! {
            Some(event) = events.next() => match event {
                HostEvent::PeerConnect(peer) => tracing::info!(peer=%peer, "Peer connected"),
                HostEvent::PeerDisconnect(peer) => tracing::info!(peer=%peer, "Peer disconnected"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    host.stop().await;
    tracing::info!("TCP Echo Example completed");
    Ok(())
}
