use std::{net::SocketAddr, time::Instant};

use futures::{AsyncReadExt, AsyncWriteExt};
use meshwire::core::{Keypair, PeerId};
use meshwire::{Host, noise, pnet, yamux};

const ECHO: &str = "/echo/1.0.0";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:8088".to_owned())
        .parse::<SocketAddr>()?;
    let peer = args.next().map(|p| p.parse::<PeerId>()).transpose()?;

    let keypair = Keypair::generate();
    let mut builder = Host::builder(keypair.clone())
        .encrypter(noise::Config::new(keypair)?)
        .muxer(yamux::Config::new());
    if let Ok(path) = std::env::var("MESHWIRE_SWARM_KEY") {
        let key: pnet::PreSharedKey = std::fs::read_to_string(path)?.parse()?;
        builder = builder.protector(pnet::PnetConfig::new(key));
    }
    let host = builder.build()?;

    let connection = host.dial(addr, peer).await?;
    tracing::info!(peer=%connection.remote_peer(), addr=%addr, "Connected");

    for i in 0..10 {
        let mut stream = connection.new_stream([ECHO]).await?;
        let message = format!("hello there! #{i}");
        let started = Instant::now();
        stream.write_all(message.as_bytes()).await?;
        stream.flush().await?;
        let mut reply = vec![0; message.len()];
        stream.read_exact(&mut reply).await?;
        tracing::info!(
            stream=%stream.id(),
            rtt=?started.elapsed(),
            "Echoed: {}",
            String::from_utf8_lossy(&reply)
        );
        stream.close().await?;
    }

    host.stop().await;
    Ok(())
}
