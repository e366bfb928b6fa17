//! One-shot probe: issue a single raw call through the proxy and dump the
//! merged reply. Deployment glue for smoke-testing a running proxy; carries
//! no schema, so it works against any method the proxy routes.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use http::uri::PathAndQuery;
use tonic::client::Grpc;
use tonic::transport::Endpoint;

use grpc_fanout::RawCodec;

#[derive(Parser, Debug)]
#[command(name = "probe-client")]
#[command(about = "Send one opaque frame through the proxy and dump the merged reply")]
struct Cli {
    /// Proxy endpoint
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    endpoint: String,

    /// Fully qualified method, e.g. /machine.Machine/Version
    #[arg(long)]
    method: String,

    /// UTF-8 payload to send as the single request frame
    #[arg(long, default_value = "")]
    payload: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let channel = Endpoint::from_shared(cli.endpoint.clone())
        .context("Invalid proxy endpoint")?
        .connect()
        .await
        .context("Failed to connect to proxy")?;

    let path: PathAndQuery = cli.method.parse().context("Invalid method path")?;

    let mut grpc = Grpc::new(channel);
    grpc.ready().await.context("Proxy not ready")?;

    let frames = tokio_stream::iter(vec![Bytes::from(cli.payload.into_bytes())]);
    let response = grpc
        .streaming(tonic::Request::new(frames), path, RawCodec)
        .await
        .map_err(|status| anyhow::anyhow!("Call failed: {status}"))?;

    let (metadata, mut stream, _extensions) = response.into_parts();
    println!("headers: {metadata:?}");

    let mut total = 0usize;
    while let Some(frame) = stream
        .message()
        .await
        .map_err(|status| anyhow::anyhow!("Stream error: {status}"))?
    {
        total += frame.len();
        println!("frame ({} bytes): {:?}", frame.len(), frame);
        if let Ok(text) = std::str::from_utf8(&frame) {
            println!("  utf8: {text}");
        }
    }

    if let Ok(Some(trailers)) = stream.trailers().await {
        println!("trailers: {trailers:?}");
    }
    println!("total: {total} bytes");

    Ok(())
}
