//! Minimal RTMP streaming server.
//!
//! Publish with:
//!   ffmpeg -re -i input.mp4 -c:v libx264 -c:a aac -f flv rtmp://localhost/live/test
//!
//! Play with:
//!   ffplay rtmp://localhost/live/test

use rtmp_live::{RtmpServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtmp_live=info".parse()?),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:1935".to_string())
        .parse()?;

    let server = RtmpServer::new(ServerConfig::with_addr(addr));
    println!("RTMP server listening on rtmp://{}", addr);

    server.run_until(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    Ok(())
}
