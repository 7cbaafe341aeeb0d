use amqp_core::prelude::*;
use std::env;

/// Connects to a broker, opens one channel, and closes cleanly. Useful as
/// a smoke test against a real broker; CLI ergonomics beyond this are out
/// of scope for the core.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let host = env::args().nth(1).unwrap_or_else(|| "localhost".to_string());
    let port: u16 = env::args()
        .nth(2)
        .map(|p| p.parse().expect("port must be a number"))
        .unwrap_or(5672);

    println!("connecting to {host}:{port}");

    let mut connection = ConnectionBuilder::new()
        .login("guest")
        .password("guest")
        .virtual_host("/")
        .connect(&host, port)
        .await?;

    println!("connection {} open", connection.id());
    println!(
        "tuning: channel_max={} frame_max={} heartbeat={}",
        connection.channel_max(),
        connection.frame_max(),
        connection.heartbeat_interval()
    );

    let channel = connection.new_channel().await?;
    println!("opened channel {}", channel.id());
    channel.release().await;

    connection.close(false, None).await?;
    println!("connection closed");

    Ok(())
}
