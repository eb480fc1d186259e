//! Synchronous publish example.
//!
//! Run with: cargo run -p mqpoll-client --example publish -- <topic> <message> [qos]
//!
//! Connection settings come from `mqpoll.toml` (if present) and `MQPOLL__*`
//! environment variables, e.g. `MQPOLL__CONNECTION__SERVER_URI=tcp://broker:1883`.

use std::time::Duration;

use mqpoll_client::{logging, Client, QoS, Settings};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let topic = args.next().unwrap_or_else(|| "mqpoll/example".to_string());
    let message = args.next().unwrap_or_else(|| "Hello from mqpoll!".to_string());
    let qos = match args.next().as_deref() {
        Some("0") => QoS::AtMostOnce,
        Some("2") => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    };

    let settings = Settings::load("mqpoll.toml")?;
    logging::init(&settings.log.clone().with_trace_env())?;

    let client = Client::new(&settings.connection.server_uri, &settings.connection.client_id)?;
    println!("Connecting to {}...", client.server_uri());
    client.connect(&settings.connect_options()?)?;

    match client.publish(&topic, message, qos, false)? {
        Some(token) => {
            client.wait_for_completion(token, Duration::from_secs(10))?;
            println!("Delivered {:?} to {} (token {})", qos, topic, token);
        }
        None => println!("Sent to {}", topic),
    }

    client.disconnect(Duration::from_secs(1))?;
    Ok(())
}
