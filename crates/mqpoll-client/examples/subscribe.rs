//! Callback subscribe example.
//!
//! Run with: cargo run -p mqpoll-client --example subscribe -- <filter> [qos]
//!
//! Messages are printed from the dispatch thread until the connection drops
//! or the process is interrupted.

use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use mqpoll_client::{logging, Client, ClientError, DeliveredMessage, MqttHandler, QoS, Settings};

/// Prints messages and tells main when the connection is gone.
struct Printer {
    count: usize,
    lost: Sender<String>,
}

impl MqttHandler for Printer {
    fn message_arrived(&mut self, message: &DeliveredMessage) -> bool {
        self.count += 1;
        println!(
            "[{}] {} -> {} (QoS={:?}, retained={})",
            self.count,
            message.topic,
            String::from_utf8_lossy(&message.payload),
            message.qos,
            message.retained
        );
        true
    }

    fn connection_lost(&mut self, cause: &ClientError) {
        let _ = self.lost.send(cause.to_string());
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let filter = args.next().unwrap_or_else(|| "mqpoll/#".to_string());
    let qos = match args.next().as_deref() {
        Some("0") => QoS::AtMostOnce,
        Some("2") => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    };

    let settings = Settings::load("mqpoll.toml")?;
    logging::init(&settings.log.clone().with_trace_env())?;

    let (lost_tx, lost_rx) = unbounded();
    let client = Client::new(&settings.connection.server_uri, &settings.connection.client_id)?;
    client.set_handler(Printer {
        count: 0,
        lost: lost_tx,
    })?;
    client.connect(&settings.connect_options()?)?;

    let granted = client.subscribe(&filter, qos)?;
    println!("Subscribed to {}: {:?}", filter, granted);

    // Block until the broker goes away.
    let cause = lost_rx.recv()?;
    println!("Connection lost: {}", cause);

    client.disconnect(Duration::ZERO)?;
    Ok(())
}
