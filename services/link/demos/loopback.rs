//! Client and server link in one process.
//!
//! Run with `cargo run --example loopback`; set `LINK_PORT` to pick the port.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use redb_link::{
    CommError, Connection, ConnectionConfig, ConnectionContext, ConnectionListener, ConnectionMode, Message,
    MessageType,
};

const DEMO_PORT: u16 = 10102;

#[derive(Debug)]
struct Forward {
    events: mpsc::UnboundedSender<(String, Option<Message>)>,
}

impl ConnectionListener for Forward {
    fn connected(&self, context: &ConnectionContext) {
        info!(component = "demo", "{} connected", context.name);
        let _ = self.events.send((context.name.clone(), None));
    }

    fn disconnected(&self, context: &ConnectionContext) {
        info!(component = "demo", "{} disconnected", context.name);
    }

    fn error(&self, context: &ConnectionContext, error: &CommError) {
        warn!(component = "demo", "{} reported {}", context.name, error);
    }

    fn received(&self, context: &ConnectionContext, message: Message) {
        info!(component = "demo", "{} received {}", context.name, message);
        let _ = self.events.send((context.name.clone(), Some(message)));
    }
}

fn context(mode: ConnectionMode, name: &str) -> anyhow::Result<ConnectionContext> {
    let mut config = ConnectionConfig::default();
    config.set("host", "127.0.0.1")?;
    config.set("port", &DEMO_PORT.to_string())?;
    config.set("name", name)?;
    config.set("mode", &mode.to_string())?;
    config.set("calling.tsap", "DEMO")?;
    config.set("called.tsap", "LINK")?;
    config.set("timeout.millis", "5000")?;
    config.apply_environment_overrides();
    Ok(config.build()?)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    redb_link::logging::init_logging("link-demo", "info")?;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let listener = Arc::new(Forward { events: events_tx });

    let server = Connection::new(context(ConnectionMode::Server, "server")?, listener.clone());
    let client = Connection::new(context(ConnectionMode::Client, "client")?, listener);

    server.connect().await;
    client.connect().await;

    let mut connected = 0;
    while connected < 2 {
        match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
            Ok(Some((_, None))) => connected += 1,
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => anyhow::bail!("link did not come up"),
        }
    }

    let kind = MessageType::new("PR")?;
    for content in ["1", "22", "333"] {
        client.send(Message::new(kind, content)).await;
    }
    server.send(Message::new(MessageType::new("RS")?, "OK")).await;

    let mut received = 0;
    while received < 4 {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some((name, Some(message)))) => {
                println!("{:>6} <- {}", name, message);
                received += 1;
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => anyhow::bail!("messages went missing"),
        }
    }

    client.disconnect().await;
    // Let the acknowledgements and the remote close settle before stopping the server
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.disconnect().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
