//! Connects to a game server and logs every push event it sends.
//!
//! ```text
//! notify-tail <ws-url> [config.json]
//! ```
//!
//! Only `.lq.ActionPrototype` is known out of the box, so other Notify
//! types show up in the log as dropped unknown schemas.

use mjwire::prelude::*;
use mjwire::protocol::ActionPrototype;

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    mjwire::logging::init("info");

    let mut args = std::env::args().skip(1);
    let Some(addr) = args.next() else {
        eprintln!("usage: notify-tail <ws-url> [config.json]");
        std::process::exit(2);
    };
    let mut config = match args.next() {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig::default(),
    };
    if config.subscriber_capacity == 0 {
        config.subscriber_capacity = DEFAULT_SUBSCRIBER_CAPACITY;
    }

    let client = ClientBuilder::new().config(config).build(WebSocketConnector)?;
    let mut events = client
        .notifications()
        .ok_or("subscriber queue not configured")?;
    client.connect(&addr).await?;
    tracing::info!(%addr, "tailing push events, ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(PushEvent::Notify(notify)) => {
                    match notify.downcast_ref::<ActionPrototype>() {
                        Some(action) => tracing::info!(
                            step = action.step,
                            action = %action.name,
                            bytes = action.data.len(),
                            "action"
                        ),
                        None => tracing::info!(name = notify.name(), "notify"),
                    }
                }
                Some(PushEvent::Action(action)) => {
                    tracing::info!(step = action.step, name = action.name(), "decoded action");
                }
                None => break,
            },
        }
    }

    client.close().await;
    Ok(())
}
