use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use chatter_sdk::auth::{AuthProvider, MemoryTokenStore, SessionAuth};
use chatter_sdk::stream::client::{ConnectionState, StreamEventClient};
use chatter_sdk::stream::event::EventKind;
use chatter_sdk::stream::transport::HttpEventSource;
use secrecy::SecretString;

fn main() -> Result<(), Box<dyn Error>> {
    let session_token = "REPLACE_WITH_SESSION_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let auth = SessionAuth::new(Arc::new(MemoryTokenStore::new()));
        auth.store_token(
            &SecretString::new(session_token),
            Duration::from_secs(3600),
        );

        let transport = HttpEventSource::new()?;
        let client =
            StreamEventClient::new(Arc::new(auth) as Arc<dyn AuthProvider>, Arc::new(transport));

        let _ready = client.on(EventKind::ConnectionEstablished, |_event| {
            println!("stream connected");
        });
        let _chunks = client.on(EventKind::ChatMessageChunk, |event| {
            if let Some(content) = event.data.get("content").and_then(|v| v.as_str()) {
                print!("{content}");
            }
        });
        let _workflows = client.on(EventKind::WorkflowStatus, |event| {
            println!("workflow update: {}", event.data);
        });

        client.connect();

        loop {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let stats = client.connection_stats();
            println!(
                "connected={} events={} reconnect_attempts={}",
                stats.is_connected, stats.event_count, stats.reconnect_attempts
            );
            if client.state() == ConnectionState::Closed {
                // Retries exhausted; stop polling.
                break;
            }
        }

        client.disconnect();
        Ok(())
    })
}
