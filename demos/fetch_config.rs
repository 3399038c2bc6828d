use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use chatter_sdk::api::ChatterApiClient;
use chatter_sdk::auth::{AuthProvider, MemoryTokenStore, SessionAuth};
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

        let client = ChatterApiClient::new(Arc::new(auth) as Arc<dyn AuthProvider>)?;

        client.health().await?;
        let config = client.server_config().await?;
        println!("server version: {}", config.version);
        println!("features: {:?}", config.features);
        if let Some(path) = config.events_stream_path {
            println!("events stream path: {path}");
        }

        Ok(())
    })
}
