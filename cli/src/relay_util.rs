use anyhow::{Context, Result};
use nostr_sdk::prelude::*;

pub async fn connect_client(keys: &Keys, relay_urls: &[RelayUrl]) -> Result<Client> {
    let client = Client::new(keys.clone());
    for url in relay_urls {
        client
            .add_relay(url.clone())
            .await
            .with_context(|| format!("add relay {url}"))?;
    }
    client.connect().await;
    Ok(client)
}

pub fn parse_relay_urls(urls: &[String]) -> Result<Vec<RelayUrl>> {
    urls.iter()
        .map(|u| RelayUrl::parse(u.as_str()).with_context(|| format!("parse relay url: {u}")))
        .collect()
}
