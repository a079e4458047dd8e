//! Disposable-domain list loader.
//!
//! Fetches the exact and wildcard datasets once at startup and hands the
//! parsed lists to the engine's oracle.

use anyhow::Context;
use std::time::Duration;
use tracing::info;

use checker_core::DomainList;

const INDEX_URL: &str =
    "https://raw.githubusercontent.com/tompec/disposable-email-domains/main/index.json";
const WILDCARD_URL: &str =
    "https://raw.githubusercontent.com/tompec/disposable-email-domains/main/wildcard.json";

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

async fn fetch(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("fetching {url}"))?;
    if !response.status().is_success() {
        anyhow::bail!("unexpected status {} from {url}", response.status());
    }
    Ok(response.text().await?)
}

/// Download and parse both disposable-domain lists.
pub async fn load_disposable_domains() -> anyhow::Result<DomainList> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .context("building http client")?;

    let index = fetch(&client, INDEX_URL).await.context("loading index")?;
    let wildcard = fetch(&client, WILDCARD_URL)
        .await
        .context("loading wildcards")?;

    let list = DomainList::from_json(&index, &wildcard)?;
    info!(domains = list.len(), "disposable domains loaded");
    Ok(list)
}
