//! Remote profile lookup over HTTP and the network-availability switch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_engine::{LookupError, LookupFuture, NetworkMonitor, ProfileLookup, RemoteProfile};

/// `GET {base_url}/profiles/{id}`, successful answers cached for the process.
#[derive(Clone)]
pub struct HttpProfileLookup {
    client: reqwest::Client,
    base_url: String,
    cache: Arc<Mutex<HashMap<String, RemoteProfile>>>,
}

impl HttpProfileLookup {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cached(&self, hex_id: &str) -> Option<RemoteProfile> {
        self.cache.lock().ok()?.get(hex_id).cloned()
    }

    async fn fetch(&self, hex_id: String) -> Result<RemoteProfile, LookupError> {
        if let Some(hit) = self.cached(&hex_id) {
            return Ok(hit);
        }
        let url = format!("{}/profiles/{}", self.base_url, hex_id);
        let resp = self.client.get(&url).send().await.map_err(classify)?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(LookupError::NotFound);
        }
        if !status.is_success() {
            return Err(LookupError::Request(status.as_u16()));
        }
        let body = resp.bytes().await.map_err(classify)?;
        let profile: RemoteProfile =
            serde_json::from_slice(&body).map_err(|e| LookupError::Decode(e.to_string()))?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(hex_id, profile.clone());
        }
        Ok(profile)
    }
}

fn classify(e: reqwest::Error) -> LookupError {
    if e.is_connect() || e.is_timeout() {
        LookupError::Unavailable(e.to_string())
    } else if e.is_decode() {
        LookupError::Decode(e.to_string())
    } else {
        LookupError::Request(e.status().map(|s| s.as_u16()).unwrap_or(0))
    }
}

impl ProfileLookup for HttpProfileLookup {
    fn lookup(&self, hex_id: &str) -> LookupFuture {
        let this = self.clone();
        let hex_id = hex_id.to_ascii_uppercase();
        Box::pin(async move { this.fetch(hex_id).await })
    }
}

/// Network availability as a switch flipped by whoever watches the link.
#[derive(Debug, Default)]
pub struct NetworkStatus {
    available: AtomicBool,
}

impl NetworkStatus {
    pub fn new(available: bool) -> Self {
        Self {
            available: AtomicBool::new(available),
        }
    }

    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::Relaxed);
        if was != available {
            tracing::info!(available, "network: availability changed");
        }
    }
}

impl NetworkMonitor for NetworkStatus {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }
}
