//! Domain Client (C1, spec.md §4.5): resolves region -> websocket URL,
//! caching the REST-provided `{domain, hostname}` pair with a TTL and
//! single-flight refresh, retrying indefinitely with exponential backoff on
//! failure (spec.md §1 non-goal: the REST provisioning API itself is an
//! external collaborator — this module only speaks its one contract).

use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::errors::{CoreError, CoreResult};
use crate::ids::{Bucket, Region};

const CACHE_TTL: Duration = Duration::from_secs(10 * 60);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Deserialize)]
struct ProvisioningSettings {
    hostname: String,
    domain: String,
}

struct Cached {
    settings: ProvisioningSettings,
    fetched_at: Instant,
}

/// Resolves `region -> websocket URL` via the provisioning REST API's
/// `{hostname, domain}` contract (spec.md §4.5, §6 REST provisioning API).
pub struct DomainClient {
    http: reqwest::Client,
    provisioning_url: Url,
    auth_token: String,
    cache: Mutex<Option<Cached>>,
    refresh_lock: AsyncMutex<()>,
}

impl DomainClient {
    pub fn new(http: reqwest::Client, provisioning_url: Url, auth_token: String) -> Self {
        Self {
            http,
            provisioning_url,
            auth_token,
            cache: Mutex::new(None),
            refresh_lock: AsyncMutex::new(()),
        }
    }

    /// `getSettings()`: single-flight, TTL-cached, infinitely retried with
    /// exponential backoff (1s doubling, capped 300s; reset on success).
    pub async fn get_settings(&self) -> ProvisioningSettingsHandle {
        if let Some(cached) = self.cache.lock().as_ref() {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                return ProvisioningSettingsHandle(cached.settings.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;

        if let Some(cached) = self.cache.lock().as_ref() {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                return ProvisioningSettingsHandle(cached.settings.clone());
            }
        }

        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.fetch_settings().await {
                Ok(settings) => {
                    *self.cache.lock() = Some(Cached {
                        settings: settings.clone(),
                        fetched_at: Instant::now(),
                    });
                    return ProvisioningSettingsHandle(settings);
                }
                Err(err) => {
                    warn!(error = %err, ?backoff, "provisioning settings fetch failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn fetch_settings(&self) -> CoreResult<ProvisioningSettings> {
        let response = self
            .http
            .get(self.provisioning_url.clone())
            .header("auth-token", &self.auth_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CoreError::internal(format!(
                "provisioning API returned {}",
                response.status()
            )));
        }

        let settings = response.json::<ProvisioningSettings>().await?;
        debug!(hostname = %settings.hostname, domain = %settings.domain, "refreshed provisioning settings");
        Ok(settings)
    }

    /// `getUrl(host, region)`, specialized to the websocket path this core
    /// always connects to (spec.md §6: "Path component is `/ws`").
    pub async fn get_url(&self, region: &Region, bucket: Bucket) -> CoreResult<Url> {
        let settings = self.get_settings().await.0;
        let raw = format!(
            "https://{}.{}-{}.{}/ws",
            settings.hostname,
            region,
            bucket.as_region_suffix(),
            settings.domain
        );
        Url::parse(&raw).map_err(CoreError::from)
    }
}

/// Thin wrapper so `get_settings` doesn't leak the private response struct.
pub struct ProvisioningSettingsHandle(ProvisioningSettings);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_synthesis_matches_spec_template() {
        let settings = ProvisioningSettings {
            hostname: "mt-client-api-v1".into(),
            domain: "agiliumtrade.agiliumtrade.ai".into(),
        };

        let raw = format!(
            "https://{}.{}-{}.{}/ws",
            settings.hostname,
            Region::from("vint-hill"),
            Bucket::One.as_region_suffix(),
            settings.domain
        );

        assert_eq!(raw, "https://mt-client-api-v1.vint-hill-b.agiliumtrade.agiliumtrade.ai/ws");
    }
}
