//! Configuration and credential bundle fingerprinting.
//!
//! Drift detection never stores bundle contents, only a digest: SHA-256 over
//! each relevant key's value, keys sorted lexicographically, hex digests
//! concatenated in that order. Two bundles are considered equal iff their
//! digests are equal.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::client::Client;
use sha2::{Digest, Sha256};
use tokio::time::timeout;

use lodestone_core::Error;

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// Keys excluded from configuration-bundle fingerprints.
///
/// The rendered index-settings payload changes with every topology
/// calculation and must not trigger node restarts.
pub const VOLATILE_CONFIG_KEYS: &[&str] = &["index_settings"];

/// The raw key/value contents of a configuration or credential bundle.
pub type BundleData = BTreeMap<String, Vec<u8>>;

/// A named store of configuration or credential bundles.
#[async_trait]
pub trait BundleSource: Send + Sync {
    /// Fetch the current contents of the named bundle, `None` if absent.
    async fn fetch(&self, name: &str, namespace: &str) -> Result<Option<BundleData>, Error>;
}

/// Compute the digest of the given bundle contents.
///
/// Iteration-order independent: the underlying map is keyed in sorted order,
/// so identical contents always produce identical output.
pub fn fingerprint(bundle: &BundleData, volatile_keys: &[&str]) -> String {
    let mut digest = String::new();
    for (key, value) in bundle {
        if volatile_keys.contains(&key.as_str()) {
            continue;
        }
        let mut hasher = Sha256::new();
        hasher.update(value);
        digest.push_str(&format!("{:x}", hasher.finalize()));
    }
    digest
}

/// Fetch the named bundle and compute its fingerprint.
///
/// A missing bundle yields the empty digest, which callers treat as
/// "unknown, assume unchanged" on first encounter.
pub async fn fetch_fingerprint(source: &dyn BundleSource, name: &str, namespace: &str, volatile_keys: &[&str]) -> Result<String, Error> {
    let bundle = source.fetch(name, namespace).await?;
    Ok(bundle.map(|data| fingerprint(&data, volatile_keys)).unwrap_or_default())
}

/// Configuration bundles backed by K8s ConfigMaps.
#[derive(Clone)]
pub struct ConfigMapBundles {
    client: Client,
}

impl ConfigMapBundles {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BundleSource for ConfigMapBundles {
    async fn fetch(&self, name: &str, namespace: &str) -> Result<Option<BundleData>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = match timeout(API_TIMEOUT, api.get(name)).await {
            Ok(Ok(cm)) => cm,
            Ok(Err(kube::Error::Api(api_err))) if api_err.code == http::StatusCode::NOT_FOUND => return Ok(None),
            Ok(Err(err)) => return Err(bundle_err(name, namespace, anyhow!(err).context("error fetching configuration bundle"))),
            Err(_elapsed) => return Err(bundle_err(name, namespace, anyhow!("timeout while fetching configuration bundle"))),
        };
        let mut data: BundleData = Default::default();
        for (key, value) in cm.data.unwrap_or_default() {
            data.insert(key, value.into_bytes());
        }
        for (key, value) in cm.binary_data.unwrap_or_default() {
            data.insert(key, value.0);
        }
        Ok(Some(data))
    }
}

/// Credential bundles backed by K8s Secrets.
#[derive(Clone)]
pub struct SecretBundles {
    client: Client,
}

impl SecretBundles {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BundleSource for SecretBundles {
    async fn fetch(&self, name: &str, namespace: &str) -> Result<Option<BundleData>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = match timeout(API_TIMEOUT, api.get(name)).await {
            Ok(Ok(secret)) => secret,
            Ok(Err(kube::Error::Api(api_err))) if api_err.code == http::StatusCode::NOT_FOUND => return Ok(None),
            Ok(Err(err)) => return Err(bundle_err(name, namespace, anyhow!(err).context("error fetching credential bundle"))),
            Err(_elapsed) => return Err(bundle_err(name, namespace, anyhow!("timeout while fetching credential bundle"))),
        };
        let data = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.0))
            .collect();
        Ok(Some(data))
    }
}

fn bundle_err(name: &str, namespace: &str, source: anyhow::Error) -> Error {
    Error::Backend {
        name: name.to_string(),
        namespace: namespace.to_string(),
        source,
    }
}
