//! Search-cluster membership checks.
//!
//! Rolling a node group is only safe once the replaced nodes have verifiably
//! rejoined the live cluster, and scaling one down is only safe once its
//! nodes have verifiably left. This module answers that single question.

use async_trait::async_trait;
use serde::Deserialize;

use lodestone_core::Error;

/// A client able to answer whether a node is currently a cluster member.
#[async_trait]
pub trait MembershipClient: Send + Sync {
    /// True if the named node is currently a member of the live cluster.
    async fn is_node_in_cluster(&self, node_name: &str) -> Result<bool, Error>;
}

/// Membership client speaking to the search cluster's HTTP endpoint.
pub struct HttpMembershipClient {
    http: reqwest::Client,
    base_url: String,
    cluster: String,
    namespace: String,
}

/// One row of the cluster's node catalog.
#[derive(Debug, Deserialize)]
struct CatNode {
    name: String,
}

impl HttpMembershipClient {
    /// Create a new instance addressing the given cluster's internal service.
    pub fn new(cluster: &str, namespace: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("http://{}.{}.svc:9200", cluster, namespace),
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl MembershipClient for HttpMembershipClient {
    async fn is_node_in_cluster(&self, node_name: &str) -> Result<bool, Error> {
        let url = format!("{}/_cat/nodes?format=json&h=name", self.base_url);
        let nodes: Vec<CatNode> = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(|err| self.membership_err(err.into()))?
            .json()
            .await
            .map_err(|err| self.membership_err(err.into()))?;
        // Node names are derived from pod names, which carry the group name
        // as their prefix.
        Ok(nodes.iter().any(|node| node.name.starts_with(node_name)))
    }
}

impl HttpMembershipClient {
    fn membership_err(&self, source: anyhow::Error) -> Error {
        Error::Backend {
            name: self.cluster.clone(),
            namespace: self.namespace.clone(),
            source,
        }
    }
}
