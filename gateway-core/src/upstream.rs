//! Upstream node selection: an external collaborator (spec.md 1, 6). This
//! core only consumes the result -- load balancing and health checking live
//! in the host gateway.

use async_trait::async_trait;
use derive_more::{Display, Error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamScheme {
    Http,
    Https,
    Ws,
    Wss,
}

#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub scheme: UpstreamScheme,
    pub host: String,
    pub port: u16,
    pub read_timeout: std::time::Duration,
}

impl UpstreamTarget {
    pub fn http_url(&self, path_and_query: &str) -> String {
        let scheme = match self.scheme {
            UpstreamScheme::Http => "http",
            UpstreamScheme::Https => "https",
            UpstreamScheme::Ws => "ws",
            UpstreamScheme::Wss => "wss",
        };
        format!("{scheme}://{}:{}{path_and_query}", self.host, self.port)
    }

    pub fn as_websocket(&self) -> UpstreamTarget {
        let scheme = match self.scheme {
            UpstreamScheme::Http => UpstreamScheme::Ws,
            UpstreamScheme::Https => UpstreamScheme::Wss,
            other => other,
        };
        UpstreamTarget {
            scheme,
            host: self.host.clone(),
            port: self.port,
            read_timeout: self.read_timeout,
        }
    }
}

#[derive(Debug, Display, Error)]
#[display(fmt = "no healthy upstream for network {network}")]
pub struct NoUpstreamAvailable {
    pub network: String,
}

/// Given the route and network, returns `(scheme, host, port)` for the next
/// forward. Load balancing, health checks, and connection pooling toward
/// the upstream are this trait implementor's problem, not the core's.
#[async_trait]
pub trait UpstreamPicker: Send + Sync {
    async fn pick(&self, route_id: &str, network: &str) -> Result<UpstreamTarget, NoUpstreamAvailable>;
}
