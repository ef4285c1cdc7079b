use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tokio::time::Instant;
use tracing::{debug, instrument};

use slackline_core::ResolveError;

/// Host-to-address lookup.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Addresses for hosts that need no lookup: IP literals and `localhost`.
pub fn literal_addrs(host: &str) -> Option<Vec<IpAddr>> {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Some(vec![ip]);
    }
    if trimmed.eq_ignore_ascii_case("localhost") {
        return Some(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    }
    None
}

/// Resolves through the operating system's configured resolver.
#[derive(Clone, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if let Some(addrs) = literal_addrs(host) {
            return Ok(addrs);
        }
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| ResolveError::Io {
                host: host.to_string(),
                reason: e.to_string(),
            })?
            .map(|addr| addr.ip())
            .collect();
        if addrs.is_empty() {
            return Err(ResolveError::NotFound {
                host: host.to_string(),
            });
        }
        Ok(addrs)
    }
}

struct CacheEntry {
    addrs: Vec<IpAddr>,
    expires_at: Instant,
}

/// Caches successful lookups of an inner resolver for a fixed TTL.
///
/// Failures are not cached.
pub struct CachingResolver {
    inner: Arc<dyn Resolver>,
    ttl: Duration,
    entries: DashMap<String, CacheEntry>,
}

impl CachingResolver {
    pub fn new(inner: Arc<dyn Resolver>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Number of hosts currently cached, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl Resolver for CachingResolver {
    #[instrument(skip(self), level = "debug")]
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let key = host.to_ascii_lowercase();
        if let Some(entry) = self.entries.get(&key) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.addrs.clone());
            }
        }

        let addrs = self.inner.resolve(host).await?;
        debug!(host, count = addrs.len(), "resolved host");
        let _ = self.entries.insert(
            key,
            CacheEntry {
                addrs: addrs.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(addrs)
    }
}

/// Plugs a [`Resolver`] into reqwest's connector.
pub(crate) struct ReqwestResolver(pub(crate) Arc<dyn Resolver>);

impl Resolve for ReqwestResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = Arc::clone(&self.0);
        Box::pin(async move {
            let addrs = resolver.resolve(name.as_str()).await?;
            let addrs: Addrs = Box::new(addrs.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok::<Addrs, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}
