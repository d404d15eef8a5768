// src/server/state.rs

//! The shared state every request handler sees: configuration, the cache,
//! the coalescer, and one set of engines per origin.

use crate::config::{Config, HandlerKind, OriginConfig};
use crate::core::cache::Cache;
use crate::core::origins::prometheus::PrometheusClient;
use crate::core::proxy::{
    DeltaProxyCache, Engine, EngineResponse, HttpProxy, HttpUpstream, ObjectProxyCache,
    ProxyRequest, RequestCoalescer, RequestContext, Upstream, record_request,
};
use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

/// The engines serving a single origin.
pub struct OriginRuntime {
    pub config: OriginConfig,
    upstream: Arc<dyn Upstream>,
    http_proxy: Arc<HttpProxy>,
    object_cache: ObjectProxyCache,
    delta_cache: DeltaProxyCache<PrometheusClient>,
}

impl OriginRuntime {
    fn new(
        config: OriginConfig,
        cache: Arc<dyn Cache>,
        coalescer: Arc<RequestCoalescer>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        let http_proxy = Arc::new(HttpProxy::new(cache.configuration().max_object_size_bytes));
        let object_cache =
            ObjectProxyCache::new(cache.clone(), coalescer.clone(), upstream.clone());
        let delta_cache = DeltaProxyCache::new(
            Arc::new(PrometheusClient::new()),
            cache,
            coalescer,
            upstream.clone(),
            http_proxy.clone(),
        );
        Self {
            config,
            upstream,
            http_proxy,
            object_cache,
            delta_cache,
        }
    }

    /// Maps an origin-relative path and query onto the origin's URL.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.config.origin_url.clone();
        let joined = format!("{}{}", url.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        url.set_query(query);
        url
    }

    /// Dispatches `req` to the engine configured for `path`.
    pub async fn serve(&self, req: ProxyRequest, path: &str) -> EngineResponse {
        let Some(path_config) = self.config.find_path(path) else {
            return self.proxy(req).await;
        };
        let ctx = RequestContext::new(&self.config, path_config);
        match path_config.handler {
            HandlerKind::Proxy => self.proxy(req).await,
            HandlerKind::ProxyCache => self.object_cache.fetch(req, ctx, None, false).await,
            HandlerKind::DeltaProxyCache => self.delta_cache.fetch(req, ctx).await,
        }
    }

    async fn proxy(&self, req: ProxyRequest) -> EngineResponse {
        let started = Instant::now();
        let response = self.http_proxy.proxy(self.upstream.as_ref(), req).await;
        record_request(
            &self.config.name,
            Engine::HttpProxy,
            &response,
            started.elapsed(),
        );
        response
    }
}

pub struct ServerState {
    pub config: Config,
    pub cache: Arc<dyn Cache>,
    pub coalescer: Arc<RequestCoalescer>,
    origins: HashMap<String, OriginRuntime>,
    default_origin: Option<String>,
}

impl ServerState {
    /// Builds the state with a real HTTP client per origin.
    pub fn new(config: Config, cache: Arc<dyn Cache>) -> Result<Self> {
        let mut upstreams: HashMap<String, Arc<dyn Upstream>> = HashMap::new();
        for origin in &config.origins {
            let upstream = HttpUpstream::new(origin.timeout).with_context(|| {
                format!("Failed to build HTTP client for origin '{}'", origin.name)
            })?;
            upstreams.insert(origin.name.clone(), Arc::new(upstream));
        }
        Self::with_upstreams(config, cache, upstreams)
    }

    /// Builds the state with caller-supplied upstreams keyed by origin name.
    pub fn with_upstreams(
        config: Config,
        cache: Arc<dyn Cache>,
        mut upstreams: HashMap<String, Arc<dyn Upstream>>,
    ) -> Result<Self> {
        let coalescer = Arc::new(RequestCoalescer::new());
        let mut origins = HashMap::new();
        for origin in &config.origins {
            let upstream = upstreams
                .remove(&origin.name)
                .ok_or_else(|| anyhow!("no upstream supplied for origin '{}'", origin.name))?;
            let runtime =
                OriginRuntime::new(origin.clone(), cache.clone(), coalescer.clone(), upstream);
            origins.insert(origin.name.clone(), runtime);
        }
        let default_origin = config.default_origin().map(|o| o.name.clone());
        Ok(Self {
            config,
            cache,
            coalescer,
            origins,
            default_origin,
        })
    }

    /// Picks the origin for a request path.
    ///
    /// `/<origin-name>/rest` selects that origin with `/rest` as the
    /// origin-relative path; any other path goes to the default origin as is.
    pub fn route<'a>(&'a self, path: &str) -> Option<(&'a OriginRuntime, String)> {
        let trimmed = path.trim_start_matches('/');
        let (first, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
        if let Some(origin) = self.origins.get(first) {
            return Some((origin, format!("/{rest}")));
        }
        let default = self.default_origin.as_ref()?;
        self.origins
            .get(default)
            .map(|origin| (origin, path.to_string()))
    }
}
