//! Cross-cutting wrappers applied around every provider at registration time.
//!
//! Grounded on `server.rs`'s existing per-call `tracing::info!`/`warn!` spans
//! around tool dispatch — generalized here into a `Provider -> Provider`
//! chain so the same logging/metrics/auth/timeout behavior applies uniformly
//! whichever transport a call comes in through, instead of being duplicated
//! at each transport's call site.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::MiddlewareConfig;
use crate::errors::ToolError;
use crate::providers::{Provider, ProviderContext, ProviderRequest, ProviderResponse, ToolDescriptor};

/// Build the `wrap` closure passed to `ProviderRegistry::new`, applying every
/// middleware named in `config.chain` in order — the first name in the list
/// ends up outermost, so it sees a call before anything else in the chain.
pub fn build_chain(config: &MiddlewareConfig) -> impl Fn(Arc<dyn Provider>) -> Arc<dyn Provider> {
    let config = config.clone();
    move |provider: Arc<dyn Provider>| {
        let mut wrapped = provider;
        for name in config.chain.iter().rev() {
            wrapped = match name.as_str() {
                "logging" => Arc::new(LoggingMiddleware { inner: wrapped }),
                "metrics" => Arc::new(MetricsMiddleware { inner: wrapped }),
                "auth" => Arc::new(AuthMiddleware {
                    inner: wrapped,
                    token: config.auth_token.clone(),
                }),
                "timeout" => Arc::new(TimeoutMiddleware {
                    inner: wrapped,
                    timeout: config.call_timeout,
                }),
                other => {
                    warn!(middleware = other, "unknown middleware name in chain, ignoring");
                    wrapped
                }
            };
        }
        wrapped
    }
}

struct LoggingMiddleware {
    inner: Arc<dyn Provider>,
}

#[async_trait]
impl Provider for LoggingMiddleware {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn enabled(&self, ctx: &ProviderContext) -> bool {
        self.inner.enabled(ctx)
    }

    fn tool(&self) -> ToolDescriptor {
        self.inner.tool()
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let name = self.inner.name();
        info!(provider = name, "dispatching");
        let result = self.inner.handle(ctx, req).await;
        match &result {
            Ok(_) => info!(provider = name, "completed"),
            Err(e) => warn!(provider = name, code = %e.code, message = %e.message, "failed"),
        }
        result
    }
}

struct MetricsMiddleware {
    inner: Arc<dyn Provider>,
}

#[async_trait]
impl Provider for MetricsMiddleware {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn enabled(&self, ctx: &ProviderContext) -> bool {
        self.inner.enabled(ctx)
    }

    fn tool(&self) -> ToolDescriptor {
        self.inner.tool()
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let start = Instant::now();
        let result = self.inner.handle(ctx, req).await;
        ctx.tracker
            .record(self.inner.name(), "provider", start.elapsed(), result.is_ok());
        result
    }
}

struct AuthMiddleware {
    inner: Arc<dyn Provider>,
    token: Option<String>,
}

#[async_trait]
impl Provider for AuthMiddleware {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn enabled(&self, ctx: &ProviderContext) -> bool {
        self.inner.enabled(ctx)
    }

    fn tool(&self) -> ToolDescriptor {
        self.inner.tool()
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        if let Some(expected) = &self.token {
            let provided_ok = req.auth_token.as_deref() == Some(expected.as_str());
            if !provided_ok {
                return Err(ToolError::validation_input("missing or invalid bearer token")
                    .with_op(self.inner.name()));
            }
        }
        self.inner.handle(ctx, req).await
    }
}

struct TimeoutMiddleware {
    inner: Arc<dyn Provider>,
    timeout: Duration,
}

#[async_trait]
impl Provider for TimeoutMiddleware {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn enabled(&self, ctx: &ProviderContext) -> bool {
        self.inner.enabled(ctx)
    }

    fn tool(&self) -> ToolDescriptor {
        self.inner.tool()
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let name = self.inner.name().to_string();
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.inner.handle(ctx, req)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::timeout(format!(
                "provider '{name}' did not complete within {timeout:?}"
            ))
            .with_op(name)),
        }
    }
}
