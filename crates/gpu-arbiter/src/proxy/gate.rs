use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use error_stack::Report;
use error_stack::ResultExt;
use poem::http::Method;
use poem::http::StatusCode;
use poem::http::Uri;
use poem::Body;
use poem::Request;
use poem::Response;
use tokio::time::sleep;

use super::headers;
use super::relay;
use super::relay::ActivityRecorder;
use super::ProxyError;
use crate::arbiter::Arbiter;
use crate::classifier::is_gpu_intensive;
use crate::classifier::parse_body;

pub const DEFAULT_READ_SETTLE_DELAY: Duration = Duration::from_millis(2000);
pub const DEFAULT_WRITE_SETTLE_DELAY: Duration = Duration::from_millis(3500);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// `http://host:port` of the inference service, without a trailing slash
    pub upstream_base: String,
    /// Pause after preemption before forwarding GET/HEAD requests.
    pub read_settle_delay: Duration,
    /// Pause after preemption before forwarding POST requests.
    pub write_settle_delay: Duration,
    pub connect_timeout: Duration,
}

impl GateConfig {
    pub fn new(upstream_host: &str, upstream_port: u16) -> Self {
        // IPv6 literals need brackets in the authority
        let upstream_base = if upstream_host.contains(':') && !upstream_host.starts_with('[') {
            format!("http://[{upstream_host}]:{upstream_port}")
        } else {
            format!("http://{upstream_host}:{upstream_port}")
        };
        Self {
            upstream_base,
            read_settle_delay: DEFAULT_READ_SETTLE_DELAY,
            write_settle_delay: DEFAULT_WRITE_SETTLE_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn settle_delay(&self, method: &Method) -> Duration {
        if method == Method::GET || method == Method::HEAD {
            self.read_settle_delay
        } else {
            self.write_settle_delay
        }
    }

    fn upstream_url(&self, uri: &Uri) -> String {
        let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
        format!("{}{path_and_query}", self.upstream_base)
    }
}

/// Classifies, preempts when needed, forwards and relays.
pub struct ForwardingGate {
    arbiter: Arc<Arbiter>,
    config: GateConfig,
    client: reqwest::Client,
}

impl ForwardingGate {
    pub fn new(arbiter: Arc<Arbiter>, config: GateConfig) -> Result<Self, Report<ProxyError>> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .change_context(ProxyError::Client)?;

        Ok(Self {
            arbiter,
            config,
            client,
        })
    }

    pub fn arbiter(&self) -> &Arc<Arbiter> {
        &self.arbiter
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub async fn handle(&self, req: &Request, body: Body) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if !matches!(method, Method::GET | Method::HEAD | Method::POST) {
            tracing::warn!(%method, %path, "Unsupported method");
            return Response::builder()
                .status(StatusCode::NOT_IMPLEMENTED)
                .body(format!("Method {method} not supported"));
        }

        let body = match body.into_bytes().await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(%method, %path, "Failed to read request body: {e}");
                return Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body("Failed to read request body");
            }
        };

        let intensive = is_gpu_intensive(&path, &parse_body(&body));
        let activity = if intensive {
            tracing::info!(%method, %path, "GPU-intensive request, preempting background unit");
            let outcome = self.arbiter.force_preempt().await;
            tracing::debug!(%path, "Preemption finished: {outcome:?}");

            let delay = self.config.settle_delay(&method);
            if !delay.is_zero() {
                tracing::debug!(%path, "Waiting {delay:?} for GPU memory to be released");
                sleep(delay).await;
            }
            Some(ActivityRecorder::new(self.arbiter.clone()))
        } else {
            tracing::debug!(%method, %path, "Forwarding request without preemption");
            None
        };

        match self.forward(req, method.clone(), body).await {
            Ok(upstream) => relay::into_response(upstream, path, activity),
            Err(e) => {
                tracing::error!(%method, %path, "Failed to forward request: {e:?}");
                if let Some(activity) = activity {
                    activity.finish().await;
                }
                Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body("Bad gateway")
            }
        }
    }

    async fn forward(
        &self,
        req: &Request,
        method: Method,
        body: Bytes,
    ) -> Result<reqwest::Response, Report<ProxyError>> {
        let url = self.config.upstream_url(req.uri());
        let mut request = self
            .client
            .request(method, url.as_str())
            .headers(headers::outbound(req.headers()));
        if !body.is_empty() {
            request = request.body(body);
        }
        request
            .send()
            .await
            .change_context_lazy(|| ProxyError::Upstream { url })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn settle_delay_depends_on_method() {
        let config = GateConfig::new("127.0.0.1", 11434);

        assert_eq!(config.settle_delay(&Method::GET), DEFAULT_READ_SETTLE_DELAY);
        assert_eq!(config.settle_delay(&Method::HEAD), DEFAULT_READ_SETTLE_DELAY);
        assert_eq!(config.settle_delay(&Method::POST), DEFAULT_WRITE_SETTLE_DELAY);
    }

    #[test]
    fn upstream_url_keeps_path_and_query() {
        let config = GateConfig::new("10.0.0.5", 11434);

        let uri: Uri = "/api/tags?verbose=1".parse().unwrap();
        assert_eq!(
            config.upstream_url(&uri).as_str(),
            "http://10.0.0.5:11434/api/tags?verbose=1"
        );

        let uri: Uri = "/".parse().unwrap();
        assert_eq!(config.upstream_url(&uri).as_str(), "http://10.0.0.5:11434/");
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        assert_eq!(
            GateConfig::new("::1", 11434).upstream_base.as_str(),
            "http://[::1]:11434"
        );
        assert_eq!(
            GateConfig::new("[fd00::5]", 11434).upstream_base.as_str(),
            "http://[fd00::5]:11434"
        );
        assert_eq!(
            GateConfig::new("ollama.lan", 8080).upstream_base.as_str(),
            "http://ollama.lan:8080"
        );
    }
}
