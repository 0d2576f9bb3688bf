//! HTTP handler for the capture proxy.
//!
//! Requests are forwarded upstream by our own client so connect and
//! response deadlines apply. Response bodies stream back through a
//! [`RelayStream`], tapped for capture when the exchange qualifies.
//! CONNECT requests are answered here and served by [`crate::connect`].

use std::sync::Arc;

use http_body_util::Full;
use hudsucker::{
    hyper::{header, Method, Request, Response, StatusCode, Version},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::{Bytes, Incoming};
use hyper_util::rt::TokioIo;
use resd_core::{Exchange, Timeouts};

use crate::ca::HandshakeAuthority;
use crate::connect;
use crate::error::ProxyError;
use crate::extractor::Extractor;
use crate::policy::InterceptPolicy;
use crate::proxy::UpstreamClient;
use crate::relay::RelayStream;

pub(crate) fn text_response(status: StatusCode, text: String) -> Response<Body> {
    let mut response = Response::new(Body::from(Full::new(Bytes::from(text))));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("text/plain"));
    response
}

struct Shared {
    extractor: Arc<Extractor>,
    policy: Arc<InterceptPolicy>,
    authority: HandshakeAuthority,
    client: UpstreamClient,
    timeouts: Timeouts,
}

/// Proxy handler: interception decisions, forwarding and capture.
#[derive(Clone)]
pub struct CaptureHandler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CaptureHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandler")
            .field("policy", &self.shared.policy)
            .field("timeouts", &self.shared.timeouts)
            .finish()
    }
}

impl CaptureHandler {
    /// Creates a handler.
    pub fn new(
        extractor: Arc<Extractor>,
        policy: Arc<InterceptPolicy>,
        authority: HandshakeAuthority,
        client: UpstreamClient,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                extractor,
                policy,
                authority,
                client,
                timeouts,
            }),
        }
    }

    pub(crate) fn policy(&self) -> &InterceptPolicy {
        &self.shared.policy
    }

    pub(crate) fn authority(&self) -> &HandshakeAuthority {
        &self.shared.authority
    }

    pub(crate) fn timeouts(&self) -> Timeouts {
        self.shared.timeouts
    }

    /// Handles a request that is not a CONNECT.
    pub(crate) async fn handle(&self, req: Request<Body>) -> Response<Body> {
        if is_upgrade(&req) {
            self.upgrade(req).await
        } else {
            self.forward(req).await
        }
    }

    /// Sends a request upstream under the response deadline, mapping
    /// failures to gateway errors.
    async fn send(
        &self,
        mut req: Request<Body>,
        host: String,
    ) -> std::result::Result<Response<Incoming>, Response<Body>> {
        *req.version_mut() = Version::HTTP_11;
        req.headers_mut().remove("proxy-connection");

        match tokio::time::timeout(
            self.shared.timeouts.upstream_read(),
            self.shared.client.request(req),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                let error = ProxyError::UpstreamUnreachable {
                    host,
                    reason: e.to_string(),
                };
                tracing::warn!("{}", error);
                Err(text_response(StatusCode::BAD_GATEWAY, error.to_string()))
            }
            Err(_) => {
                let error = ProxyError::UpstreamUnreachable {
                    host,
                    reason: "no response before deadline".into(),
                };
                tracing::warn!("{}", error);
                Err(text_response(StatusCode::GATEWAY_TIMEOUT, error.to_string()))
            }
        }
    }

    /// Forwards a protocol upgrade and splices the two upgraded connections.
    async fn upgrade(&self, mut req: Request<Body>) -> Response<Body> {
        let Some(host) = req.uri().host().map(str::to_string) else {
            return text_response(StatusCode::BAD_REQUEST, "missing request host".into());
        };
        let client_side = hyper::upgrade::on(&mut req);
        let mut response = match self.send(req, host.clone()).await {
            Ok(response) => response,
            Err(response) => return response,
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let upstream_side = hyper::upgrade::on(&mut response);
            tokio::spawn(async move {
                match tokio::try_join!(client_side, upstream_side) {
                    Ok((client, upstream)) => {
                        let mut client = TokioIo::new(client);
                        let mut upstream = TokioIo::new(upstream);
                        if let Err(e) =
                            tokio::io::copy_bidirectional(&mut client, &mut upstream).await
                        {
                            tracing::debug!("Upgraded connection to {} closed: {}", host, e);
                        }
                    }
                    Err(e) => tracing::debug!("Upgrade to {} failed: {}", host, e),
                }
            });
        }
        response.map(Body::from)
    }

    /// Forwards a request upstream and relays the response.
    async fn forward(&self, req: Request<Body>) -> Response<Body> {
        let Some(host) = req.uri().host().map(str::to_string) else {
            return text_response(StatusCode::BAD_REQUEST, "missing request host".into());
        };
        let scheme = req.uri().scheme_str().unwrap_or("http").to_string();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        // Only plain downloads are captured.
        let capture = req.method() == Method::GET && self.shared.policy.should_intercept(&host);
        let request_headers: Vec<(String, String)> = if capture {
            req.headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect()
        } else {
            Vec::new()
        };

        let response = match self.send(req, host.clone()).await {
            Ok(response) => response,
            Err(response) => return response,
        };

        let tap = if capture {
            let headers = response.headers();
            let exchange = Exchange {
                scheme: &scheme,
                host: &host,
                path: &path,
                query: query.as_deref(),
                status: response.status().as_u16(),
                content_type: headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok()),
                content_length: headers
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok()),
                range_total: headers
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(range_total),
            };
            self.shared.extractor.inspect(
                &exchange,
                request_headers
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_str())),
            )
        } else {
            None
        };

        let (parts, body) = response.into_parts();
        let relay = RelayStream::new(body, self.shared.timeouts.upstream_read(), tap);
        Response::from_parts(parts, Body::from_stream(relay))
    }
}

/// Total length from a `Content-Range: bytes a-b/total` value.
fn range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

fn is_upgrade(req: &Request<Body>) -> bool {
    req.headers().contains_key(header::UPGRADE)
}

impl HttpHandler for CaptureHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Response(connect::accept(self.clone(), req));
        }
        RequestOrResponse::Response(self.handle(req).await)
    }
}
