//! CONNECT handling.
//!
//! Hosts the intercept policy admits get a TLS handshake with a leaf from the
//! CA manager, and the decrypted requests go through the capture handler.
//! Every other host gets a raw tunnel. The client handshake and the tunnel's
//! upstream connect both run under the connect deadline.

use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use hudsucker::hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hudsucker::hyper::{Request, Response, StatusCode, Uri};
use hudsucker::Body;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use resd_core::Timeouts;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::error::{ProxyError, Result};
use crate::handler::{text_response, CaptureHandler};

/// First bytes of a TLS handshake record.
const TLS_RECORD: [u8; 2] = [0x16, 0x03];

/// HTTP/1 server for client connections, with a deadline on request headers.
pub(crate) fn server_builder(timeouts: &Timeouts) -> ServerBuilder<TokioExecutor> {
    let mut builder = ServerBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.connect())
        .title_case_headers(true)
        .preserve_header_case(true);
    builder
}

/// Answers a CONNECT request and serves the tunneled connection in the
/// background.
pub(crate) fn accept(handler: CaptureHandler, mut req: Request<Body>) -> Response<Body> {
    let Some(authority) = req.uri().authority().cloned() else {
        return text_response(StatusCode::BAD_REQUEST, "missing CONNECT authority".into());
    };

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::debug!("CONNECT to {} was not upgraded: {}", authority, e);
                return;
            }
        };
        match serve_connect(handler, authority, TokioIo::new(upgraded)).await {
            Ok(()) => {}
            Err(e @ (ProxyError::Handshake { .. } | ProxyError::UpstreamUnreachable { .. })) => {
                tracing::warn!("{}", e)
            }
            Err(e) => tracing::debug!("Connection closed: {}", e),
        }
    });

    Response::new(Body::empty())
}

async fn serve_connect<S>(handler: CaptureHandler, authority: Authority, mut client: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let deadline = handler.timeouts().connect();
    let host = authority.host().to_string();
    if !handler.policy().should_intercept(&host) {
        tracing::debug!("Tunneling {} untouched", authority);
        return tunnel(client, &authority, deadline).await;
    }

    let mut head = [0u8; 4];
    let read = tokio::time::timeout(deadline, client.read(&mut head))
        .await
        .map_err(|_| handshake_error(&host, "client sent nothing before the deadline"))??;
    if read == 0 {
        return Ok(());
    }
    let head = head[..read].to_vec();
    let client = Rewind::new(head.clone(), client);

    if head.starts_with(&TLS_RECORD) {
        let config = handler.authority().server_config(&host).await;
        let tls = match tokio::time::timeout(deadline, TlsAcceptor::from(config).accept(client)).await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => return Err(handshake_error(&host, e)),
            Err(_) => return Err(handshake_error(&host, "handshake deadline elapsed")),
        };
        serve(handler, tls, Scheme::HTTPS, authority).await
    } else if head == b"GET " {
        serve(handler, client, Scheme::HTTP, authority).await
    } else {
        tracing::debug!("Unknown protocol to {}, tunneling", authority);
        tunnel(client, &authority, deadline).await
    }
}

fn handshake_error(host: &str, reason: impl ToString) -> ProxyError {
    ProxyError::Handshake {
        host: host.to_string(),
        reason: reason.to_string(),
    }
}

/// Relays raw bytes between the client and the real host.
async fn tunnel<S>(mut client: S, authority: &Authority, deadline: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let unreachable = |reason: String| ProxyError::UpstreamUnreachable {
        host: authority.to_string(),
        reason,
    };
    let mut server = match tokio::time::timeout(deadline, TcpStream::connect(authority.as_str())).await
    {
        Ok(Ok(server)) => server,
        Ok(Err(e)) => return Err(unreachable(e.to_string())),
        Err(_) => return Err(unreachable("connect deadline elapsed".into())),
    };
    tokio::io::copy_bidirectional(&mut client, &mut server).await?;
    Ok(())
}

/// Serves HTTP on a terminated connection through the capture handler.
async fn serve<S>(handler: CaptureHandler, stream: S, scheme: Scheme, authority: Authority) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let builder = server_builder(&handler.timeouts());
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        let req = with_origin(req, &scheme, &authority);
        async move {
            let response = match req {
                Some(req) => handler.handle(req.map(Body::from)).await,
                None => text_response(StatusCode::BAD_REQUEST, "invalid request target".into()),
            };
            Ok::<_, Infallible>(response)
        }
    });

    builder
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
        .map_err(|e| ProxyError::Proxy(e.to_string()))
}

/// Completes an origin-form request target with the tunnel's scheme and
/// authority.
fn with_origin<B>(req: Request<B>, scheme: &Scheme, authority: &Authority) -> Option<Request<B>> {
    let (mut parts, body) = req.into_parts();
    let mut uri = parts.uri.into_parts();
    uri.scheme = Some(scheme.clone());
    uri.authority = Some(authority.clone());
    if uri.path_and_query.is_none() {
        uri.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    parts.uri = Uri::from_parts(uri).ok()?;
    Some(Request::from_parts(parts, body))
}

/// A stream that first replays bytes already read from it.
struct Rewind<S> {
    head: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Rewind<S> {
    fn new(head: Vec<u8>, inner: S) -> Self {
        Self { head, pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.head.len() {
            let n = buf.remaining().min(this.head.len() - this.pos);
            buf.put_slice(&this.head[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn origin_form_gets_tunnel_authority() {
        let req = Request::builder().uri("/v/a.mp4?x=1").body(()).unwrap();
        let authority = Authority::from_static("media.example.com:443");
        let req = with_origin(req, &Scheme::HTTPS, &authority).unwrap();
        assert_eq!(req.uri(), "https://media.example.com:443/v/a.mp4?x=1");
    }

    #[tokio::test]
    async fn rewind_replays_head_then_reads_on() {
        let (mut near, far) = tokio::io::duplex(64);
        near.write_all(b"lo world").await.unwrap();
        drop(near);

        let mut stream = Rewind::new(b"hel".to_vec(), far);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn tunnel_to_closed_port_is_unreachable() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let (client, _far) = tokio::io::duplex(64);
        let authority: Authority = addr.to_string().parse().unwrap();
        let result = tunnel(client, &authority, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ProxyError::UpstreamUnreachable { .. })));
    }
}
