//! HTTP(S) requests routed through the tunnel.
//!
//! Every request gets a fresh tunnel stream from the session it was built
//! for; `https` runs a rustls handshake on top of it. Host names are looked
//! up in the [`HostResolver`] first, so private names can point at tunnel
//! addresses without touching system DNS.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Once, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::manager::SessionContext;
use crate::error::{Error, Result};

/// Request body accepted by [`RequestRouter`]
pub type Body = Full<Bytes>;

/// Name resolution used when the host map has no entry
#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    async fn resolve(&self, host: &str) -> Result<Ipv4Addr>;
}

/// Resolution through the operating system, first IPv4 answer wins
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Ipv4Addr> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(ip);
        }

        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| Error::Resolve {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        addrs
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .next()
            .ok_or_else(|| Error::Resolve {
                host: host.to_string(),
                reason: "no IPv4 address".to_string(),
            })
    }
}

/// Host map in front of a fallback resolver.
///
/// Cloning shares the map, so entries added at runtime are seen by every
/// router built from it.
#[derive(Clone)]
pub struct HostResolver {
    hosts: Arc<RwLock<HashMap<String, Ipv4Addr>>>,
    fallback: Arc<dyn Resolve>,
}

impl HostResolver {
    pub fn new(hosts: HashMap<String, Ipv4Addr>, fallback: Arc<dyn Resolve>) -> Self {
        Self {
            hosts: Arc::new(RwLock::new(hosts)),
            fallback,
        }
    }

    pub async fn insert(&self, host: impl Into<String>, addr: Ipv4Addr) {
        self.hosts.write().await.insert(host.into(), addr);
    }

    /// Host map entry only, never the fallback
    pub async fn mapped(&self, host: &str) -> Option<Ipv4Addr> {
        self.hosts.read().await.get(host).copied()
    }

    pub async fn resolve(&self, host: &str) -> Result<Ipv4Addr> {
        if let Some(addr) = self.mapped(host).await {
            trace!("Host map: {} -> {}", host, addr);
            return Ok(addr);
        }
        self.fallback.resolve(host).await
    }
}

impl std::fmt::Debug for HostResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostResolver").finish_non_exhaustive()
    }
}

/// A response read to the end
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Issues HTTP/1.1 requests over tunnel streams of one session.
///
/// Obtained from [`super::ConnectionManager::router`]; a reconnect builds a
/// new router, so hold on to the manager rather than the router.
#[derive(Clone)]
pub struct RequestRouter {
    ctx: SessionContext,
    tls: Arc<OnceLock<TlsConnector>>,
}

impl RequestRouter {
    pub(crate) fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            tls: Arc::new(OnceLock::new()),
        }
    }

    /// Send `req`, returning as soon as the response head arrived.
    pub async fn send(&self, req: Request<Body>) -> Result<Response<Incoming>> {
        self.dispatch(req, None).await
    }

    /// Like [`RequestRouter::send`], verifying TLS against `server_name`
    /// instead of the URI host.
    pub async fn send_with_server_name(
        &self,
        req: Request<Body>,
        server_name: &str,
    ) -> Result<Response<Incoming>> {
        self.dispatch(req, Some(server_name)).await
    }

    /// Send `req` and read the whole body.
    pub async fn fetch(&self, req: Request<Body>) -> Result<FetchedResponse> {
        let response = self.send(req).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(FetchedResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse> {
        self.fetch(get_request(url)?).await
    }

    async fn dispatch(
        &self,
        mut req: Request<Body>,
        server_name: Option<&str>,
    ) -> Result<Response<Incoming>> {
        let target = Target::from_uri(req.uri())?;
        set_host_header(&mut req, &target)?;
        *req.uri_mut() = origin_form(req.uri())?;

        debug!("{} {}://{}:{}{}", req.method(), target.scheme(), target.host, target.port, req.uri());
        let stream = self.ctx.connect(&target.host, target.port).await?;

        if target.tls {
            let name = server_name.unwrap_or(&target.host).to_string();
            let name = rustls::pki_types::ServerName::try_from(name)
                .map_err(|e| Error::Tls(e.to_string()))?;
            let tls = self
                .connector()
                .connect(name, stream)
                .await
                .map_err(|e| Error::Tls(e.to_string()))?;
            send_over(tls, req).await
        } else {
            send_over(stream, req).await
        }
    }

    fn connector(&self) -> &TlsConnector {
        self.tls.get_or_init(build_tls_connector)
    }
}

async fn send_over<S>(io: S, req: Request<Body>) -> Result<Response<Incoming>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(TokioIo::new(io)).await?;

    // Drives the connection; it ends once the response body was consumed
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Tunnel HTTP connection closed: {}", e);
        }
    });

    Ok(sender.send_request(req).await?)
}

#[derive(Debug, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    tls: bool,
}

impl Target {
    fn from_uri(uri: &Uri) -> Result<Self> {
        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(other) => {
                return Err(Error::InvalidRequest(format!("unsupported scheme: {}", other)))
            }
            None => return Err(Error::InvalidRequest(format!("not an absolute URI: {}", uri))),
        };
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidRequest(format!("no host in {}", uri)))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        Ok(Self { host, port, tls })
    }

    fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    fn default_port(&self) -> bool {
        self.port == if self.tls { 443 } else { 80 }
    }
}

fn set_host_header(req: &mut Request<Body>, target: &Target) -> Result<()> {
    if req.headers().contains_key(HOST) {
        return Ok(());
    }
    let value = if target.default_port() {
        target.host.clone()
    } else {
        format!("{}:{}", target.host, target.port)
    };
    let value = HeaderValue::from_str(&value)
        .map_err(|e| Error::InvalidRequest(format!("bad host header: {}", e)))?;
    req.headers_mut().insert(HOST, value);
    Ok(())
}

fn origin_form(uri: &Uri) -> Result<Uri> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    path.parse()
        .map_err(|e| Error::InvalidRequest(format!("bad request path {}: {}", path, e)))
}

fn get_request(url: &str) -> Result<Request<Body>> {
    let url = url::Url::parse(url).map_err(|e| Error::InvalidRequest(format!("{}: {}", url, e)))?;
    Request::get(url.as_str())
        .body(Full::new(Bytes::new()))
        .map_err(|e| Error::InvalidRequest(e.to_string()))
}

static CRYPTO_PROVIDER_INIT: Once = Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        // Err means a provider is already installed
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn build_tls_connector() -> TlsConnector {
    ensure_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}
