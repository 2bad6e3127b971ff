//! HTTP backend
//!
//! Client for the vmio data-plane protocol: ranged GET/PUT on the
//! transfer URL, PATCH for zero and flush, OPTIONS for capability
//! discovery, and the /extents resource. Connects over TLS or plain
//! TCP, and switches to the daemon's Unix socket when both ends are on
//! the same host.

use std::convert::Infallible;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use vmio_common::{AlignedBuffer, DirtyExtent, Error, Result, ZeroExtent};

use crate::{Backend, Options};

type ReqBody = BoxBody<Bytes, Infallible>;

/// Chunk size used when emulating zero with a PUT of zeroes.
const ZERO_CHUNK_SIZE: usize = 128 * 1024;

/// Limit on error response bodies read back from the server.
const MAX_ERROR_BODY: usize = 512;

/// A transfer URL: `https://host:port/images/<ticket>` (or `http:` for
/// deployments terminating TLS elsewhere).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub tls: bool,
}

impl std::str::FromStr for RemoteUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let uri: http::Uri = s
            .parse()
            .map_err(|err| Error::invalid_argument(format!("invalid URL {s:?}: {err}")))?;
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported URL scheme {other:?}"
                )));
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| Error::invalid_argument(format!("URL without host: {s:?}")))?;
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        Ok(Self {
            host: host.to_string(),
            port,
            path: uri.path().to_string(),
            tls,
        })
    }
}

impl std::fmt::Display for RemoteUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}{}", self.host, self.port, self.path)
    }
}

#[derive(Clone, Debug)]
enum TransportKind {
    Tcp,
    Unix(PathBuf),
}

struct Connection {
    sender: SendRequest<ReqBody>,
    kind: TransportKind,
    /// Whether the TCP peer is this host, enabling the Unix socket
    /// switch.
    is_local: bool,
}

/// Streaming request body fed through a channel.
struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl hyper::body::Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Infallible>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => Poll::Ready(Some(Ok(Frame::data(data)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Backend for remote vmio daemons.
pub struct HttpBackend {
    url: RemoteUrl,
    cafile: Option<PathBuf>,
    secure: bool,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    conn: Option<Connection>,
    position: u64,

    // Server capabilities discovered with OPTIONS. Immutable after the
    // handshake so clones can share them safely.
    can_extents: bool,
    can_zero: bool,
    can_flush: bool,
    max_readers: u32,
    max_writers: u32,

    // Cached to avoid expensive remote calls on clones.
    size: Option<u64>,
    zero_extents_cache: Option<Vec<ZeroExtent>>,
    dirty_extents_cache: Option<Vec<DirtyExtent>>,
}

impl HttpBackend {
    /// Connect to a transfer URL and probe server capabilities.
    pub async fn open(url: RemoteUrl, options: &Options) -> Result<Self> {
        debug!(%url, secure = options.secure, "open");

        let mut backend = Self {
            url,
            cafile: options.cafile.clone(),
            secure: options.secure,
            tls_config: None,
            conn: None,
            position: 0,
            can_extents: false,
            can_zero: false,
            can_flush: false,
            max_readers: 1,
            max_writers: 1,
            size: None,
            zero_extents_cache: None,
            dirty_extents_cache: None,
        };

        backend.conn = Some(backend.connect_tcp().await?);

        match backend.probe_options().await {
            Ok(()) => Ok(backend),
            Err(err) => {
                backend.conn = None;
                Err(err)
            }
        }
    }

    // ── Transport ─────────────────────────────────────────────────────────────

    async fn connect_tcp(&mut self) -> Result<Connection> {
        debug!(host = %self.url.host, port = self.url.port, "connecting to tcp socket");
        let stream = TcpStream::connect((self.url.host.as_str(), self.url.port)).await?;
        stream.set_nodelay(true)?;
        let is_local = stream.local_addr()?.ip() == stream.peer_addr()?.ip();

        if self.url.tls {
            let config = self.tls_client_config()?;
            let server_name = ServerName::try_from(self.url.host.clone())
                .map_err(|err| Error::invalid_argument(format!("invalid TLS name: {err}")))?;
            let stream = TlsConnector::from(config)
                .connect(server_name, stream)
                .await?;
            handshake(stream, TransportKind::Tcp, is_local).await
        } else {
            handshake(stream, TransportKind::Tcp, is_local).await
        }
    }

    async fn connect_unix(&self, path: &PathBuf) -> Result<Connection> {
        debug!(path = %path.display(), "connecting to unix socket");
        let stream = UnixStream::connect(path).await?;
        handshake(stream, TransportKind::Unix(path.clone()), true).await
    }

    fn tls_client_config(&mut self) -> Result<Arc<rustls::ClientConfig>> {
        if let Some(config) = &self.tls_config {
            return Ok(Arc::clone(config));
        }

        let config = if self.secure {
            let cafile = self.cafile.as_ref().ok_or_else(|| {
                Error::invalid_argument("secure connection requires a CA file")
            })?;
            let mut roots = RootCertStore::empty();
            let pem = std::fs::read(cafile)?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                roots
                    .add(cert?)
                    .map_err(|err| Error::invalid_argument(format!("invalid CA file: {err}")))?;
            }
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
                .with_no_client_auth()
        };

        let config = Arc::new(config);
        self.tls_config = Some(Arc::clone(&config));
        Ok(config)
    }

    /// Reconnect with the same transport as the current connection.
    async fn reconnect(&mut self) -> Result<()> {
        let kind = self
            .conn
            .take()
            .map(|conn| conn.kind)
            .ok_or_else(|| Error::internal("operation on closed http backend"))?;
        let conn = match kind {
            TransportKind::Tcp => self.connect_tcp().await?,
            TransportKind::Unix(path) => self.connect_unix(&path).await?,
        };
        self.conn = Some(conn);
        Ok(())
    }

    // ── Capability discovery ──────────────────────────────────────────────────

    async fn probe_options(&mut self) -> Result<()> {
        let req = self
            .request_builder(Method::OPTIONS, self.url.path.clone())
            .body(empty_body())
            .map_err(request_error)?;
        let resp = self.send(req).await?;
        let status = resp.status();

        let options: Value = match status {
            StatusCode::OK => {
                let body = read_body_limited(resp, 64 * 1024).await?;
                // An invalid response means no features and no unix
                // socket.
                serde_json::from_slice(&body).unwrap_or_else(|_| json!({}))
            }
            // Servers predating OPTIONS support.
            StatusCode::NO_CONTENT | StatusCode::METHOD_NOT_ALLOWED => json!({}),
            _ => return Err(remote_error(resp).await),
        };
        debug!(%options, "server options");

        for feature in options["features"].as_array().into_iter().flatten() {
            match feature.as_str() {
                Some("extents") => self.can_extents = true,
                Some("zero") => self.can_zero = true,
                Some("flush") => self.can_flush = true,
                _ => {}
            }
        }

        // Old servers that do not publish limits may not support
        // multiple connections.
        self.max_readers = options["max_readers"].as_u64().unwrap_or(1) as u32;
        self.max_writers = options["max_writers"].as_u64().unwrap_or(1) as u32;

        if let Some(path) = options["unix_socket"].as_str() {
            self.optimize_connection(PathBuf::from(path)).await;
        }

        Ok(())
    }

    /// Switch to the daemon's Unix socket when talking to the local
    /// host. Keep the current connection when the switch fails.
    async fn optimize_connection(&mut self, path: PathBuf) {
        if !self.conn.as_ref().is_some_and(|conn| conn.is_local) {
            return;
        }
        match self.connect_unix(&path).await {
            Ok(conn) => {
                self.conn = Some(conn);
            }
            Err(err) => {
                warn!("cannot use unix socket: {err}");
            }
        }
    }

    // ── Request plumbing ──────────────────────────────────────────────────────

    fn request_builder(&self, method: Method, path: String) -> http::request::Builder {
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, format!("{}:{}", self.url.host, self.url.port))
    }

    async fn send(&mut self, req: Request<ReqBody>) -> Result<Response<Incoming>> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::internal("operation on closed http backend"))?;
        conn.sender.send_request(req).await.map_err(request_error)
    }

    /// Ranged GET at the current position, validating the response
    /// length.
    async fn get_range(&mut self, length: u64) -> Result<Response<Incoming>> {
        let range = format!("bytes={}-{}", self.position, self.position + length - 1);
        let req = self
            .request_builder(Method::GET, self.url.path.clone())
            .header(header::RANGE, range)
            .body(empty_body())
            .map_err(request_error)?;
        let resp = self.send(req).await?;

        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(remote_error(resp).await);
        }

        let content_length = content_length(&resp)?;
        if content_length != length {
            return Err(Error::protocol(format!(
                "unexpected content length {content_length}, expected {length}"
            )));
        }

        Ok(resp)
    }

    fn put_request(&self, length: u64, body: ReqBody) -> Result<Request<ReqBody>> {
        let mut path = self.url.path.clone();
        if self.can_flush {
            path.push_str("?flush=n");
        }
        self.request_builder(Method::PUT, path)
            .header(header::CONTENT_LENGTH, length)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/*", self.position, self.position + length - 1),
            )
            .body(body)
            .map_err(request_error)
    }

    async fn patch(&mut self, msg: &Value) -> Result<()> {
        let body = serde_json::to_vec(msg).map_err(|err| Error::internal(err.to_string()))?;
        let req = self
            .request_builder(Method::PATCH, self.url.path.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, body.len())
            .body(full_body(body))
            .map_err(request_error)?;
        let resp = self.send(req).await?;
        if resp.status() != StatusCode::OK {
            return Err(remote_error(resp).await);
        }
        drain(resp).await
    }

    /// Emulate PATCH/zero with a PUT of zeroes for servers without the
    /// zero feature.
    async fn emulate_zero(&mut self, length: u64) -> Result<()> {
        let (tx, rx) = mpsc::channel(4);
        let req = self.put_request(length, channel_body(rx))?;
        let resp_fut = self.send(req);

        let feed = async move {
            let chunk = Bytes::from(vec![0; ZERO_CHUNK_SIZE]);
            let mut todo = length;
            while todo > 0 {
                let step = todo.min(chunk.len() as u64) as usize;
                if tx.send(chunk.slice(..step)).await.is_err() {
                    // Server closed the connection; it may have sent a
                    // helpful error status.
                    break;
                }
                todo -= step as u64;
            }
        };

        let (resp, ()) = tokio::join!(resp_fut, feed);
        let resp = resp?;
        if resp.status() != StatusCode::OK {
            return Err(remote_error(resp).await);
        }
        drain(resp).await
    }

    /// Emulate a HEAD request by sending GET and dropping the
    /// connection after reading the headers. Not polite, but the only
    /// choice when the server does not support extents.
    async fn emulate_head(&mut self) -> Result<u64> {
        let req = self
            .request_builder(Method::GET, self.url.path.clone())
            .body(empty_body())
            .map_err(request_error)?;
        let resp = self.send(req).await?;

        if resp.status() != StatusCode::OK {
            return Err(remote_error(resp).await);
        }
        let size = content_length(&resp)?;

        // Drop the response and the connection without reading the
        // body, then reconnect for the next request.
        drop(resp);
        self.reconnect().await?;

        Ok(size)
    }

    async fn fetch_size(&mut self) -> Result<u64> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        // Getting the last extent is more polite than the HEAD
        // emulation, so use it when we can.
        let size = if self.can_extents {
            let extents = self.fetch_zero_extents().await?;
            let last = extents
                .last()
                .ok_or_else(|| Error::protocol("server returned no extents"))?;
            last.start + last.length
        } else {
            self.emulate_head().await?
        };
        self.size = Some(size);
        Ok(size)
    }

    async fn fetch_zero_extents(&mut self) -> Result<Vec<ZeroExtent>> {
        if let Some(extents) = &self.zero_extents_cache {
            return Ok(extents.clone());
        }

        let extents = if self.can_extents {
            let path = format!("{}/extents?context=zero", self.url.path);
            let req = self
                .request_builder(Method::GET, path)
                .body(empty_body())
                .map_err(request_error)?;
            let resp = self.send(req).await?;
            match resp.status() {
                StatusCode::OK => {
                    let body = read_body_limited(resp, usize::MAX).await?;
                    serde_json::from_slice(&body)
                        .map_err(|err| Error::protocol(format!("invalid extents: {err}")))?
                }
                // The resource exists but this image has no zero
                // extents support; behave like an all-data image.
                StatusCode::NOT_FOUND => {
                    drain(resp).await?;
                    let size = self.fetch_size_without_extents().await?;
                    vec![ZeroExtent::new(0, size, false, false)]
                }
                _ => return Err(remote_error(resp).await),
            }
        } else {
            let size = self.fetch_size_without_extents().await?;
            vec![ZeroExtent::new(0, size, false, false)]
        };

        self.zero_extents_cache = Some(extents.clone());
        Ok(extents)
    }

    async fn fetch_size_without_extents(&mut self) -> Result<u64> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let size = self.emulate_head().await?;
        self.size = Some(size);
        Ok(size)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn size(&mut self) -> Result<u64> {
        self.fetch_size().await
    }

    fn block_size(&self) -> usize {
        1
    }

    fn readable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        true
    }

    fn tell(&self) -> u64 {
        self.position
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(n) => self.position.saturating_add_signed(n),
            SeekFrom::End(n) => self.fetch_size().await?.saturating_add_signed(n),
        };
        Ok(self.position)
    }

    async fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = self.fetch_size().await?.saturating_sub(self.position);
        // A zero length range (first > last) is invalid.
        let length = (buf.len() as u64).min(available);
        if length == 0 {
            return Ok(0);
        }

        let resp = self.get_range(length).await?;
        read_body_into(resp, &mut buf[..length as usize]).await?;
        self.position += length;
        Ok(length as usize)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let req = self.put_request(buf.len() as u64, full_body(buf.to_vec()))?;
        let resp = self.send(req).await?;
        if resp.status() != StatusCode::OK {
            return Err(remote_error(resp).await);
        }
        drain(resp).await?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    async fn zero(&mut self, length: u64) -> Result<u64> {
        if self.can_zero {
            let msg = json!({
                "op": "zero",
                "offset": self.position,
                "size": length,
                "flush": !self.can_flush,
            });
            self.patch(&msg).await?;
        } else {
            self.emulate_zero(length).await?;
        }
        self.position += length;
        Ok(length)
    }

    async fn flush(&mut self) -> Result<()> {
        if self.can_flush {
            self.patch(&json!({"op": "flush"})).await?;
        }
        Ok(())
    }

    async fn zero_extents(&mut self) -> Result<Vec<ZeroExtent>> {
        self.fetch_zero_extents().await
    }

    async fn dirty_extents(&mut self) -> Result<Vec<DirtyExtent>> {
        if let Some(extents) = &self.dirty_extents_cache {
            return Ok(extents.clone());
        }

        // Zero extents can be faked, dirty extents cannot.
        if !self.can_extents {
            return Err(Error::unsupported(
                "server does not support dirty extents",
            ));
        }

        let path = format!("{}/extents?context=dirty", self.url.path);
        let req = self
            .request_builder(Method::GET, path)
            .body(empty_body())
            .map_err(request_error)?;
        let resp = self.send(req).await?;
        let extents: Vec<DirtyExtent> = match resp.status() {
            StatusCode::OK => {
                let body = read_body_limited(resp, usize::MAX).await?;
                serde_json::from_slice(&body)
                    .map_err(|err| Error::protocol(format!("invalid extents: {err}")))?
            }
            StatusCode::NOT_FOUND => {
                let err = remote_error(resp).await;
                return Err(Error::unsupported(format!(
                    "server does not support dirty extents: {err}"
                )));
            }
            _ => return Err(remote_error(resp).await),
        };

        self.dirty_extents_cache = Some(extents.clone());
        Ok(extents)
    }

    async fn clone_backend(&self) -> Result<Box<dyn Backend>> {
        // Open another connection of the same kind, copying the
        // capability cache, size, and extents to avoid re-probing.
        let mut backend = Self {
            url: self.url.clone(),
            cafile: self.cafile.clone(),
            secure: self.secure,
            tls_config: self.tls_config.clone(),
            conn: None,
            position: 0,
            can_extents: self.can_extents,
            can_zero: self.can_zero,
            can_flush: self.can_flush,
            max_readers: self.max_readers,
            max_writers: self.max_writers,
            size: self.size,
            zero_extents_cache: self.zero_extents_cache.clone(),
            dirty_extents_cache: self.dirty_extents_cache.clone(),
        };

        let conn = match self.conn.as_ref().map(|conn| conn.kind.clone()) {
            Some(TransportKind::Unix(path)) => backend.connect_unix(&path).await?,
            _ => backend.connect_tcp().await?,
        };
        backend.conn = Some(conn);
        Ok(Box::new(backend))
    }

    async fn close(&mut self) {
        if self.conn.take().is_some() {
            debug!(url = %self.url, "close");
        }
    }

    fn max_readers(&self) -> u32 {
        self.max_readers
    }

    fn max_writers(&self) -> u32 {
        self.max_writers
    }

    fn can_read_from(&self) -> bool {
        true
    }

    fn can_write_to(&self) -> bool {
        true
    }

    /// Stream a PUT request, reading `length` bytes from `src` through
    /// `buf`.
    async fn read_from(
        &mut self,
        src: &mut dyn Backend,
        length: u64,
        buf: &mut AlignedBuffer,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel(4);
        let req = self.put_request(length, channel_body(rx))?;
        let resp_fut = self.send(req);

        // Move tx into the block so the body stream ends when feeding
        // does.
        let feed = async move {
            let mut todo = length;
            while todo > 0 {
                let step = todo.min(buf.len() as u64) as usize;
                let n = src.readinto(&mut buf.as_mut_slice()[..step]).await?;
                if n == 0 {
                    return Err(Error::PartialContent {
                        requested: length,
                        available: length - todo,
                    });
                }
                if tx
                    .send(Bytes::copy_from_slice(&buf.as_slice()[..n]))
                    .await
                    .is_err()
                {
                    // Server closed the connection; read the response,
                    // it may carry an error status.
                    break;
                }
                todo -= n as u64;
            }
            Ok(())
        };

        let (resp, fed) = tokio::join!(resp_fut, feed);
        let resp = match resp {
            Ok(resp) => resp,
            // A short source read aborts the body; report that rather
            // than the resulting connection error.
            Err(err) => return Err(fed.err().unwrap_or(err)),
        };
        if resp.status() != StatusCode::OK {
            return Err(remote_error(resp).await);
        }
        drain(resp).await?;
        fed?;

        self.position += length;
        Ok(())
    }

    /// Stream a ranged GET, writing `length` bytes into `dst` through
    /// `buf` so writes stay aligned to the buffer size.
    async fn write_to(
        &mut self,
        dst: &mut dyn Backend,
        length: u64,
        buf: &mut AlignedBuffer,
    ) -> Result<()> {
        let resp = self.get_range(length).await?;
        let mut body = resp.into_body();

        let mut fill = 0;
        let mut received = 0u64;
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(request_error)?;
            let Some(data) = frame.data_ref() else {
                continue;
            };
            received += data.len() as u64;
            if received > length {
                return Err(Error::protocol("server sent more data than requested"));
            }

            let mut chunk = &data[..];
            while !chunk.is_empty() {
                let step = chunk.len().min(buf.len() - fill);
                buf.as_mut_slice()[fill..fill + step].copy_from_slice(&chunk[..step]);
                fill += step;
                chunk = &chunk[step..];
                if fill == buf.len() {
                    write_all(dst, buf.as_slice()).await?;
                    fill = 0;
                }
            }
        }

        if received < length {
            return Err(Error::PartialContent {
                requested: length,
                available: received,
            });
        }
        if fill > 0 {
            write_all(dst, &buf.as_slice()[..fill]).await?;
        }

        self.position += length;
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn handshake<S>(stream: S, kind: TransportKind, is_local: bool) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(request_error)?;
    tokio::spawn(async move {
        // The connection task exits when the sender is dropped.
        let _ = conn.await;
    });
    Ok(Connection {
        sender,
        kind,
        is_local,
    })
}

fn empty_body() -> ReqBody {
    Empty::new().boxed()
}

fn full_body(data: Vec<u8>) -> ReqBody {
    Full::new(Bytes::from(data)).boxed()
}

fn channel_body(rx: mpsc::Receiver<Bytes>) -> ReqBody {
    ChannelBody { rx }.boxed()
}

fn request_error(err: impl std::fmt::Display) -> Error {
    Error::Io(std::io::Error::other(err.to_string()))
}

fn content_length(resp: &Response<Incoming>) -> Result<u64> {
    resp.headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| Error::protocol("response without content length"))
}

/// Read the whole response body into the exact sized buffer.
async fn read_body_into(resp: Response<Incoming>, buf: &mut [u8]) -> Result<()> {
    let mut body = resp.into_body();
    let mut pos = 0;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(request_error)?;
        if let Some(data) = frame.data_ref() {
            if pos + data.len() > buf.len() {
                return Err(Error::protocol("server sent more data than requested"));
            }
            buf[pos..pos + data.len()].copy_from_slice(data);
            pos += data.len();
        }
    }
    if pos < buf.len() {
        return Err(Error::PartialContent {
            requested: buf.len() as u64,
            available: pos as u64,
        });
    }
    Ok(())
}

async fn read_body_limited(resp: Response<Incoming>, limit: usize) -> Result<Vec<u8>> {
    let mut body = resp.into_body();
    let mut data = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(request_error)?;
        if let Some(chunk) = frame.data_ref() {
            data.extend_from_slice(chunk);
            if data.len() > limit {
                return Err(Error::protocol("response body too large"));
            }
        }
    }
    Ok(data)
}

/// Read and discard the response body.
async fn drain(resp: Response<Incoming>) -> Result<()> {
    let mut body = resp.into_body();
    while let Some(frame) = body.frame().await {
        frame.map_err(request_error)?;
    }
    Ok(())
}

/// Build an error from an unexpected response, reading a bounded
/// amount of the body as the message.
async fn remote_error(resp: Response<Incoming>) -> Error {
    let code = resp.status().as_u16();
    let mut body = resp.into_body();
    let mut data = Vec::new();
    while data.len() < MAX_ERROR_BODY {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(chunk) = frame.data_ref() {
                    data.extend_from_slice(chunk);
                }
            }
            _ => break,
        }
    }
    data.truncate(MAX_ERROR_BODY);
    // Errors are terminated by a newline; trim it to avoid double
    // newlines when displayed.
    let message = String::from_utf8_lossy(&data).trim_end().to_string();
    Error::Remote { code, message }
}

async fn write_all(dst: &mut dyn Backend, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = dst.write(buf).await?;
        if n == 0 {
            return Err(Error::internal("backend refused to make progress"));
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// Certificate verifier used with secure=false.
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct TestRequest {
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    }

    /// Read one HTTP/1.1 request. Returns None when the peer closed
    /// the connection.
    async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Option<TestRequest> {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte).await {
                Ok(0) => return None,
                Ok(_) => head.push(byte[0]),
                Err(_) => return None,
            }
        }

        let head = String::from_utf8(head).unwrap();
        let mut lines = head.split("\r\n");
        let mut request_line = lines.next().unwrap().split_whitespace();
        let method = request_line.next().unwrap().to_string();
        let path = request_line.next().unwrap().to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_lowercase(), value.trim().to_string());
            }
        }

        let length: usize = headers
            .get("content-length")
            .map(|v| v.parse().unwrap())
            .unwrap_or(0);
        let mut body = vec![0; length];
        stream.read_exact(&mut body).await.unwrap();

        Some(TestRequest {
            method,
            path,
            headers,
            body,
        })
    }

    async fn write_response<S: AsyncWrite + Unpin>(
        stream: &mut S,
        status: &str,
        headers: &[(&str, String)],
        body: &[u8],
    ) {
        let mut resp = format!("HTTP/1.1 {status}\r\ncontent-length: {}\r\n", body.len());
        for (name, value) in headers {
            resp.push_str(&format!("{name}: {value}\r\n"));
        }
        resp.push_str("\r\n");
        stream.write_all(resp.as_bytes()).await.unwrap();
        stream.write_all(body).await.unwrap();
        stream.flush().await.unwrap();
    }

    async fn start_server() -> (TcpListener, RemoteUrl) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url: RemoteUrl = format!("http://127.0.0.1:{port}/images/ticket")
            .parse()
            .unwrap();
        (listener, url)
    }

    fn options_body(features: &[&str], unix_socket: Option<&str>) -> Vec<u8> {
        let mut body = json!({
            "features": features,
            "max_readers": 8,
            "max_writers": 4,
        });
        if let Some(path) = unix_socket {
            body["unix_socket"] = path.into();
        }
        serde_json::to_vec(&body).unwrap()
    }

    #[tokio::test]
    async fn test_capabilities_and_read() {
        let (listener, url) = start_server().await;

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let req = read_request(&mut stream).await.unwrap();
            assert_eq!(req.method, "OPTIONS");
            assert_eq!(req.path, "/images/ticket");
            write_response(
                &mut stream,
                "200 OK",
                &[("content-type", "application/json".into())],
                &options_body(&["extents", "zero", "flush"], None),
            )
            .await;

            // Size discovery via extents.
            let req = read_request(&mut stream).await.unwrap();
            assert_eq!(req.method, "GET");
            assert_eq!(req.path, "/images/ticket/extents?context=zero");
            let extents =
                serde_json::to_vec(&vec![ZeroExtent::new(0, 100, false, false)]).unwrap();
            write_response(&mut stream, "200 OK", &[], &extents).await;

            // Ranged read.
            let req = read_request(&mut stream).await.unwrap();
            assert_eq!(req.method, "GET");
            assert_eq!(req.headers["range"], "bytes=0-9");
            write_response(&mut stream, "206 Partial Content", &[], b"0123456789").await;
        });

        let options = Options::default();
        let mut backend = HttpBackend::open(url, &options).await.unwrap();
        assert!(backend.can_extents);
        assert!(backend.can_zero);
        assert!(backend.can_flush);
        assert_eq!(backend.max_readers(), 8);
        assert_eq!(backend.max_writers(), 4);

        assert_eq!(backend.size().await.unwrap(), 100);

        let mut buf = [0u8; 10];
        let n = backend.readinto(&mut buf).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf, b"0123456789");
        assert_eq!(backend.tell(), 10);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_options_support() {
        let (listener, url) = start_server().await;

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let req = read_request(&mut stream).await.unwrap();
            assert_eq!(req.method, "OPTIONS");
            write_response(&mut stream, "405 Method Not Allowed", &[], b"").await;

            // Size discovery emulates HEAD with a GET; the client
            // drops the connection after the headers.
            let req = read_request(&mut stream).await.unwrap();
            assert_eq!(req.method, "GET");
            assert!(!req.headers.contains_key("range"));
            let head = b"HTTP/1.1 200 OK\r\ncontent-length: 4096\r\n\r\n";
            stream.write_all(head).await.unwrap();
            stream.flush().await.unwrap();

            // The client reconnects for the next request.
            let (mut stream, _) = listener.accept().await.unwrap();
            let req = read_request(&mut stream).await.unwrap();
            assert_eq!(req.method, "PUT");
            assert_eq!(req.path, "/images/ticket");
            assert_eq!(req.headers["content-range"], "bytes 0-4/*");
            assert_eq!(req.body, b"hello");
            write_response(&mut stream, "200 OK", &[], b"").await;
        });

        let options = Options::default();
        let mut backend = HttpBackend::open(url, &options).await.unwrap();
        assert!(!backend.can_extents);
        assert!(!backend.can_zero);
        assert!(!backend.can_flush);
        assert_eq!(backend.max_readers(), 1);

        assert_eq!(backend.size().await.unwrap(), 4096);

        let n = backend.write(b"hello").await.unwrap();
        assert_eq!(n, 5);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_patch() {
        let (listener, url) = start_server().await;

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let req = read_request(&mut stream).await.unwrap();
            assert_eq!(req.method, "OPTIONS");
            write_response(
                &mut stream,
                "200 OK",
                &[],
                &options_body(&["extents", "zero"], None),
            )
            .await;

            let req = read_request(&mut stream).await.unwrap();
            assert_eq!(req.method, "PATCH");
            let msg: Value = serde_json::from_slice(&req.body).unwrap();
            // No flush feature, so the server must flush after zero.
            assert_eq!(
                msg,
                json!({"op": "zero", "offset": 512, "size": 1024, "flush": true})
            );
            write_response(&mut stream, "200 OK", &[], b"").await;
        });

        let options = Options::default();
        let mut backend = HttpBackend::open(url, &options).await.unwrap();
        backend.seek(SeekFrom::Start(512)).await.unwrap();
        let n = backend.zero(1024).await.unwrap();
        assert_eq!(n, 1024);
        assert_eq!(backend.tell(), 1536);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unix_socket_switch() {
        let dir = tempfile::TempDir::new().unwrap();
        let sock_path = dir.path().join("daemon.sock");
        let unix_listener = tokio::net::UnixListener::bind(&sock_path).unwrap();

        let (listener, url) = start_server().await;

        let sock = sock_path.to_string_lossy().to_string();
        let tcp_server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let req = read_request(&mut stream).await.unwrap();
            assert_eq!(req.method, "OPTIONS");
            write_response(
                &mut stream,
                "200 OK",
                &[],
                &options_body(&["extents"], Some(&sock)),
            )
            .await;
        });

        let unix_server = tokio::spawn(async move {
            let (mut stream, _) = unix_listener.accept().await.unwrap();
            let req = read_request(&mut stream).await.unwrap();
            assert_eq!(req.method, "GET");
            assert_eq!(req.headers["range"], "bytes=0-3");
            write_response(&mut stream, "206 Partial Content", &[], b"unix").await;
        });

        let options = Options::default();
        let mut backend = HttpBackend::open(url, &options).await.unwrap();
        // The peer is local, so the backend switched transports.
        backend.size = Some(100);

        let mut buf = [0u8; 4];
        backend.readinto(&mut buf).await.unwrap();
        assert_eq!(&buf, b"unix");

        tcp_server.await.unwrap();
        unix_server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response() {
        let (listener, url) = start_server().await;

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let req = read_request(&mut stream).await.unwrap();
            assert_eq!(req.method, "OPTIONS");
            write_response(&mut stream, "200 OK", &[], &options_body(&[], None)).await;

            let req = read_request(&mut stream).await.unwrap();
            assert_eq!(req.method, "PUT");
            write_response(
                &mut stream,
                "403 Forbidden",
                &[],
                b"You are not allowed to access this resource\n",
            )
            .await;
        });

        let options = Options::default();
        let mut backend = HttpBackend::open(url, &options).await.unwrap();
        let err = backend.write(b"data").await.unwrap_err();
        match err {
            Error::Remote { code, message } => {
                assert_eq!(code, 403);
                assert_eq!(message, "You are not allowed to access this resource");
            }
            other => panic!("unexpected error {other:?}"),
        }

        server.await.unwrap();
    }
}
