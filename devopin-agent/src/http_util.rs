use std::{io, pin::Pin, time::Duration};

use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, Request, Response, Uri, header, request, response};
use itertools::Itertools;
use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, lookup_host},
    task::JoinSet,
};
use tokio_native_tls::{TlsConnector as TokioTlsConnector, TlsStream, native_tls::TlsConnector};

const HAPPY_EYEBALLS_DELAY: Duration = Duration::from_millis(150);
const MAX_HEADERS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unable to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("all connection attempts to {0} failed")]
    Connect(String),
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_native_tls::native_tls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed HTTP response: {0}")]
    MalformedResponse(String),
    #[error("backend answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<http::Error> for NetworkError {
    fn from(e: http::Error) -> Self {
        NetworkError::MalformedResponse(e.to_string())
    }
}

pub enum MaybeTlsStream<S> {
    Plain(S),
    Tls(TlsStream<S>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

fn invalid_url(uri: &Uri, reason: &str) -> NetworkError {
    NetworkError::InvalidUrl {
        url: uri.to_string(),
        reason: reason.to_owned(),
    }
}

/// Request with the headers every backend call carries.
pub fn request_builder(uri: &Uri, method: Method) -> Result<request::Builder, NetworkError> {
    if !matches!(uri.scheme_str(), Some("http" | "https")) {
        return Err(invalid_url(uri, "scheme must be http or https"));
    }
    let authority = uri
        .authority()
        .ok_or_else(|| invalid_url(uri, "no host name"))?
        .as_str();
    let host = authority
        .find('@')
        .map(|idx| authority.split_at(idx + 1).1)
        .unwrap_or(authority);
    if host.is_empty() {
        return Err(invalid_url(uri, "empty host name"));
    }

    Ok(Request::builder()
        .method(method)
        .header(header::HOST, host)
        .header(header::CONNECTION, "close")
        .header(header::ACCEPT_ENCODING, "identity")
        .header(header::USER_AGENT, concat!("devopin-agent/", env!("CARGO_PKG_VERSION")))
        .uri(uri))
}

/// Sends `req` over a fresh connection and reads the response until EOF.
pub async fn send_http_request(
    req: Request<Bytes>,
    prefer_ipv6: bool,
) -> Result<Response<Bytes>, NetworkError> {
    let stream = &mut connect(req.uri(), prefer_ipv6).await?;

    stream.write_all(&assemble_http_request(&req)).await?;
    stream.flush().await?;

    let mut buffer = BytesMut::with_capacity(1024);
    while stream.read_buf(&mut buffer).await? != 0 {}

    let buffer = buffer.freeze();
    trace!("response: {:?}", String::from_utf8_lossy(&buffer));
    parse_http_response(buffer)
}

pub async fn connect(uri: &Uri, prefer_ipv6: bool) -> Result<MaybeTlsStream<TcpStream>, NetworkError> {
    let tls = uri.scheme_str() == Some("https");
    let domain = uri.host().ok_or_else(|| invalid_url(uri, "no host name"))?;
    // bracketed IPv6 literals resolve without the brackets
    let domain = domain.trim_start_matches('[').trim_end_matches(']');
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    trace!("connecting to ({domain}, {port})");
    let stream = connect_happy_eyeballs(domain, port, prefer_ipv6).await?;

    Ok(if tls {
        let connector = TokioTlsConnector::from(TlsConnector::new()?);
        MaybeTlsStream::Tls(connector.connect(domain, stream).await?)
    } else {
        MaybeTlsStream::Plain(stream)
    })
}

async fn connect_happy_eyeballs(
    host: &str,
    port: u16,
    prefer_ipv6: bool,
) -> Result<TcpStream, NetworkError> {
    let addrs = {
        let (v4, v6): (Vec<_>, Vec<_>) = lookup_host((host, port))
            .await
            .map_err(|source| NetworkError::Resolve {
                host: host.to_owned(),
                source,
            })?
            .partition(|a| a.is_ipv4());

        let (first, second) = if prefer_ipv6 { (v6, v4) } else { (v4, v6) };
        first.into_iter().interleave(second).collect::<Vec<_>>()
    };

    let mut attempts = JoinSet::new();
    let handle_attempt_result = |res: Result<io::Result<TcpStream>, tokio::task::JoinError>| match res {
        Ok(Ok(stream)) => {
            debug!(
                "connection established with {}",
                stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "<unknown>".to_owned())
            );
            Some(stream)
        }
        Ok(Err(e)) => {
            trace!("connection attempt failed: {e}");
            None
        }
        Err(e) => {
            trace!("connection attempt panicked: {e}");
            None
        }
    };
    for addr in addrs {
        attempts.spawn(TcpStream::connect(addr));
        // give the newest attempt a head start before racing the next address
        while let Some(res) = tokio::select! {
            biased;
            res = attempts.join_next() => res,
            _ = tokio::time::sleep(HAPPY_EYEBALLS_DELAY) => None,
        } {
            if let Some(stream) = handle_attempt_result(res) {
                return Ok(stream);
            }
        }
    }

    while let Some(res) = attempts.join_next().await {
        if let Some(stream) = handle_attempt_result(res) {
            return Ok(stream);
        }
    }

    Err(NetworkError::Connect(format!("{host}:{port}")))
}

fn assemble_http_request(req: &Request<Bytes>) -> Bytes {
    let mut buffer = BytesMut::with_capacity(256 + req.body().len());

    buffer.put_slice(
        format!(
            "{} {} {:?}\r\n",
            req.method(),
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/"),
            req.version()
        )
        .as_bytes(),
    );

    for (name, value) in req.headers() {
        buffer.put_slice(name.as_str().as_bytes());
        buffer.put_slice(b": ");
        buffer.put(value.as_bytes());
        buffer.put_slice(b"\r\n");
    }
    buffer.put_slice(b"\r\n");
    buffer.put_slice(req.body());

    buffer.freeze()
}

fn parse_http_response(bytes: Bytes) -> Result<Response<Bytes>, NetworkError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let body_start = match resp.parse(&bytes) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            return Err(NetworkError::MalformedResponse("incomplete response head".to_owned()));
        }
        Err(e) => return Err(NetworkError::MalformedResponse(e.to_string())),
    };

    let mut builder = response::Builder::new()
        .status(resp.code.unwrap_or(200))
        .version(match resp.version.unwrap_or(1) {
            0 => http::Version::HTTP_10,
            _ => http::Version::HTTP_11,
        });
    let mut chunked = false;
    for header in resp.headers.iter() {
        if header.name.eq_ignore_ascii_case(header::TRANSFER_ENCODING.as_str()) {
            chunked = String::from_utf8_lossy(header.value)
                .to_ascii_lowercase()
                .contains("chunked");
        }
        builder = builder.header(header.name, header.value);
    }

    let body = bytes.slice(body_start..);
    let body = if chunked { decode_chunked(&body)? } else { body };

    Ok(builder.body(body)?)
}

fn decode_chunked(mut input: &[u8]) -> Result<Bytes, NetworkError> {
    let mut body = BytesMut::with_capacity(input.len());
    loop {
        let (consumed, size) = match httparse::parse_chunk_size(input) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            Ok(httparse::Status::Partial) => {
                return Err(NetworkError::MalformedResponse("truncated chunk header".to_owned()));
            }
            Err(_) => {
                return Err(NetworkError::MalformedResponse("invalid chunk size".to_owned()));
            }
        };
        input = &input[consumed..];
        if size == 0 {
            return Ok(body.freeze());
        }

        let size = usize::try_from(size)
            .ok()
            .filter(|size| size.saturating_add(2) <= input.len())
            .ok_or_else(|| NetworkError::MalformedResponse("truncated chunk".to_owned()))?;
        body.put_slice(&input[..size]);
        if &input[size..size + 2] != b"\r\n" {
            return Err(NetworkError::MalformedResponse("chunk without CRLF".to_owned()));
        }
        input = &input[size + 2..];
    }
}
