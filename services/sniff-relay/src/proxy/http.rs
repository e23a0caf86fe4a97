//! Host extraction from a plaintext HTTP/1.x request head.

use tokio::io::AsyncRead;
use tracing::debug;

use super::peek::{PeekStream, Replay};
use crate::error::ExtractError;

/// Header slots tried first. Larger heads are re-parsed with more slots.
const INITIAL_HEADER_SLOTS: usize = 64;

/// Read size per call while collecting the request head.
const READ_CHUNK: usize = 2048;

/// The parts of a request head the relay cares about.
#[derive(Debug)]
struct RequestHead {
    method: String,
    path: String,
    host: Option<String>,
}

/// Read one request head from `stream` and return its `Host` header value
/// without the port, plus the stream rewound to its first byte.
///
/// At most `max_bytes` are read. The body, if any, is not read on purpose
/// beyond what arrived in the same reads as the head.
pub async fn read_http_host<S: AsyncRead + Unpin>(
    stream: S,
    max_bytes: usize,
) -> Result<(String, Replay<S>), ExtractError> {
    let mut peek = PeekStream::new(stream);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read_so_far = peek.peeked().len();
        if read_so_far >= max_bytes {
            return Err(ExtractError::TooLarge { limit: max_bytes });
        }

        let want = READ_CHUNK.min(max_bytes - read_so_far);
        let n = peek.peek_read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(ExtractError::Truncated { read: read_so_far });
        }

        let Some(head) = parse_head(peek.peeked())? else {
            continue;
        };

        let host = head.host.ok_or(ExtractError::NoHostname("request headers"))?;
        let host = strip_port(&host);
        if host.is_empty() {
            return Err(ExtractError::NoHostname("Host header"));
        }

        debug!(
            method = %head.method,
            path = %head.path,
            host = %host,
            "Request head parsed"
        );
        let host = host.to_string();
        return Ok((host, peek.into_replay()));
    }
}

/// Parse the request head in `buf`; `None` while it is incomplete.
///
/// The header count is bounded only by `buf`: each header line takes at
/// least 3 bytes (`a:\n`), so `buf.len() / 3 + 1` slots always suffice.
fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, httparse::Error> {
    let mut slots = INITIAL_HEADER_SLOTS;

    loop {
        let mut headers = vec![httparse::EMPTY_HEADER; slots];
        let mut request = httparse::Request::new(&mut headers);

        match request.parse(buf) {
            Ok(httparse::Status::Partial) => return Ok(None),
            Ok(httparse::Status::Complete(_)) => {
                let host = request
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("host"))
                    .map(|h| String::from_utf8_lossy(h.value).trim().to_string());

                return Ok(Some(RequestHead {
                    method: request.method.unwrap_or("-").to_string(),
                    path: request.path.unwrap_or("-").to_string(),
                    host,
                }));
            }
            Err(httparse::Error::TooManyHeaders) if slots < buf.len() / 3 + 1 => {
                slots = buf.len() / 3 + 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Drop a `:port` suffix. Bracketed IPv6 literals lose their brackets.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or_default();
    }
    host.split(':').next().unwrap_or_default()
}
