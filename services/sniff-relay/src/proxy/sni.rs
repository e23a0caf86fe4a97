//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! The bytes read from the client are fed to rustls' server-side
//! [`Acceptor`], which runs the real handshake state machine up to the point
//! where a complete ClientHello has been parsed (record reassembly included).
//! At that point the hello is captured and the acceptor is dropped. The
//! acceptor only ever sees a read-only byte slice, so nothing is written back
//! to the client, and alerts produced on rejection are discarded.
//!
//! rustls refuses some well-formed hellos on policy grounds (old protocol
//! versions, no `signature_algorithms`). Those are re-parsed by hand from the
//! reassembled handshake bytes so the SNI is still recovered.

use rustls::server::{Acceptor, ClientHello};
use rustls::{CipherSuite, SignatureScheme};
use tokio::io::AsyncRead;
use tracing::{debug, trace};

use super::peek::{PeekStream, Replay};
use crate::error::ExtractError;

/// Read size per call while collecting the ClientHello.
const READ_CHUNK: usize = 4096;

/// Fields captured from a parsed ClientHello.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// SNI hostname (normalized to lowercase, without trailing dot).
    pub server_name: Option<String>,
    /// ALPN protocols, in client preference order.
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Offered cipher suites.
    pub cipher_suites: Vec<CipherSuite>,
    /// Offered signature schemes.
    pub signature_schemes: Vec<SignatureScheme>,
    /// Bytes read from the client before the hello was complete.
    pub bytes_peeked: usize,
}

impl ClientHelloInfo {
    fn capture(hello: &ClientHello<'_>, bytes_peeked: usize) -> Self {
        Self {
            server_name: hello.server_name().and_then(normalize_server_name),
            alpn_protocols: hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default(),
            cipher_suites: hello.cipher_suites().to_vec(),
            signature_schemes: hello.signature_schemes().to_vec(),
            bytes_peeked,
        }
    }
}

/// Normalize: lowercase, trim trailing dot. Empty names count as absent.
fn normalize_server_name(name: &str) -> Option<String> {
    let normalized = name.trim_end_matches('.').to_ascii_lowercase();
    (!normalized.is_empty()).then_some(normalized)
}

/// Read from `stream` until a full ClientHello has been parsed.
///
/// Returns the captured hello and the stream rewound to its first byte.
/// At most `max_bytes` are read.
pub async fn read_client_hello<S: AsyncRead + Unpin>(
    stream: S,
    max_bytes: usize,
) -> Result<(ClientHelloInfo, Replay<S>), ExtractError> {
    let mut peek = PeekStream::new(stream);
    let mut acceptor = Acceptor::default();
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
        trace!(bytes = n, total = read_so_far + n, "Read handshake bytes");

        let mut input = &chunk[..n];
        while !input.is_empty() {
            if acceptor.read_tls(&mut input)? == 0 {
                break;
            }

            match acceptor.accept() {
                Ok(Some(accepted)) => {
                    let info = ClientHelloInfo::capture(&accepted.client_hello(), peek.peeked().len());
                    debug!(
                        server_name = info.server_name.as_deref().unwrap_or("-"),
                        bytes_peeked = info.bytes_peeked,
                        "ClientHello captured"
                    );
                    return Ok((info, peek.into_replay()));
                }
                Ok(None) => {}
                // The hello parsed but rustls' server policy refused it
                // (e.g. no signature_algorithms in a TLS 1.0-1.2 hello).
                Err((err @ rustls::Error::PeerIncompatible(_), _alert)) => {
                    let info = reassemble_handshake(peek.peeked())
                        .and_then(|hs| parse_client_hello(&hs, peek.peeked().len()));
                    return match info {
                        Some(info) => {
                            debug!(
                                server_name = info.server_name.as_deref().unwrap_or("-"),
                                bytes_peeked = info.bytes_peeked,
                                rustls_error = %err,
                                "ClientHello captured by fallback parser"
                            );
                            Ok((info, peek.into_replay()))
                        }
                        None => Err(ExtractError::Tls(err)),
                    };
                }
                // The alert is never sent; the client only sees us hang up.
                Err((err, _alert)) => return Err(ExtractError::Tls(err)),
            }
        }
    }
}

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
const EXT_ALPN: u16 = 0x0010;

/// Concatenate the payloads of the leading handshake records until one
/// complete handshake message is available.
fn reassemble_handshake(wire: &[u8]) -> Option<Vec<u8>> {
    let mut message = Vec::new();
    let mut pos = 0;

    loop {
        if message.len() >= 4 {
            let len = ((message[1] as usize) << 16)
                | ((message[2] as usize) << 8)
                | (message[3] as usize);
            if message.len() >= 4 + len {
                message.truncate(4 + len);
                return Some(message);
            }
        }

        let header = wire.get(pos..pos + 5)?;
        if header[0] != CONTENT_TYPE_HANDSHAKE {
            return None;
        }
        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        message.extend_from_slice(wire.get(pos + 5..pos + 5 + record_len)?);
        pos += 5 + record_len;
    }
}

/// Parse a ClientHello handshake message by hand.
///
/// ClientHello structure (after the 4-byte handshake header):
/// - 2 bytes: version
/// - 32 bytes: random
/// - 1 byte: session ID length, then the session ID
/// - 2 bytes: cipher suites length, then the suites
/// - 1 byte: compression methods length, then the methods
/// - 2 bytes: extensions length, then the extensions (absent in old hellos)
///
/// Returns `None` for anything malformed.
fn parse_client_hello(handshake: &[u8], bytes_peeked: usize) -> Option<ClientHelloInfo> {
    if handshake.first() != Some(&HANDSHAKE_CLIENT_HELLO) {
        return None;
    }
    let body = handshake.get(4..)?;

    // Skip version (2) + random (32)
    let mut pos = 34;
    pos += 1 + *body.get(pos)? as usize;

    let suites_len = read_u16(body, pos)? as usize;
    let suites = body.get(pos + 2..pos + 2 + suites_len)?;
    pos += 2 + suites_len;

    pos += 1 + *body.get(pos)? as usize;

    let mut info = ClientHelloInfo {
        cipher_suites: suites
            .chunks_exact(2)
            .map(|c| CipherSuite::from(u16::from_be_bytes([c[0], c[1]])))
            .collect(),
        bytes_peeked,
        ..ClientHelloInfo::default()
    };

    if pos == body.len() {
        return Some(info);
    }

    let extensions_len = read_u16(body, pos)? as usize;
    let extensions = body.get(pos + 2..pos + 2 + extensions_len)?;

    let mut pos = 0;
    while pos < extensions.len() {
        let ext_type = read_u16(extensions, pos)?;
        let ext_len = read_u16(extensions, pos + 2)? as usize;
        let data = extensions.get(pos + 4..pos + 4 + ext_len)?;

        match ext_type {
            EXT_SERVER_NAME => info.server_name = parse_server_name_extension(data)?,
            EXT_SIGNATURE_ALGORITHMS => {
                let list = data.get(2..2 + read_u16(data, 0)? as usize)?;
                info.signature_schemes = list
                    .chunks_exact(2)
                    .map(|c| SignatureScheme::from(u16::from_be_bytes([c[0], c[1]])))
                    .collect();
            }
            EXT_ALPN => info.alpn_protocols = parse_alpn_extension(data)?,
            _ => {}
        }

        pos += 4 + ext_len;
    }

    Some(info)
}

/// SNI extension: 2-byte list length, then entries of
/// (1-byte name type, 2-byte length, name). Only host_name (0) counts.
///
/// IP literals are ignored, as rustls does.
fn parse_server_name_extension(data: &[u8]) -> Option<Option<String>> {
    let list = data.get(2..2 + read_u16(data, 0)? as usize)?;

    let mut pos = 0;
    while pos < list.len() {
        let name_type = *list.get(pos)?;
        let name_len = read_u16(list, pos + 1)? as usize;
        let name = list.get(pos + 3..pos + 3 + name_len)?;

        if name_type == 0 {
            let name = std::str::from_utf8(name).ok()?;
            if name.parse::<std::net::IpAddr>().is_ok() {
                return Some(None);
            }
            return Some(normalize_server_name(name));
        }

        pos += 3 + name_len;
    }

    Some(None)
}

/// ALPN extension: 2-byte list length, then length-prefixed protocol names.
fn parse_alpn_extension(data: &[u8]) -> Option<Vec<Vec<u8>>> {
    let list = data.get(2..2 + read_u16(data, 0)? as usize)?;

    let mut protocols = Vec::new();
    let mut pos = 0;
    while pos < list.len() {
        let len = *list.get(pos)? as usize;
        protocols.push(list.get(pos + 1..pos + 1 + len)?.to_vec());
        pos += 1 + len;
    }
    Some(protocols)
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    let bytes = data.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
