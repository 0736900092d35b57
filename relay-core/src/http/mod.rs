//! HTTP/1.x reference interceptor.
//!
//! A faithful observer: it parses requests and responses byte-by-byte off
//! the shared shadow buffers, identifies the stream as HTTP after the
//! first request line, runs transparently (never rewriting), follows the
//! CONNECT and Upgrade handovers, and feeds decoded response bodies to the
//! optional body-sink command.

pub mod body;
pub mod sink;

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::RwLock;

use async_trait::async_trait;
use lazy_static::lazy_static;

use crate::engine::ring;
use crate::engine::{EngineError, Instance, ProtocolPlugin, StreamView};
use body::{read_body, skip_fixed, DecoderChain, Framing};
use sink::BodySink;

lazy_static! {
    static ref CONTENT_RANGE: regex::bytes::Regex =
        regex::bytes::Regex::new(r"^([0-9]+)-([0-9]+)/([0-9]+|\*)$").unwrap();
}

pub struct HttpPlugin {
    sink_cmd: RwLock<Option<PathBuf>>,
}

impl HttpPlugin {
    pub fn new() -> Self {
        HttpPlugin {
            sink_cmd: RwLock::new(None),
        }
    }
}

impl Default for HttpPlugin {
    fn default() -> Self {
        Self::new()
    }
}

struct RequestLine {
    method: Vec<u8>,
    target: Vec<u8>,
}

fn parse_dec(digits: &[u8]) -> Result<u64, EngineError> {
    let s = std::str::from_utf8(digits)
        .map_err(|_| EngineError::violation("bad integer in header"))?;
    s.trim()
        .parse::<u64>()
        .map_err(|_| EngineError::violation("bad integer in header"))
}

/// A value that arrives wrapped in double quotes is a JSON string literal.
fn finish_value(value: Vec<u8>) -> Result<Vec<u8>, EngineError> {
    let trimmed = value.trim_ascii();
    if !trimmed.is_empty() && trimmed[0] == b'"' && trimmed[trimmed.len() - 1] == b'"' {
        let s: String = serde_json::from_slice(trimmed)
            .map_err(|e| EngineError::violation(format!("bad quoted header value: {}", e)))?;
        return Ok(s.into_bytes());
    }
    Ok(trimmed.to_vec())
}

/// `bytes <start>-<end>/<length|*>`, exposed as `(start, end+1, length?)`
/// when internally consistent.
fn parse_content_range(value: &[u8]) -> Result<Option<(u64, u64, Option<u64>)>, EngineError> {
    let Some(rest) = value.strip_prefix(b"bytes ") else {
        return Ok(None);
    };
    let Some(caps) = CONTENT_RANGE.captures(rest.trim_ascii()) else {
        return Ok(None);
    };
    let start = parse_dec(&caps[1])?;
    let end = parse_dec(&caps[2])? + 1;
    let full = if &caps[3] == b"*" {
        None
    } else {
        Some(parse_dec(&caps[3])?)
    };
    if start < end && full.map_or(true, |f| end <= f) {
        Ok(Some((start, end, full)))
    } else {
        Ok(None)
    }
}

async fn parse_request_line(
    client: &StreamView,
    o: u32,
) -> Result<(u32, RequestLine), EngineError> {
    let (o, method) = client
        .match_pred(o, |x, _| x.is_ascii_uppercase(), 3, 10, true)
        .await?;
    let (o, _) = client.match_bytes(o, b" ", true).await?;
    let (o, target) = client
        .match_pred(o, |x, _| (33..=126).contains(&x), 1, 2048, true)
        .await?;
    let (o, _) = client.match_bytes(o, b" HTTP/1.", true).await?;
    let (o, _version) = client
        .match_pred(o, |x, _| x == b'0' || x == b'1', 1, 1, true)
        .await?;
    let o = client.match_crlf(o).await?;
    Ok((o, RequestLine { method, target }))
}

async fn parse_response_line(server: &StreamView, o: u32) -> Result<(u32, u16), EngineError> {
    let (o, _) = server.match_bytes(o, b"HTTP/1.", true).await?;
    let (o, _version) = server
        .match_pred(o, |x, _| x == b'0' || x == b'1', 1, 1, true)
        .await?;
    let (o, _) = server.match_bytes(o, b" ", true).await?;
    let (o, code) = server
        .match_pred(o, |x, _| x.is_ascii_digit(), 1, 3, true)
        .await?;
    let (o, _) = server.match_bytes(o, b" ", true).await?;
    let (o, _reason) = server
        .match_pred(o, |x, _| (32..=126).contains(&x), 0, 2048, true)
        .await?;
    let o = server.match_crlf(o).await?;
    let code = parse_dec(&code)? as u16;
    Ok((o, code))
}

/// One header line, or `None` at the end of the block. Obs-fold
/// continuations (a following line starting with SP) are appended to the
/// previous value, so the peeked byte of the *next* line stays unconsumed
/// until the header is complete.
async fn parse_header(
    view: &StreamView,
    mut o: u32,
) -> Result<(u32, Option<(Vec<u8>, Vec<u8>)>), EngineError> {
    let mut pending: Option<(Vec<u8>, Vec<u8>)> = None;
    loop {
        let first = view.read(o, 1, 1, false).await?;
        o = ring::advance(o, 1);
        if first[0] == b' ' {
            view.consume(o);
            let (name, mut value) = pending.take().ok_or_else(|| {
                EngineError::violation("header continuation without a header")
            })?;
            let room = (8 * 1024usize).saturating_sub(value.len());
            if room == 0 {
                return Err(EngineError::violation("header value too long"));
            }
            let (after, cont) = view
                .match_pred(o, |x, _| (32..=126).contains(&x), 1, room, true)
                .await?;
            value.extend_from_slice(&cont);
            o = view.match_crlf(after).await?;
            pending = Some((name, value));
            continue;
        }
        if let Some((name, value)) = pending.take() {
            return Ok((o.wrapping_sub(1), Some((name, finish_value(value)?))));
        }
        view.consume(o);
        if first[0] == b'\r' {
            let (o, _) = view.match_bytes(o, b"\n", true).await?;
            return Ok((o, None));
        }
        if first[0] == b'\n' {
            return Ok((o, None));
        }
        if !(33..=126).contains(&first[0]) {
            return Err(EngineError::Mismatch);
        }
        let (after, rest) = view
            .match_pred(o, |x, _| (33..=126).contains(&x) && x != b':', 1, 255, true)
            .await?;
        let mut name = first.to_vec();
        name.extend_from_slice(&rest);
        let (after, _) = view.match_bytes(after, b":", true).await?;
        let (after, value) = view
            .match_pred(after, |x, _| (32..=126).contains(&x), 1, 8 * 1024, true)
            .await?;
        o = view.match_crlf(after).await?;
        pending = Some((name, value));
    }
}

#[async_trait(?Send)]
impl ProtocolPlugin for HttpPlugin {
    fn init(&self) -> Result<(), EngineError> {
        let cmd = std::env::var_os("SAVE_HTTP_FILES").map(PathBuf::from);
        match &cmd {
            Some(path) => log::info!("http: response bodies go to {}", path.display()),
            None => log::debug!("http: no body sink configured"),
        }
        *self.sink_cmd.write().unwrap() = cmd;
        Ok(())
    }

    async fn intercept(
        &self,
        inst: Rc<Instance>,
        client: StreamView,
        server: StreamView,
    ) -> Result<(), EngineError> {
        let sink_cmd = self.sink_cmd.read().unwrap().clone();
        let mut co = client.replied();
        let mut so = server.replied();

        // A faithful observer: everything consumed is released as soon as
        // it arrives, in both directions.
        client.set_transparent(true);
        server.set_transparent(true);

        loop {
            // request half
            server.expect_silence(true);
            client.expect_silence(false);

            let (after, req) = parse_request_line(&client, co).await?;
            co = after;
            inst.identified();

            let mut host = Vec::new();
            let mut upgrade: Vec<u8> = Vec::new();
            let mut request_len = 0u64;
            loop {
                let (after, header) = parse_header(&client, co).await?;
                co = after;
                let Some((name, value)) = header else { break };
                match name.to_ascii_lowercase().as_slice() {
                    b"upgrade" => upgrade = value,
                    b"host" => host = value,
                    b"content-length" => request_len = parse_dec(&value)?,
                    _ => {}
                }
            }
            skip_fixed(&client, &mut co, request_len).await?;

            // response half
            client.expect_silence(true);
            server.expect_silence(false);

            let (code, resp_len, mut te, ce, range) = loop {
                let (after, code) = parse_response_line(&server, so).await?;
                so = after;

                if req.method == b"CONNECT" && code / 100 == 2 {
                    // consume the (blank) response head, then restart the
                    // race on whatever tunnels through
                    loop {
                        let (after, header) = parse_header(&server, so).await?;
                        so = after;
                        if header.is_none() {
                            break;
                        }
                    }
                    inst.protocol_changed(None);
                    return Ok(());
                }

                let mut resp_len: Option<u64> = None;
                let mut te: Vec<Vec<u8>> = Vec::new();
                let mut ce: Vec<Vec<u8>> = Vec::new();
                let mut range: Option<(u64, u64, Option<u64>)> = None;
                loop {
                    let (after, header) = parse_header(&server, so).await?;
                    so = after;
                    let Some((name, value)) = header else { break };
                    match name.to_ascii_lowercase().as_slice() {
                        b"content-length" => resp_len = Some(parse_dec(&value)?),
                        b"transfer-encoding" => te.extend(
                            value
                                .split(|&b| b == b',')
                                .map(|t| t.trim_ascii().to_vec()),
                        ),
                        b"content-encoding" => ce.extend(
                            value
                                .split(|&b| b == b',')
                                .map(|t| t.trim_ascii().to_vec()),
                        ),
                        b"content-range" if code == 206 => {
                            range = parse_content_range(&value)?;
                        }
                        _ => {}
                    }
                }

                if !upgrade.is_empty() && code == 101 {
                    let token = String::from_utf8_lossy(&upgrade).into_owned();
                    inst.protocol_changed(Some(&token));
                    return Ok(());
                }

                // the Upgrade token stays live across interim responses: a
                // 100 before the 101 must not disarm the handover
                if code / 100 != 1 {
                    break (code, resp_len, te, ce, range);
                }
                // interim response: loop for the final one on this request
            };

            let mut has_trailer = false;
            let framing = if !te.is_empty() {
                if !te[0].eq_ignore_ascii_case(b"chunked") {
                    return Err(EngineError::violation(
                        "first Transfer-Encoding isn't \"chunked\"",
                    ));
                }
                te.remove(0);
                has_trailer = true;
                Framing::Chunked
            } else if let Some(n) = resp_len {
                Framing::Fixed(n)
            } else {
                Framing::UntilEof
            };

            let tokens: Vec<Vec<u8>> = te.into_iter().chain(ce.into_iter()).collect();
            let mut chain = DecoderChain::build(&tokens)?;
            let mut body_sink = if code / 100 == 2 {
                sink_cmd
                    .as_deref()
                    .and_then(|cmd| BodySink::spawn(cmd, &host, &req.target, range))
            } else {
                None
            };
            {
                let mut deliver = |chunk: &[u8]| {
                    if let Some(s) = body_sink.as_mut() {
                        s.write(chunk);
                    }
                };
                read_body(&server, &mut so, framing, &mut chain, &mut deliver).await?;
                chain.finish(&mut deliver)?;
            }
            drop(body_sink);

            if has_trailer {
                loop {
                    let (after, trailer) = parse_header(&server, so).await?;
                    so = after;
                    if trailer.is_none() {
                        break;
                    }
                }
            }

            log::info!(
                "{} {} {} -> {}",
                inst.tag(),
                String::from_utf8_lossy(&req.method),
                String::from_utf8_lossy(&req.target),
                code
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dec() {
        assert_eq!(parse_dec(b"42").unwrap(), 42);
        assert_eq!(parse_dec(b" 42 ").unwrap(), 42);
        assert!(parse_dec(b"").is_err());
        assert!(parse_dec(b"4x2").is_err());
    }

    #[test]
    fn test_finish_value_plain() {
        assert_eq!(finish_value(b"  text/html ".to_vec()).unwrap(), b"text/html");
    }

    #[test]
    fn test_finish_value_json_string() {
        assert_eq!(
            finish_value(b"\"a \\\"quoted\\\" token\"".to_vec()).unwrap(),
            b"a \"quoted\" token"
        );
        assert!(finish_value(b"\"broken".to_vec()).is_ok()); // no closing quote: literal
        assert!(finish_value(b"\"bad \\x escape\"".to_vec()).is_err());
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range(b"bytes 0-99/200").unwrap(),
            Some((0, 100, Some(200)))
        );
        assert_eq!(
            parse_content_range(b"bytes 5-9/*").unwrap(),
            Some((5, 10, None))
        );
        // end past the advertised full length is inconsistent
        assert_eq!(parse_content_range(b"bytes 10-300/200").unwrap(), None);
        // start must precede end
        assert_eq!(parse_content_range(b"bytes 9-5/20").unwrap(), None);
        assert_eq!(parse_content_range(b"items 0-1/2").unwrap(), None);
    }
}
