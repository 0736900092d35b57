//! Response body framing and the content-decoder chain.
//!
//! Framing is decided by the headers (chunked, fixed length, or read to
//! end of stream); the decoded byte stream is then pushed through zero or
//! more decoders (`gzip`, raw `deflate`, `br`) in the order the headers
//! listed them, ending at the body sink.

use flate2::{Decompress, FlushDecompress, Status};

use crate::engine::ring;
use crate::engine::{EngineError, StreamView};

pub enum Framing {
    Chunked,
    Fixed(u64),
    UntilEof,
}

pub trait BodyDecoder {
    fn push(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), EngineError>;
    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), EngineError>;
}

struct FlateDecoder {
    inner: Decompress,
    what: &'static str,
    ended: bool,
}

impl FlateDecoder {
    fn gzip() -> Self {
        FlateDecoder {
            inner: Decompress::new_gzip(15),
            what: "gzip",
            ended: false,
        }
    }

    fn deflate() -> Self {
        FlateDecoder {
            inner: Decompress::new(false),
            what: "deflate",
            ended: false,
        }
    }
}

impl BodyDecoder for FlateDecoder {
    fn push(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> Result<(), EngineError> {
        while !input.is_empty() && !self.ended {
            let mut obuf = [0u8; 4096];
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            let status = self
                .inner
                .decompress(input, &mut obuf, FlushDecompress::None)
                .map_err(|e| {
                    EngineError::violation(format!("{} stream error: {}", self.what, e))
                })?;
            let consumed = (self.inner.total_in() - before_in) as usize;
            let produced = (self.inner.total_out() - before_out) as usize;
            out.extend_from_slice(&obuf[..produced]);
            input = &input[consumed..];
            match status {
                Status::StreamEnd => self.ended = true,
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<(), EngineError> {
        if !self.ended {
            return Err(EngineError::violation(format!(
                "{} compressed data incomplete",
                self.what
            )));
        }
        Ok(())
    }
}

struct BrotliDecoder {
    state: brotli::BrotliState<
        brotli::enc::StandardAlloc,
        brotli::enc::StandardAlloc,
        brotli::enc::StandardAlloc,
    >,
    ended: bool,
}

impl BrotliDecoder {
    fn new() -> Self {
        BrotliDecoder {
            state: brotli::BrotliState::new(
                brotli::enc::StandardAlloc::default(),
                brotli::enc::StandardAlloc::default(),
                brotli::enc::StandardAlloc::default(),
            ),
            ended: false,
        }
    }
}

impl BodyDecoder for BrotliDecoder {
    fn push(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), EngineError> {
        let mut input_offset = 0usize;
        let mut avail_in = input.len();
        while !self.ended {
            let mut obuf = [0u8; 4096];
            let mut output_offset = 0usize;
            let mut avail_out = obuf.len();
            let mut written = 0usize;
            let res = brotli::BrotliDecompressStream(
                &mut avail_in,
                &mut input_offset,
                input,
                &mut avail_out,
                &mut output_offset,
                &mut obuf,
                &mut written,
                &mut self.state,
            );
            out.extend_from_slice(&obuf[..output_offset]);
            match res {
                brotli::BrotliResult::ResultSuccess => {
                    self.ended = true;
                }
                brotli::BrotliResult::NeedsMoreOutput => continue,
                brotli::BrotliResult::NeedsMoreInput => {
                    if avail_in == 0 {
                        break;
                    }
                }
                brotli::BrotliResult::ResultFailure => {
                    return Err(EngineError::violation("brotli stream error"));
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<(), EngineError> {
        if !self.ended {
            return Err(EngineError::violation("brotli compressed data incomplete"));
        }
        Ok(())
    }
}

pub struct DecoderChain {
    stages: Vec<Box<dyn BodyDecoder>>,
}

impl DecoderChain {
    /// Build the chain from encoding tokens in listed order. `identity` is
    /// skipped; anything else unrecognized is a protocol error.
    pub fn build(tokens: &[Vec<u8>]) -> Result<Self, EngineError> {
        let mut stages: Vec<Box<dyn BodyDecoder>> = Vec::new();
        for token in tokens {
            let token = token.to_ascii_lowercase();
            match token.as_slice() {
                b"identity" => continue,
                b"gzip" => stages.push(Box::new(FlateDecoder::gzip())),
                b"deflate" => stages.push(Box::new(FlateDecoder::deflate())),
                b"br" => stages.push(Box::new(BrotliDecoder::new())),
                other => {
                    let name = String::from_utf8_lossy(other).into_owned();
                    log::info!("Unsupported encoding \"{}\"", name);
                    return Err(EngineError::violation(format!(
                        "unsupported encoding \"{}\"",
                        name
                    )));
                }
            }
        }
        Ok(DecoderChain { stages })
    }

    pub fn push(
        &mut self,
        input: &[u8],
        out: &mut dyn FnMut(&[u8]),
    ) -> Result<(), EngineError> {
        if self.stages.is_empty() {
            if !input.is_empty() {
                out(input);
            }
            return Ok(());
        }
        let mut cur = input.to_vec();
        for stage in &mut self.stages {
            let mut next = Vec::new();
            stage.push(&cur, &mut next)?;
            cur = next;
        }
        if !cur.is_empty() {
            out(&cur);
        }
        Ok(())
    }

    /// Validate completeness of every stage, flushing any trailing output
    /// through the stages after it.
    pub fn finish(&mut self, out: &mut dyn FnMut(&[u8])) -> Result<(), EngineError> {
        let n = self.stages.len();
        for i in 0..n {
            let mut cur = Vec::new();
            self.stages[i].finish(&mut cur)?;
            for j in i + 1..n {
                let mut next = Vec::new();
                self.stages[j].push(&cur, &mut next)?;
                cur = next;
            }
            if !cur.is_empty() {
                out(&cur);
            }
        }
        Ok(())
    }
}

fn parse_hex(digits: &[u8]) -> Result<u64, EngineError> {
    let s = std::str::from_utf8(digits)
        .map_err(|_| EngineError::violation("bad chunk size"))?;
    u64::from_str_radix(s, 16).map_err(|_| EngineError::violation("bad chunk size"))
}

async fn read_fixed(
    view: &StreamView,
    o: &mut u32,
    mut remaining: u64,
    chain: &mut DecoderChain,
    out: &mut dyn FnMut(&[u8]),
) -> Result<(), EngineError> {
    while remaining > 0 {
        let want = std::cmp::min(remaining, 4096) as usize;
        let chunk = view.read(*o, want, want, true).await?;
        remaining -= chunk.len() as u64;
        *o = ring::advance(*o, chunk.len());
        chain.push(&chunk, out)?;
    }
    Ok(())
}

async fn read_chunked(
    view: &StreamView,
    o: &mut u32,
    chain: &mut DecoderChain,
    out: &mut dyn FnMut(&[u8]),
) -> Result<(), EngineError> {
    loop {
        let (after_size, size_hex) = view
            .match_pred(*o, |b, _| b.is_ascii_alphanumeric(), 1, 8, true)
            .await?;
        *o = view.match_crlf(after_size).await?;
        let size = parse_hex(&size_hex)?;
        if size == 0 {
            return Ok(());
        }
        read_fixed(view, o, size, chain, out).await?;
        *o = view.match_crlf(*o).await?;
    }
}

/// Consume one response body with the given framing, pushing decoded bytes
/// into `out`. The offset lands on the first byte after the body (before
/// any trailer block).
pub async fn read_body(
    view: &StreamView,
    o: &mut u32,
    framing: Framing,
    chain: &mut DecoderChain,
    out: &mut dyn FnMut(&[u8]),
) -> Result<(), EngineError> {
    match framing {
        Framing::Chunked => read_chunked(view, o, chain, out).await,
        Framing::Fixed(n) => read_fixed(view, o, n, chain, out).await,
        Framing::UntilEof => {
            while !view.is_eof() {
                match view.read(*o, 1, 4096, true).await {
                    Ok(chunk) => {
                        *o = ring::advance(*o, chunk.len());
                        chain.push(&chunk, out)?;
                    }
                    Err(EngineError::Eof) => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
    }
}

/// Read and discard a fixed-length request body, consuming as it goes.
pub async fn skip_fixed(
    view: &StreamView,
    o: &mut u32,
    mut remaining: u64,
) -> Result<(), EngineError> {
    while remaining > 0 {
        let want = std::cmp::min(remaining, 4096) as usize;
        let chunk = view.read(*o, want, want, true).await?;
        remaining -= chunk.len() as u64;
        *o = ring::advance(*o, chunk.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn run_chain(tokens: &[&[u8]], input: &[u8]) -> Result<Vec<u8>, EngineError> {
        let owned: Vec<Vec<u8>> = tokens.iter().map(|t| t.to_vec()).collect();
        let mut chain = DecoderChain::build(&owned)?;
        let mut got = Vec::new();
        {
            let mut sink = |chunk: &[u8]| got.extend_from_slice(chunk);
            // push one byte at a time to exercise streaming
            for b in input {
                chain.push(std::slice::from_ref(b), &mut sink)?;
            }
            chain.finish(&mut sink)?;
        }
        Ok(got)
    }

    fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_gzip_chain() {
        let compressed = gzip_bytes(b"abc");
        assert_eq!(run_chain(&[b"gzip"], &compressed).unwrap(), b"abc");
    }

    #[test]
    fn test_deflate_chain_is_raw() {
        let mut enc =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"hello deflate").unwrap();
        let compressed = enc.finish().unwrap();
        assert_eq!(
            run_chain(&[b"deflate"], &compressed).unwrap(),
            b"hello deflate"
        );
    }

    #[test]
    fn test_identity_is_skipped() {
        assert_eq!(run_chain(&[b"identity"], b"plain").unwrap(), b"plain");
    }

    #[test]
    fn test_unknown_encoding_rejected() {
        assert!(matches!(
            DecoderChain::build(&[b"zstd".to_vec()]),
            Err(EngineError::Violation(_))
        ));
    }

    #[test]
    fn test_truncated_gzip_flagged() {
        let compressed = gzip_bytes(b"abcdefghij");
        let truncated = &compressed[..compressed.len() - 4];
        let owned = vec![b"gzip".to_vec()];
        let mut chain = DecoderChain::build(&owned).unwrap();
        let mut sink = |_: &[u8]| {};
        chain.push(truncated, &mut sink).unwrap();
        assert!(matches!(
            chain.finish(&mut sink),
            Err(EngineError::Violation(_))
        ));
    }

    #[test]
    fn test_stacked_decoders_apply_in_listed_order() {
        // body was deflated first, then gzipped: the header order
        // (gzip, deflate) undoes the gzip layer first
        let mut enc =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"stacked").unwrap();
        let inner = enc.finish().unwrap();
        let outer = gzip_bytes(&inner);
        assert_eq!(
            run_chain(&[b"gzip", b"deflate"], &outer).unwrap(),
            b"stacked"
        );
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex(b"5").unwrap(), 5);
        assert_eq!(parse_hex(b"1A").unwrap(), 26);
        assert!(parse_hex(b"g").is_err());
    }
}
