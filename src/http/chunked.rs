//! Chunked transfer encoding support
//!
//! Encoding helpers used by the request writer, plus one-shot encoding and
//! decoding of complete chunked bodies built on the response parser.

use super::parser::{BodyMode, ParserOptions, ResponseParser};
use super::{Error, Headers, ParseError, ParseErrorKind, Result, CRLF};

/// The terminating zero-length chunk with no trailers
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Append one chunk: `<hex-size>\r\n<bytes>\r\n`
///
/// Empty input writes nothing, since a zero-size chunk ends the body.
pub fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}{}", data.len(), CRLF).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(CRLF.as_bytes());
}

/// Append the final chunk, the trailer fields and the closing CRLF
pub fn encode_last_chunk(trailers: &Headers, out: &mut Vec<u8>) {
    out.extend_from_slice(b"0\r\n");
    trailers.write_to(out);
    out.extend_from_slice(CRLF.as_bytes());
}

/// Encode data as a chunked body split at `chunk_size` boundaries
pub fn encode_chunked_body(data: &[u8], chunk_size: usize, trailers: &Headers) -> Vec<u8> {
    let mut output = Vec::with_capacity(data.len() + 32);
    for chunk in data.chunks(chunk_size.max(1)) {
        encode_chunk(chunk, &mut output);
    }
    encode_last_chunk(trailers, &mut output);
    output
}

/// Decode a complete chunked body, returning the payload and trailers
///
/// Input that ends before the final chunk is an `UnexpectedEof` parse error.
pub fn decode_chunked_body(input: &[u8]) -> Result<(Vec<u8>, Headers)> {
    let mut parser = ResponseParser::from_bytes(input, ParserOptions::default());
    parser.start_body(BodyMode::Chunked);

    let response = parser.parse()?.ok_or_else(|| {
        Error::Parse(ParseError::new(ParseErrorKind::UnexpectedEof, parser.offset()))
    })?;

    let trailers = response.trailers().clone();
    let body = response.into_body().into_vec()?;
    Ok((body, trailers))
}
