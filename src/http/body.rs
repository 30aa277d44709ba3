//! Request and response bodies
//!
//! Request bodies are either empty, an in-memory buffer, or a rewindable
//! stream. Response bodies are written into a spill buffer that stays in
//! memory up to a threshold and moves to a temporary file beyond it.

use bytes::Bytes;
use openssl::hash::{Hasher, MessageDigest};
use std::fmt;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use tempfile::SpooledTempFile;

/// A streamed request body
///
/// Streams must be rewindable so a redirected request can resend them.
pub trait BodyStream: Read + Send {
    /// Total length in bytes, when known up front
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// Seek back to the first byte
    fn rewind(&mut self) -> io::Result<()>;
}

/// Adapter turning any `Read + Seek` value into a body stream
pub struct ReaderStream<R> {
    reader: R,
    len: Option<u64>,
}

impl<R: Read + Seek + Send> ReaderStream<R> {
    /// Wrap a reader; pass `len` when the size is known
    pub fn new(reader: R, len: Option<u64>) -> Self {
        ReaderStream { reader, len }
    }
}

impl<R: Read + Seek + Send> Read for ReaderStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl<R: Read + Seek + Send> BodyStream for ReaderStream<R> {
    fn size_hint(&self) -> Option<u64> {
        self.len
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(0)).map(|_| ())
    }
}

/// Request body
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Stream(Box<dyn BodyStream>),
}

impl Body {
    /// Create a streamed body from a reader
    pub fn from_reader<R>(reader: R, len: Option<u64>) -> Self
    where
        R: Read + Seek + Send + 'static,
    {
        Body::Stream(Box::new(ReaderStream::new(reader, len)))
    }

    /// Length in bytes, when known without reading
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Stream(s) => s.size_hint(),
        }
    }

    /// Whether the body is known to be empty
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Whether the body is a stream
    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }

    /// Rewind a stream body so it can be sent again
    pub fn rewind(&mut self) -> io::Result<()> {
        match self {
            Body::Stream(s) => s.rewind(),
            _ => Ok(()),
        }
    }

    /// Read a stream body fully into memory
    pub fn into_buffered(self) -> io::Result<Body> {
        match self {
            Body::Stream(mut s) => {
                let mut data = Vec::new();
                s.read_to_end(&mut data)?;
                Ok(Body::Bytes(Bytes::from(data)))
            }
            other => Ok(other),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Stream(s) => match s.size_hint() {
                Some(len) => write!(f, "Body::Stream({} bytes)", len),
                None => f.write_str("Body::Stream(unsized)"),
            },
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        if data.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(Bytes::from(data))
        }
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        if data.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(data)
        }
    }
}

impl From<&'static [u8]> for Body {
    fn from(data: &'static [u8]) -> Self {
        Body::from(data.to_vec())
    }
}

impl From<String> for Body {
    fn from(data: String) -> Self {
        Body::from(data.into_bytes())
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Body::from(data.as_bytes().to_vec())
    }
}

/// Response body, either materialized in memory or spooled
pub struct ResponseBody {
    inner: BodyInner,
    len: u64,
}

enum BodyInner {
    Buffered(Cursor<Bytes>),
    Spooled(SpooledTempFile),
}

impl ResponseBody {
    /// An empty body
    pub fn empty() -> Self {
        ResponseBody::from_bytes(Bytes::new())
    }

    /// A body backed by memory
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        ResponseBody {
            len: data.len() as u64,
            inner: BodyInner::Buffered(Cursor::new(data)),
        }
    }

    /// Length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the body has no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The full body, when it is held in memory
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.inner {
            BodyInner::Buffered(c) => Some(c.get_ref().as_ref()),
            BodyInner::Spooled(_) => None,
        }
    }

    /// Whether the body lives in memory
    pub fn is_buffered(&self) -> bool {
        matches!(self.inner, BodyInner::Buffered(_))
    }

    /// Read the remaining body into a vector
    pub fn into_vec(mut self) -> io::Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.len as usize);
        self.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            BodyInner::Buffered(c) => c.read(buf),
            BodyInner::Spooled(f) => f.read(buf),
        }
    }
}

impl Default for ResponseBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("len", &self.len)
            .field("buffered", &self.is_buffered())
            .finish()
    }
}

/// Body storage that lives in memory up to a threshold and spills to a
/// temporary file beyond it
pub struct SpillBuffer {
    file: SpooledTempFile,
    len: u64,
}

impl SpillBuffer {
    /// Create a buffer that spills once it holds more than `threshold` bytes
    pub fn new(threshold: usize) -> Self {
        SpillBuffer {
            file: SpooledTempFile::new(threshold),
            len: 0,
        }
    }

    /// Append bytes
    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }

    /// Bytes written so far
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing was written
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the contents moved to a temporary file
    pub fn is_spilled(&self) -> bool {
        self.file.is_rolled()
    }

    /// Turn the contents into a response body
    ///
    /// With `materialize` the whole body is read into memory even if it
    /// spilled to disk.
    pub fn into_body(mut self, materialize: bool) -> io::Result<ResponseBody> {
        self.file.seek(SeekFrom::Start(0))?;

        if materialize || !self.file.is_rolled() {
            let mut data = Vec::with_capacity(self.len as usize);
            self.file.read_to_end(&mut data)?;
            return Ok(ResponseBody::from_bytes(data));
        }

        Ok(ResponseBody {
            len: self.len,
            inner: BodyInner::Spooled(self.file),
        })
    }
}

/// Response body destination used by the parser
///
/// Counts bytes and keeps an optional streaming MD5 digest next to the
/// spill buffer.
pub(crate) struct BodySink {
    buffer: SpillBuffer,
    md5: Option<Hasher>,
}

impl BodySink {
    pub(crate) fn new(threshold: usize) -> Self {
        BodySink {
            buffer: SpillBuffer::new(threshold),
            md5: None,
        }
    }

    /// Start digesting body bytes with MD5
    pub(crate) fn enable_md5(&mut self) -> io::Result<()> {
        let hasher = Hasher::new(MessageDigest::md5()).map_err(io::Error::other)?;
        self.md5 = Some(hasher);
        Ok(())
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if let Some(hasher) = self.md5.as_mut() {
            hasher.update(data).map_err(io::Error::other)?;
        }
        self.buffer.write_all(data)
    }

    pub(crate) fn len(&self) -> u64 {
        self.buffer.len()
    }

    /// Finish the body, returning it and its base64 MD5 digest if enabled
    pub(crate) fn finish(self, materialize: bool) -> io::Result<(ResponseBody, Option<String>)> {
        let digest = match self.md5 {
            Some(mut hasher) => {
                let bytes = hasher.finish().map_err(io::Error::other)?;
                Some(openssl::base64::encode_block(&bytes))
            }
            None => None,
        };
        Ok((self.buffer.into_body(materialize)?, digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_lengths() {
        assert_eq!(Body::Empty.len(), Some(0));
        assert!(Body::Empty.is_empty());
        assert_eq!(Body::from("hello").len(), Some(5));
        assert!(Body::from(Vec::new()).is_empty());

        let sized = Body::from_reader(Cursor::new(b"abc".to_vec()), Some(3));
        assert_eq!(sized.len(), Some(3));
        assert!(sized.is_stream());

        let unsized_body = Body::from_reader(Cursor::new(b"abc".to_vec()), None);
        assert_eq!(unsized_body.len(), None);
    }

    #[test]
    fn test_stream_rewind() {
        let mut body = Body::from_reader(Cursor::new(b"abcdef".to_vec()), None);
        if let Body::Stream(s) = &mut body {
            let mut buf = [0u8; 3];
            s.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"abc");
        }

        body.rewind().unwrap();
        match body.into_buffered().unwrap() {
            Body::Bytes(b) => assert_eq!(&b[..], b"abcdef"),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_spill_buffer_in_memory() {
        let mut buffer = SpillBuffer::new(1024);
        buffer.write_all(b"hello ").unwrap();
        buffer.write_all(b"world").unwrap();
        assert_eq!(buffer.len(), 11);
        assert!(!buffer.is_spilled());

        let body = buffer.into_body(false).unwrap();
        assert_eq!(body.as_bytes(), Some(&b"hello world"[..]));
    }

    #[test]
    fn test_spill_buffer_rolls_to_disk() {
        let mut buffer = SpillBuffer::new(8);
        buffer.write_all(&[b'x'; 32]).unwrap();
        assert!(buffer.is_spilled());

        let body = buffer.into_body(false).unwrap();
        assert!(!body.is_buffered());
        assert_eq!(body.as_bytes(), None);
        assert_eq!(body.len(), 32);
        assert_eq!(body.into_vec().unwrap(), vec![b'x'; 32]);
    }

    #[test]
    fn test_spill_buffer_materialize() {
        let mut buffer = SpillBuffer::new(4);
        buffer.write_all(b"0123456789").unwrap();

        let body = buffer.into_body(true).unwrap();
        assert_eq!(body.as_bytes(), Some(&b"0123456789"[..]));
    }

    #[test]
    fn test_sink_md5() {
        let mut sink = BodySink::new(1024);
        sink.enable_md5().unwrap();
        sink.write(b"hello ").unwrap();
        sink.write(b"world").unwrap();
        assert_eq!(sink.len(), 11);

        let (body, digest) = sink.finish(true).unwrap();
        assert_eq!(body.as_bytes(), Some(&b"hello world"[..]));
        // md5("hello world") = 5eb63bbbe01eeed093cb22bb8f5acdc3
        assert_eq!(digest.as_deref(), Some("XrY7u+Ae7tCTyyK7j1rNww=="));
    }
}
