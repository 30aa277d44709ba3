//! Byte classification for the HTTP grammar
//!
//! The tokenizer sits between the transport and the response parser. Bytes
//! are pushed in with [`Tokenizer::feed`] as they arrive and come out as
//! [`Symbol`]s: one classified octet at a time while the message head is
//! parsed, or raw blocks once the parser knows how much body to expect.
//!
//! A tokenizer built with [`Tokenizer::from_bytes`] is *local*: all of its
//! input is already present, so running dry means end of stream. A network
//! tokenizer running dry means "no symbol yet" until [`Tokenizer::set_eof`]
//! is called.

use bytes::{Buf, Bytes, BytesMut};

/// Character class of a single octet, after the HTTP/1.1 ABNF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteClass {
    /// Control characters other than CR, LF and HT, plus DEL
    Ctl,
    Cr,
    Lf,
    Sp,
    Ht,
    /// `0-9`
    Digit,
    /// `a-f` and `A-F`
    HexAlpha,
    /// Letters outside the hex range
    Alpha,
    /// `"`
    Quote,
    /// `()<>@,;:\/[]?={}`
    Separator,
    /// Remaining visible token characters such as `!#$%&'*+-.^_|~`
    Token,
    /// Octets above 0x7F
    Octet,
}

impl ByteClass {
    /// Classify one octet
    #[inline]
    pub fn of(byte: u8) -> ByteClass {
        CLASS_TABLE[byte as usize]
    }

    /// Whether the class may appear in a header name or method
    #[inline]
    pub fn is_token_char(self) -> bool {
        matches!(
            self,
            ByteClass::Digit | ByteClass::HexAlpha | ByteClass::Alpha | ByteClass::Token
        )
    }

    #[inline]
    pub fn is_digit(self) -> bool {
        self == ByteClass::Digit
    }

    #[inline]
    pub fn is_hex(self) -> bool {
        matches!(self, ByteClass::Digit | ByteClass::HexAlpha)
    }

    /// SP or HT
    #[inline]
    pub fn is_whitespace(self) -> bool {
        matches!(self, ByteClass::Sp | ByteClass::Ht)
    }

    /// Octets allowed in header values and reason phrases
    #[inline]
    pub fn is_text(self) -> bool {
        !matches!(self, ByteClass::Ctl | ByteClass::Cr | ByteClass::Lf)
    }
}

const fn build_table() -> [ByteClass; 256] {
    let mut table = [ByteClass::Octet; 256];
    let mut i = 0;
    while i < 256 {
        let b = i as u8;
        table[i] = match b {
            b'\r' => ByteClass::Cr,
            b'\n' => ByteClass::Lf,
            b' ' => ByteClass::Sp,
            b'\t' => ByteClass::Ht,
            0..=31 | 127 => ByteClass::Ctl,
            b'0'..=b'9' => ByteClass::Digit,
            b'a'..=b'f' | b'A'..=b'F' => ByteClass::HexAlpha,
            b'g'..=b'z' | b'G'..=b'Z' => ByteClass::Alpha,
            b'"' => ByteClass::Quote,
            b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' | b'/' | b'['
            | b']' | b'?' | b'=' | b'{' | b'}' => ByteClass::Separator,
            128..=255 => ByteClass::Octet,
            _ => ByteClass::Token,
        };
        i += 1;
    }
    table
}

static CLASS_TABLE: [ByteClass; 256] = build_table();

/// A classified unit of input
///
/// Equal input always yields equal symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Symbol {
    Byte(ByteClass, u8),
    Block(Bytes),
    Eof,
}

impl Symbol {
    fn byte(b: u8) -> Symbol {
        Symbol::Byte(ByteClass::of(b), b)
    }

    /// Number of input octets the symbol spans
    pub fn len(&self) -> usize {
        match self {
            Symbol::Byte(..) => 1,
            Symbol::Block(b) => b.len(),
            Symbol::Eof => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How much input one symbol covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// One classified octet per symbol
    Byte,
    /// Raw blocks of up to this many octets
    Block(usize),
}

/// Incremental classifier over a pushed byte stream
#[derive(Debug)]
pub struct Tokenizer {
    buf: BytesMut,
    cached: Option<Symbol>,
    offset: u64,
    granularity: Granularity,
    eof: bool,
    eof_delivered: bool,
}

impl Tokenizer {
    /// Create a tokenizer for a live stream
    pub fn new() -> Self {
        Tokenizer {
            buf: BytesMut::with_capacity(4096),
            cached: None,
            offset: 0,
            granularity: Granularity::Byte,
            eof: false,
            eof_delivered: false,
        }
    }

    /// Create a local tokenizer over complete input
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut tokenizer = Tokenizer::new();
        tokenizer.feed(data);
        tokenizer.set_eof();
        tokenizer
    }

    /// Append input
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Mark the end of input
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// Whether end of input was signalled
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// The symbol at the current position, without advancing
    ///
    /// Returns `None` when no input is available yet, or once `Eof` has
    /// been consumed.
    pub fn current(&mut self) -> Option<Symbol> {
        if let Some(symbol) = &self.cached {
            return Some(symbol.clone());
        }

        let symbol = if self.buf.is_empty() {
            if self.eof && !self.eof_delivered {
                Symbol::Eof
            } else {
                return None;
            }
        } else {
            match self.granularity {
                Granularity::Byte => Symbol::byte(self.buf[0]),
                Granularity::Block(max) => {
                    let n = max.max(1).min(self.buf.len());
                    Symbol::Block(self.buf.split_to(n).freeze())
                }
            }
        };

        self.cached = Some(symbol.clone());
        Some(symbol)
    }

    /// Advance past the current symbol
    pub fn next(&mut self) {
        if self.cached.is_none() && self.current().is_none() {
            return;
        }

        match self.cached.take() {
            Some(Symbol::Byte(..)) => {
                self.buf.advance(1);
                self.offset += 1;
            }
            Some(Symbol::Block(block)) => {
                self.offset += block.len() as u64;
            }
            Some(Symbol::Eof) => {
                self.eof_delivered = true;
            }
            None => {}
        }
    }

    /// Current granularity
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Switch between byte and block classification
    ///
    /// A block already handed out by `current()` but not consumed is put
    /// back, so the next symbol starts at the same offset.
    pub fn set_granularity(&mut self, granularity: Granularity) {
        if granularity == self.granularity {
            return;
        }

        if let Some(Symbol::Block(block)) = self.cached.take() {
            let mut restored = BytesMut::with_capacity(block.len() + self.buf.len());
            restored.extend_from_slice(&block);
            restored.extend_from_slice(&self.buf);
            self.buf = restored;
        } else if matches!(self.cached, Some(Symbol::Byte(..))) {
            self.cached = None;
        }

        self.granularity = granularity;
    }

    /// Stream offset of the current position
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Input octets received but not yet consumed
    pub fn buffered(&self) -> usize {
        match &self.cached {
            Some(Symbol::Block(block)) => block.len() + self.buf.len(),
            _ => self.buf.len(),
        }
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}
