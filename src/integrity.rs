//! Content digests computed around upload and download streams.
//!
//! Digests travel as base64 of the raw MD5 bytes (the Content-MD5
//! convention), so a stored digest can be compared verbatim with a freshly
//! computed one.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Incrementally digests a byte stream one chunk at a time.
pub struct DigestStream {
    ctx: md5::Context,
}

impl DigestStream {
    pub fn new() -> Self {
        Self {
            ctx: md5::Context::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.ctx.consume(chunk);
    }

    /// Finish the stream and return the encoded digest.
    pub fn finish(self) -> String {
        BASE64.encode(self.ctx.compute().0)
    }
}

impl Default for DigestStream {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot digest of a complete buffer.
pub fn digest(data: &[u8]) -> String {
    BASE64.encode(md5::compute(data).0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        // md5("hello") = 5d41402abc4b2a76b9719d911017c592
        assert_eq!(digest(b"hello"), "XUFAKrxLKna5cZ2REBfFkg==");
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut stream = DigestStream::new();
        for chunk in data.chunks(7) {
            stream.update(chunk);
        }
        assert_eq!(stream.finish(), digest(data));
    }

    #[test]
    fn empty_stream() {
        assert_eq!(DigestStream::new().finish(), digest(b""));
    }
}
