//! Persistent zlib-stream decompression for gateway frames.
//!
//! With `compress=zlib-stream` the gateway sends one long deflate stream
//! split across WebSocket messages; each complete payload ends with a zlib
//! sync flush (`00 00 FF FF`). The inflate context must live for the whole
//! connection, and a decompression error poisons it, so the only recovery
//! from corruption is a new connection.

use flate2::{Decompress, DecompressError, FlushDecompress};

const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const OUTPUT_CHUNK: usize = 16 * 1024;

/// A zlib-stream inflater for one gateway connection.
#[derive(Debug)]
pub struct Decompressor {
    inflate: Decompress,
    buffer: Vec<u8>,
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Decompressor {
    /// Create a fresh inflate context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflate: Decompress::new(true),
            buffer: Vec::new(),
        }
    }

    /// Feed one WebSocket message.
    ///
    /// Returns `Ok(None)` while the payload is still incomplete (no sync
    /// flush suffix yet) and `Ok(Some(bytes))` once a whole payload has
    /// been inflated.
    ///
    /// # Errors
    ///
    /// Returns the underlying error when the stream is corrupted. The
    /// context is unusable afterwards; reconnect with a new instance.
    pub fn decompress(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, DecompressError> {
        self.buffer.extend_from_slice(chunk);
        if chunk.len() < 4 || chunk[chunk.len() - 4..] != ZLIB_SUFFIX {
            return Ok(None);
        }

        let before = self.inflate.total_in();
        let mut offset = 0_usize;
        let mut output = Vec::with_capacity(OUTPUT_CHUNK);
        loop {
            self.inflate
                .decompress_vec(&self.buffer[offset..], &mut output, FlushDecompress::Sync)?;
            #[allow(clippy::cast_possible_truncation)]
            {
                offset = (self.inflate.total_in() - before) as usize;
            }
            if offset >= self.buffer.len() {
                break;
            }
            output.reserve(OUTPUT_CHUNK);
        }
        self.buffer.clear();
        Ok(Some(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, Compression, FlushCompress};

    /// Compress `data` the way the gateway does: one shared deflate context,
    /// sync-flushed after every payload.
    fn compress_payload(compress: &mut Compress, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 512);
        compress
            .compress_vec(data, &mut out, FlushCompress::Sync)
            .unwrap();
        out
    }

    #[test]
    fn inflates_a_complete_payload() {
        let mut compress = Compress::new(Compression::default(), true);
        let mut decompressor = Decompressor::new();

        let chunk = compress_payload(&mut compress, b"{\"op\":10}");
        assert!(chunk.ends_with(&ZLIB_SUFFIX));

        let out = decompressor.decompress(&chunk).unwrap().unwrap();
        assert_eq!(out, b"{\"op\":10}");
    }

    #[test]
    fn buffers_partial_payloads_until_the_suffix() {
        let mut compress = Compress::new(Compression::default(), true);
        let mut decompressor = Decompressor::new();

        let chunk = compress_payload(&mut compress, b"{\"op\":0,\"t\":\"MESSAGE_CREATE\"}");
        let split = chunk.len() / 2;

        assert_eq!(decompressor.decompress(&chunk[..split]).unwrap(), None);
        let out = decompressor.decompress(&chunk[split..]).unwrap().unwrap();
        assert_eq!(out, b"{\"op\":0,\"t\":\"MESSAGE_CREATE\"}");
    }

    #[test]
    fn context_carries_across_payloads() {
        let mut compress = Compress::new(Compression::default(), true);
        let mut decompressor = Decompressor::new();

        for payload in [&b"{\"op\":10}"[..], b"{\"op\":11}", b"{\"op\":0}"] {
            let chunk = compress_payload(&mut compress, payload);
            let out = decompressor.decompress(&chunk).unwrap().unwrap();
            assert_eq!(out, payload);
        }
    }

    #[test]
    fn corrupted_data_is_an_error() {
        let mut decompressor = Decompressor::new();
        let garbage = [0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0xff, 0xff];
        assert!(decompressor.decompress(&garbage).is_err());
    }
}
