//! `zlib` payload compression (RFC 4253 Section 6.2).
//!
//! One deflate stream spans every packet of a direction; each packet ends
//! with a partial flush so the peer can inflate it on its own.

use super::{AlgorithmRegistry, CompressionMode, Compressor};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use fynx_platform::{FynxError, FynxResult};

/// Upper bound for one inflated payload.
pub const MAX_INFLATED_SIZE: usize = 256 * 1024;

const LEVEL: u32 = 6;

pub(crate) fn register_defaults(registry: &mut AlgorithmRegistry) {
    registry
        .register_compression("none", false, |_| Ok(None))
        .register_compression("zlib", false, |mode| {
            Ok(Some(Box::new(ZlibCompressor::new(mode)) as Box<dyn Compressor>))
        })
        .register_compression("zlib@openssh.com", true, |mode| {
            Ok(Some(Box::new(ZlibCompressor::new(mode)) as Box<dyn Compressor>))
        });
}

/// Streaming zlib compressor for one direction.
pub struct ZlibCompressor {
    deflate: Option<Compress>,
    inflate: Option<Decompress>,
}

impl ZlibCompressor {
    /// Creates the deflate or inflate half.
    pub fn new(mode: CompressionMode) -> Self {
        match mode {
            CompressionMode::Deflate => Self {
                deflate: Some(Compress::new(Compression::new(LEVEL), true)),
                inflate: None,
            },
            CompressionMode::Inflate => Self {
                deflate: None,
                inflate: Some(Decompress::new(true)),
            },
        }
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&mut self, data: &[u8]) -> FynxResult<Vec<u8>> {
        let deflate = self
            .deflate
            .as_mut()
            .ok_or_else(|| FynxError::Protocol("zlib: inflate-only instance".to_string()))?;

        let start = deflate.total_in();
        let mut out = Vec::with_capacity(data.len() + 64);
        loop {
            let consumed = (deflate.total_in() - start) as usize;
            deflate
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Partial)
                .map_err(|e| FynxError::Protocol(format!("zlib deflate failed: {}", e)))?;
            let consumed = (deflate.total_in() - start) as usize;
            if consumed == data.len() && out.len() < out.capacity() {
                return Ok(out);
            }
            out.reserve(out.capacity().max(64));
        }
    }

    fn decompress(&mut self, data: &[u8]) -> FynxResult<Vec<u8>> {
        let inflate = self
            .inflate
            .as_mut()
            .ok_or_else(|| FynxError::Protocol("zlib: deflate-only instance".to_string()))?;

        let start = inflate.total_in();
        let mut out = Vec::with_capacity(data.len() * 2 + 64);
        loop {
            let before_in = inflate.total_in();
            let before_out = inflate.total_out();
            let consumed = (before_in - start) as usize;
            let status = inflate
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| FynxError::Protocol(format!("zlib inflate failed: {}", e)))?;

            if out.len() > MAX_INFLATED_SIZE {
                return Err(FynxError::Protocol(format!(
                    "Inflated payload exceeds {} bytes",
                    MAX_INFLATED_SIZE
                )));
            }

            let consumed = (inflate.total_in() - start) as usize;
            let progressed =
                inflate.total_in() != before_in || inflate.total_out() != before_out;
            let room_left = out.len() < out.capacity();
            if (consumed == data.len() && room_left)
                || status == Status::StreamEnd
                || (!progressed && room_left)
            {
                return Ok(out);
            }
            out.reserve(out.capacity().max(64));
        }
    }
}
