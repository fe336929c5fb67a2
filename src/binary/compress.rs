//! File Stream Compression
//!
//! A file travels as a one-byte compressor tag, then `(varint length,
//! block)` pairs, then a zero-length terminator block. Framing and
//! compression are independent: each block is standalone, so a corrupted
//! block fails the whole transfer while a short read just waits for more
//! bytes.
//!
//! Tags: `0x01` identity, `0x02` LZ4 (`lz4_flex` block format, size
//! prepended).

use crate::error::{Error, Result};

pub const COMPRESSOR_IDENTITY: u8 = 0x01;
pub const COMPRESSOR_LZ4: u8 = 0x02;

/// Chunk size fed into the compressor when sending a file.
pub const FILE_BLOCK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressorKind {
    Identity,
    Lz4,
}

impl CompressorKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            COMPRESSOR_IDENTITY => Some(Self::Identity),
            COMPRESSOR_LZ4 => Some(Self::Lz4),
            _ => None,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Self::Identity => COMPRESSOR_IDENTITY,
            Self::Lz4 => COMPRESSOR_LZ4,
        }
    }

    pub fn compress_block(&self, input: &[u8]) -> Vec<u8> {
        match self {
            Self::Identity => input.to_vec(),
            Self::Lz4 => lz4_flex::block::compress_prepend_size(input),
        }
    }

    pub fn decompress_block(&self, block: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Identity => Ok(block.to_vec()),
            Self::Lz4 => lz4_flex::block::decompress_size_prepended(block)
                .map_err(|e| Error::ProtocolViolation(format!("corrupt LZ4 block: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        assert_eq!(
            CompressorKind::from_tag(COMPRESSOR_IDENTITY),
            Some(CompressorKind::Identity)
        );
        assert_eq!(
            CompressorKind::from_tag(COMPRESSOR_LZ4),
            Some(CompressorKind::Lz4)
        );
        assert_eq!(CompressorKind::from_tag(0x00), None);
        assert_eq!(CompressorKind::from_tag(0x03), None);
    }

    #[test]
    fn test_identity_passthrough() {
        let data = b"identity keeps bytes verbatim";
        let block = CompressorKind::Identity.compress_block(data);
        assert_eq!(block, data);
        assert_eq!(
            CompressorKind::Identity.decompress_block(&block).unwrap(),
            data
        );
    }

    #[test]
    fn test_lz4_roundtrip() {
        let data: Vec<u8> = std::iter::repeat(b"abcd".as_slice())
            .take(1000)
            .flatten()
            .copied()
            .collect();
        let block = CompressorKind::Lz4.compress_block(&data);
        assert!(block.len() < data.len());
        assert_eq!(CompressorKind::Lz4.decompress_block(&block).unwrap(), data);
    }

    #[test]
    fn test_lz4_corrupt_block_fails() {
        let data = vec![0x42u8; 512];
        let mut block = CompressorKind::Lz4.compress_block(&data);
        let last = block.len() - 1;
        block[last] ^= 0xFF;
        block.truncate(block.len() - 2);
        assert!(CompressorKind::Lz4.decompress_block(&block).is_err());
    }

    #[test]
    fn test_empty_block() {
        let block = CompressorKind::Lz4.compress_block(&[]);
        assert_eq!(
            CompressorKind::Lz4.decompress_block(&block).unwrap(),
            Vec::<u8>::new()
        );
    }
}
