//! Transparent block compression for file payloads.
//!
//! A compressed payload starts with a self-describing 16-byte header so
//! recovery can always tell compressed bytes from raw ones:
//!
//! ```text
//! magic:'RZCP' (4) | algorithm:1 | reserved:3 | uncompressed_size:4 | compressed_size:4
//! ```

use std::io::Read;
use std::io::Write;

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::errors::FsError;
use crate::errors::FsResult;

/// Identifies a compressed payload image.
pub const COMPRESS_MAGIC: [u8; 4] = *b"RZCP";

/// Size of the self-describing prefix.
pub const COMPRESS_HEADER_LEN: usize = 16;

/// Stream compressor stored in the header's algorithm byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum Algorithm {
    /// Raw bytes; reserved, never stored on disk.
    None = 0,
    /// DEFLATE via flate2.
    Deflate = 1,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
struct CompressHeader {
    magic: [u8; 4],
    algorithm: u8,
    reserved: [u8; 3],
    uncompressed_size: u32,
    compressed_size: u32,
}

const _: () = assert!(size_of::<CompressHeader>() == COMPRESS_HEADER_LEN);

/// Compress `src`, returning the header-prefixed image, or `None` when the
/// result would not be strictly smaller than the input.
pub fn compress(src: &[u8]) -> Option<Vec<u8>> {
    if src.len() <= COMPRESS_HEADER_LEN || src.len() > u32::MAX as usize {
        return None;
    }
    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(COMPRESS_HEADER_LEN + src.len() / 2),
        Compression::default(),
    );
    // Reserve space for the header, then stream the body behind it.
    encoder.get_mut().extend_from_slice(&[0u8; COMPRESS_HEADER_LEN]);
    encoder.write_all(src).ok()?;
    let mut out = encoder.finish().ok()?;
    if out.len() >= src.len() {
        return None;
    }

    let header = CompressHeader {
        magic: COMPRESS_MAGIC,
        algorithm: Algorithm::Deflate.into(),
        reserved: [0; 3],
        uncompressed_size: src.len() as u32,
        compressed_size: (out.len() - COMPRESS_HEADER_LEN) as u32,
    };
    out[..COMPRESS_HEADER_LEN].copy_from_slice(header.as_bytes());
    Some(out)
}

/// Whether `buf` starts with a valid compression header.
pub fn is_compressed(buf: &[u8]) -> bool {
    buf.len() >= COMPRESS_HEADER_LEN && buf[..4] == COMPRESS_MAGIC
}

/// Recover the raw bytes from a header-prefixed image.
pub fn decompress(buf: &[u8]) -> FsResult<Vec<u8>> {
    if buf.len() < COMPRESS_HEADER_LEN {
        return Err(FsError::InvalidArgument);
    }
    let header = CompressHeader::read_from_bytes(&buf[..COMPRESS_HEADER_LEN])
        .map_err(|_| FsError::InvalidArgument)?;
    if header.magic != COMPRESS_MAGIC {
        return Err(FsError::InvalidArgument);
    }
    let algorithm =
        Algorithm::try_from(header.algorithm).map_err(|_| FsError::InvalidArgument)?;
    let body = &buf[COMPRESS_HEADER_LEN..];
    if body.len() != header.compressed_size as usize {
        return Err(FsError::InvalidArgument);
    }

    match algorithm {
        Algorithm::None => Err(FsError::InvalidArgument),
        Algorithm::Deflate => {
            let mut out = Vec::with_capacity(header.uncompressed_size as usize);
            DeflateDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|_| FsError::InvalidArgument)?;
            if out.len() != header.uncompressed_size as usize {
                return Err(FsError::InvalidArgument);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_compressible_data() {
        let src = vec![0x41u8; 1024 * 1024];
        let packed = compress(&src).expect("uniform data must compress");
        assert!(packed.len() < src.len());
        assert!(is_compressed(&packed));
        assert_eq!(decompress(&packed).unwrap(), src);
    }

    #[test]
    fn incompressible_data_is_rejected() {
        // A short high-entropy buffer cannot shrink past the header.
        let src: Vec<u8> = (0..64u32)
            .flat_map(|i| i.wrapping_mul(2654435761).to_le_bytes())
            .collect();
        if let Some(packed) = compress(&src) {
            assert!(packed.len() < src.len());
            assert_eq!(decompress(&packed).unwrap(), src);
        }
    }

    #[test]
    fn tiny_inputs_are_never_compressed() {
        assert!(compress(b"hi").is_none());
    }

    #[test]
    fn decompress_validates_magic() {
        let mut packed = compress(&vec![7u8; 4096]).unwrap();
        packed[0] = b'X';
        assert_eq!(decompress(&packed).unwrap_err(), FsError::InvalidArgument);
    }

    #[test]
    fn decompress_validates_length() {
        let packed = compress(&vec![7u8; 4096]).unwrap();
        assert_eq!(
            decompress(&packed[..packed.len() - 1]).unwrap_err(),
            FsError::InvalidArgument
        );
    }
}
