//! Payload compression for RPC bodies

use crate::error::RpcError;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use hzn_proto::Compression;
use std::io::{Read, Write};

/// Algorithms this side can speak, in order of preference
pub const SUPPORTED: &[Compression] = &[Compression::Deflate, Compression::None];

/// Pick the first algorithm in `offer` that we support
pub fn negotiate(offer: &[Compression]) -> Compression {
    offer
        .iter()
        .copied()
        .find(|c| SUPPORTED.contains(c))
        .unwrap_or(Compression::None)
}

pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>, RpcError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Deflate => {
            let mut encoder = DeflateEncoder::new(
                Vec::with_capacity(data.len() / 2),
                flate2::Compression::default(),
            );
            encoder
                .write_all(data)
                .map_err(|e| RpcError::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| RpcError::Compression(e.to_string()))
        }
    }
}

pub fn decompress(compression: Compression, data: &[u8]) -> Result<Vec<u8>, RpcError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Deflate => {
            let mut out = Vec::with_capacity(data.len() * 2);
            DeflateDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| RpcError::Compression(e.to_string()))?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_prefers_offer_order() {
        assert_eq!(
            negotiate(&[Compression::Deflate, Compression::None]),
            Compression::Deflate
        );
        assert_eq!(
            negotiate(&[Compression::None, Compression::Deflate]),
            Compression::None
        );
        assert_eq!(negotiate(&[]), Compression::None);
    }

    #[test]
    fn test_deflate_shrinks_repetitive_payload() {
        let data = b"service-registration ".repeat(200);
        let packed = compress(Compression::Deflate, &data).unwrap();

        assert!(packed.len() < data.len());
        assert_eq!(decompress(Compression::Deflate, &packed).unwrap(), data);
    }

    #[test]
    fn test_corrupt_deflate_input() {
        let result = decompress(Compression::Deflate, &[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(RpcError::Compression(_))));
    }
}
