//! Matroska block parsing
//!
//! A `SimpleBlock`/`Block` payload is a small header followed by one or
//! more coded frames:
//!
//! ```text
//! [track number: vint][timecode: i16 BE][flags: u8][lacing header?][frames...]
//! ```

use bytes::Bytes;

use crate::container::ebml;
use crate::error::ContainerError;

/// Frame lacing mode encoded in bits 1-2 of the flags byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lacing {
    None,
    Xiph,
    FixedSize,
    Ebml,
}

impl Lacing {
    fn from_flags(flags: u8) -> Self {
        match (flags >> 1) & 0x03 {
            0 => Lacing::None,
            1 => Lacing::Xiph,
            2 => Lacing::FixedSize,
            _ => Lacing::Ebml,
        }
    }
}

/// A parsed block with its frames split out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub track: u64,
    /// Timecode relative to the enclosing cluster
    pub timecode: i16,
    /// Keyframe flag (always false for `Block`, which has no such bit)
    pub keyframe: bool,
    pub lacing: Lacing,
    pub frames: Vec<Bytes>,
}

fn malformed(msg: impl Into<String>) -> ContainerError {
    ContainerError::MalformedBlock(msg.into())
}

impl Block {
    /// Parse a `SimpleBlock` or `Block` payload
    pub fn parse(data: &Bytes) -> Result<Self, ContainerError> {
        let (track, track_len) = ebml::read_vint(data, 0)
            .map_err(|_| malformed("invalid track number"))?
            .ok_or_else(|| malformed("truncated track number"))?;

        let header_len = track_len + 3;
        if data.len() < header_len {
            return Err(malformed("truncated block header"));
        }

        let timecode = i16::from_be_bytes([data[track_len], data[track_len + 1]]);
        let flags = data[track_len + 2];
        let lacing = Lacing::from_flags(flags);
        let body = data.slice(header_len..);

        let frames = match lacing {
            Lacing::None => vec![body],
            _ => split_laced(&body, lacing)?,
        };

        Ok(Self {
            track,
            timecode,
            keyframe: flags & 0x80 != 0,
            lacing,
            frames,
        })
    }
}

/// Split a laced body into its frames.
///
/// Lace sizes come straight from the client, so every sum is checked and
/// each explicit size must fit in what is left of the body.
fn split_laced(body: &Bytes, lacing: Lacing) -> Result<Vec<Bytes>, ContainerError> {
    let Some(&count_minus_one) = body.first() else {
        return Err(malformed("missing lace count"));
    };
    let count = count_minus_one as usize + 1;
    let mut pos = 1;
    let mut sizes = Vec::with_capacity(count);

    match lacing {
        Lacing::Xiph => {
            for _ in 0..count - 1 {
                let mut size = 0usize;
                loop {
                    let b = *body.get(pos).ok_or_else(|| malformed("truncated xiph lacing"))?;
                    pos += 1;
                    size = size
                        .checked_add(b as usize)
                        .ok_or_else(|| malformed("xiph lace size overflows"))?;
                    if b != 0xFF {
                        break;
                    }
                }
                sizes.push(size);
            }
        }
        Lacing::Ebml => {
            if count > 1 {
                let (first, len) = ebml::read_vint(&body[pos..], pos as u64)
                    .map_err(|_| malformed("invalid ebml lace size"))?
                    .ok_or_else(|| malformed("truncated ebml lacing"))?;
                pos += len;
                let mut size = i64::try_from(first).map_err(|_| malformed("ebml lace size overflows"))?;
                sizes.push(lace_size(size)?);

                for _ in 1..count - 1 {
                    let (delta, len) = ebml::read_signed_vint(&body[pos..], pos as u64)
                        .map_err(|_| malformed("invalid ebml lace delta"))?
                        .ok_or_else(|| malformed("truncated ebml lacing"))?;
                    pos += len;
                    size = size
                        .checked_add(delta)
                        .ok_or_else(|| malformed("ebml lace size overflows"))?;
                    sizes.push(lace_size(size)?);
                }
            }
        }
        Lacing::FixedSize => {
            let remaining = body.len() - pos;
            if remaining % count != 0 {
                return Err(malformed("fixed lacing does not divide evenly"));
            }
            sizes.resize(count - 1, remaining / count);
        }
        Lacing::None => unreachable!("unlaced blocks are not split"),
    }

    // Sizes are capped one by one against the bytes left after the lacing
    // header, so the running total cannot overflow.
    let available = body.len() - pos;
    let explicit = sizes.iter().try_fold(0usize, |total, &size| {
        total
            .checked_add(size)
            .filter(|&total| total <= available)
            .ok_or_else(|| malformed("lace sizes exceed block"))
    })?;
    sizes.push(available - explicit);

    let mut frames = Vec::with_capacity(count);
    for size in sizes {
        frames.push(body.slice(pos..pos + size));
        pos += size;
    }
    Ok(frames)
}

/// An EBML lace size must be non-negative
fn lace_size(size: i64) -> Result<usize, ContainerError> {
    usize::try_from(size).map_err(|_| malformed("negative ebml lace size"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn block(flags: u8, body: &[u8]) -> Bytes {
        let mut data = vec![0x81, 0x00, 0x10, flags];
        data.extend_from_slice(body);
        Bytes::from(data)
    }

    #[test]
    fn test_unlaced_block() {
        let parsed = Block::parse(&block(0x80, &[1, 2, 3])).unwrap();
        assert_eq!(parsed.track, 1);
        assert_eq!(parsed.timecode, 16);
        assert!(parsed.keyframe);
        assert_eq!(parsed.lacing, Lacing::None);
        assert_eq!(parsed.frames, vec![Bytes::from_static(&[1, 2, 3])]);
    }

    #[test]
    fn test_negative_timecode() {
        let data = Bytes::from_static(&[0x81, 0xFF, 0xFE, 0x00, 9]);
        assert_eq!(Block::parse(&data).unwrap().timecode, -2);
    }

    #[test]
    fn test_xiph_lacing() {
        // 3 frames: 2 bytes, 256 bytes, rest (1 byte)
        let mut body = vec![2, 2, 0xFF, 1];
        body.extend([7u8; 2]);
        body.extend([8u8; 256]);
        body.push(9);

        let parsed = Block::parse(&block(0x02, &body)).unwrap();
        assert_eq!(parsed.lacing, Lacing::Xiph);
        let sizes: Vec<_> = parsed.frames.iter().map(|f| f.len()).collect();
        assert_eq!(sizes, vec![2, 256, 1]);
        assert_eq!(parsed.frames[2][0], 9);
    }

    #[test]
    fn test_fixed_lacing() {
        let body = [1, 10, 11, 20, 21];
        let parsed = Block::parse(&block(0x04, &body)).unwrap();
        assert_eq!(
            parsed.frames,
            vec![Bytes::from_static(&[10, 11]), Bytes::from_static(&[20, 21])]
        );
    }

    #[test]
    fn test_fixed_lacing_uneven_is_malformed() {
        let body = [1, 10, 11, 20];
        assert!(matches!(
            Block::parse(&block(0x04, &body)),
            Err(ContainerError::MalformedBlock(_))
        ));
    }

    #[test]
    fn test_ebml_lacing() {
        // 3 frames: 3 bytes, 3 - 1 = 2 bytes, rest (4 bytes)
        let mut body = vec![2, 0x83, 0x80 | 62];
        body.extend([1u8; 3]);
        body.extend([2u8; 2]);
        body.extend([3u8; 4]);

        let parsed = Block::parse(&block(0x06, &body)).unwrap();
        let sizes: Vec<_> = parsed.frames.iter().map(|f| f.len()).collect();
        assert_eq!(sizes, vec![3, 2, 4]);
    }

    #[test]
    fn test_truncated_header() {
        let data = Bytes::from_static(&[0x81, 0x00]);
        assert!(Block::parse(&data).is_err());
    }

    #[test]
    fn test_lace_sizes_exceeding_block() {
        let body = [1, 50, 1, 2];
        assert!(Block::parse(&block(0x02, &body)).is_err());
    }

    /// EBML-laced block with 8-byte size and delta vints
    fn ebml_laced(first: u64, deltas: &[i64]) -> Bytes {
        let mut body = vec![deltas.len() as u8 + 1];
        ebml::write_vint(&mut body, first, 8);
        let bias = (1i64 << 55) - 1;
        for delta in deltas {
            ebml::write_vint(&mut body, (delta + bias) as u64, 8);
        }
        body.extend([0u8; 16]);
        block(0x06, &body)
    }

    #[test]
    fn test_ebml_lace_size_overflow_is_malformed() {
        // 256 frames, every size as large as the vints allow
        let data = ebml_laced((1 << 56) - 2, &[(1 << 55) - 1; 254]);
        assert!(matches!(Block::parse(&data), Err(ContainerError::MalformedBlock(_))));
    }

    #[test]
    fn test_lace_sizes_summing_past_usize_are_malformed() {
        // 39 explicit sizes, each below 2^63, that add up to exactly 2^64
        let first = (1u64 << 56) - 2;
        let rest = (1u128 << 64) - 39 * first as u128;
        let step = (rest / 741) as i64;
        let mut deltas = vec![step; 38];
        deltas[37] += (rest % 741) as i64;

        let mut size = first as u128;
        let mut total = size;
        for &delta in &deltas {
            size += delta as u128;
            assert!(size < 1 << 63);
            total += size;
        }
        assert_eq!(total, 1 << 64);

        let data = ebml_laced(first, &deltas);
        assert!(matches!(Block::parse(&data), Err(ContainerError::MalformedBlock(_))));
    }

    proptest! {
        #[test]
        fn prop_laced_bodies_never_panic(
            lacing in 1u8..4,
            body in proptest::collection::vec(any::<u8>(), 0..600),
        ) {
            let _ = Block::parse(&block(lacing << 1, &body));
        }

        #[test]
        fn prop_large_ebml_lace_sizes_never_panic(
            count in any::<u8>(),
            sizes in proptest::collection::vec(any::<u64>(), 0..64),
            tail in 0usize..64,
        ) {
            let mut body = vec![count];
            for size in sizes {
                ebml::write_vint(&mut body, size & ((1 << 56) - 1), 8);
            }
            body.resize(body.len() + tail, 0xAB);

            if let Ok(parsed) = Block::parse(&block(0x06, &body)) {
                let total: usize = parsed.frames.iter().map(|f| f.len()).sum();
                prop_assert!(total <= body.len());
            }
        }
    }
}
