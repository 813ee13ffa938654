//! LZ4 and Zstd codecs for the cache tiers, plus Zstd-dictionary binary deltas.
//!
//! Hot tier artifacts use a segmented LZ4 container: every segment is an
//! independent LZ4 frame, so an already-encoded frame (a staging
//! pre-compression) can be spliced into a snapshot without recompressing it.
//!
//! ```text
//! "DGLZ" 0x01 | frame 0 | frame 1 | ... | table[(raw_len u64, enc_len u64)] | count u32 | "DGLZ"
//! ```

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

const SEGMENT_MAGIC: &[u8; 4] = b"DGLZ";
const SEGMENT_VERSION: u8 = 1;
const HEADER_LEN: usize = 5;
const TRAILER_LEN: usize = 8;

/// Largest window a default Zstd decoder accepts without extra configuration.
const MAX_DELTA_WINDOW_LOG: u32 = 27;
const MIN_DELTA_WINDOW_LOG: u32 = 10;

/// Codec selection. Each cache tier is bound to exactly one codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// Segmented LZ4 frames, hot path
    Lz4,
    /// Zstandard, used for the warm (balanced) and cold (archive) tiers
    Zstd {
        /// Compression level (1=fastest, 19=best ratio, 3=balanced default)
        level: i32,
    },
}

impl Codec {
    /// Short name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Lz4 => "lz4",
            Codec::Zstd { .. } => "zstd",
        }
    }
}

/// Compress data with the given codec. Returns encoded bytes.
pub fn compress(data: &[u8], codec: Codec) -> StoreResult<Vec<u8>> {
    match codec {
        Codec::Lz4 => {
            let mut writer = SegmentWriter::new(Vec::with_capacity(data.len() / 2 + 64))?;
            writer.append_bytes(data)?;
            let (out, _) = writer.finish()?;
            Ok(out)
        }
        Codec::Zstd { level } => {
            zstd::encode_all(data, level).map_err(|e| StoreError::CompressionFailed(e.to_string()))
        }
    }
}

/// Decompress data that was encoded with `codec`.
/// Decode failures are reported as `Corrupt` under the given key.
pub fn decompress(data: &[u8], codec: Codec, key: &str) -> StoreResult<Vec<u8>> {
    match codec {
        Codec::Lz4 => decode_segments(data, key),
        Codec::Zstd { .. } => zstd::decode_all(data).map_err(|e| StoreError::corrupt(key, e)),
    }
}

/// Stream `reader` through a Zstd encoder into `writer`.
pub fn zstd_encode_stream<R: Read, W: Write>(reader: R, writer: W, level: i32) -> io::Result<()> {
    zstd::stream::copy_encode(reader, writer, level)
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Totals reported when a segmented container is finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentTotals {
    /// Number of segments written
    pub segments: usize,
    /// Sum of decoded segment lengths
    pub raw_bytes: u64,
    /// Container size including header, table and trailer
    pub encoded_bytes: u64,
}

/// Streaming writer for the segmented LZ4 container.
pub struct SegmentWriter<W: Write> {
    out: CountingWriter<W>,
    table: Vec<(u64, u64)>,
}

impl<W: Write> SegmentWriter<W> {
    /// Start a container, writing the header.
    pub fn new(inner: W) -> io::Result<Self> {
        let mut out = CountingWriter { inner, written: 0 };
        out.write_all(SEGMENT_MAGIC)?;
        out.write_all(&[SEGMENT_VERSION])?;
        Ok(Self {
            out,
            table: Vec::new(),
        })
    }

    /// Encode everything readable from `reader` as one LZ4 frame.
    /// Returns the number of raw bytes consumed.
    pub fn append_reader<R: Read>(&mut self, mut reader: R) -> io::Result<u64> {
        let start = self.out.written;
        let info = lz4_flex::frame::FrameInfo::new().content_checksum(true);
        let mut encoder = lz4_flex::frame::FrameEncoder::with_frame_info(info, &mut self.out);
        let raw = io::copy(&mut reader, &mut encoder)?;
        encoder.finish().map_err(io::Error::other)?;
        let encoded = self.out.written - start;
        self.table.push((raw, encoded));
        Ok(raw)
    }

    /// Encode an in-memory buffer as one segment.
    pub fn append_bytes(&mut self, data: &[u8]) -> io::Result<u64> {
        self.append_reader(data)
    }

    /// Splice an already-encoded LZ4 frame without recompressing it.
    pub fn append_encoded(&mut self, frame: &[u8], raw_len: u64) -> io::Result<()> {
        self.out.write_all(frame)?;
        self.table.push((raw_len, frame.len() as u64));
        Ok(())
    }

    /// Write the segment table and trailer, returning the inner writer.
    pub fn finish(mut self) -> io::Result<(W, SegmentTotals)> {
        for (raw, enc) in &self.table {
            self.out.write_all(&raw.to_le_bytes())?;
            self.out.write_all(&enc.to_le_bytes())?;
        }
        self.out.write_all(&(self.table.len() as u32).to_le_bytes())?;
        self.out.write_all(SEGMENT_MAGIC)?;
        self.out.flush()?;
        let totals = SegmentTotals {
            segments: self.table.len(),
            raw_bytes: self.table.iter().map(|(raw, _)| raw).sum(),
            encoded_bytes: self.out.written,
        };
        Ok((self.out.inner, totals))
    }
}

/// One encoded segment borrowed from a container.
#[derive(Debug, Clone, Copy)]
pub struct EncodedSegment<'a> {
    /// Decoded length
    pub raw_len: u64,
    /// LZ4 frame bytes
    pub frame: &'a [u8],
}

/// Parse the segment table of a container without decoding any frame.
pub fn segment_frames<'a>(data: &'a [u8], key: &str) -> StoreResult<Vec<EncodedSegment<'a>>> {
    if data.len() < HEADER_LEN + TRAILER_LEN
        || &data[..4] != SEGMENT_MAGIC
        || &data[data.len() - 4..] != SEGMENT_MAGIC
    {
        return Err(StoreError::corrupt(key, "missing segment container magic"));
    }
    if data[4] != SEGMENT_VERSION {
        return Err(StoreError::corrupt(
            key,
            format!("unsupported container version {}", data[4]),
        ));
    }
    let count_at = data.len() - TRAILER_LEN;
    let count = u32::from_le_bytes([
        data[count_at],
        data[count_at + 1],
        data[count_at + 2],
        data[count_at + 3],
    ]) as usize;
    let table_len = count
        .checked_mul(16)
        .ok_or_else(|| StoreError::corrupt(key, "segment table overflow"))?;
    if table_len > count_at - HEADER_LEN {
        return Err(StoreError::corrupt(key, "segment table exceeds container"));
    }
    let table_at = count_at - table_len;

    let mut segments = Vec::with_capacity(count);
    let mut offset = HEADER_LEN;
    for i in 0..count {
        let row = &data[table_at + i * 16..table_at + (i + 1) * 16];
        let mut raw = [0u8; 8];
        let mut enc = [0u8; 8];
        raw.copy_from_slice(&row[..8]);
        enc.copy_from_slice(&row[8..]);
        let raw_len = u64::from_le_bytes(raw);
        let enc_len = u64::from_le_bytes(enc) as usize;
        let end = offset
            .checked_add(enc_len)
            .filter(|end| *end <= table_at)
            .ok_or_else(|| StoreError::corrupt(key, format!("segment {} out of bounds", i)))?;
        segments.push(EncodedSegment {
            raw_len,
            frame: &data[offset..end],
        });
        offset = end;
    }
    if offset != table_at {
        return Err(StoreError::corrupt(key, "trailing bytes before segment table"));
    }
    Ok(segments)
}

/// Decode a whole segmented container into one buffer.
pub fn decode_segments(data: &[u8], key: &str) -> StoreResult<Vec<u8>> {
    let segments = segment_frames(data, key)?;
    let total: u64 = segments.iter().map(|s| s.raw_len).sum();
    let mut out = Vec::with_capacity(total as usize);
    for (i, segment) in segments.iter().enumerate() {
        let before = out.len();
        lz4_flex::frame::FrameDecoder::new(segment.frame)
            .read_to_end(&mut out)
            .map_err(|e| StoreError::corrupt(key, format!("segment {}: {}", i, e)))?;
        if (out.len() - before) as u64 != segment.raw_len {
            return Err(StoreError::corrupt(
                key,
                format!(
                    "segment {} decoded to {} bytes, expected {}",
                    i,
                    out.len() - before,
                    segment.raw_len
                ),
            ));
        }
    }
    Ok(out)
}

fn delta_window_log(reference: usize, data: usize) -> u32 {
    let span = (reference + data).max(1) as u64;
    let bits = 64 - span.leading_zeros();
    bits.clamp(MIN_DELTA_WINDOW_LOG, MAX_DELTA_WINDOW_LOG)
}

/// Binary delta using the reference bytes as a Zstd raw-content dictionary.
pub struct DeltaCompressor;

impl DeltaCompressor {
    /// Encode `data` relative to `reference`.
    pub fn compress_delta(data: &[u8], reference: &[u8], level: i32) -> StoreResult<Vec<u8>> {
        use zstd::stream::write::Encoder;

        if reference.is_empty() {
            return Err(StoreError::CompressionFailed(
                "reference data cannot be empty for delta compression".to_string(),
            ));
        }

        let fail = |e: io::Error| StoreError::CompressionFailed(e.to_string());
        let mut encoder = Encoder::with_dictionary(Vec::new(), level, reference).map_err(fail)?;
        encoder
            .window_log(delta_window_log(reference.len(), data.len()))
            .map_err(fail)?;
        encoder.long_distance_matching(true).map_err(fail)?;
        encoder.include_checksum(true).map_err(fail)?;
        encoder.write_all(data).map_err(fail)?;
        encoder.finish().map_err(fail)
    }

    /// Rebuild the target from a delta and the same reference.
    pub fn decompress_delta(delta: &[u8], reference: &[u8], key: &str) -> StoreResult<Vec<u8>> {
        use zstd::stream::read::Decoder;

        if reference.is_empty() {
            return Err(StoreError::corrupt(
                key,
                "reference data cannot be empty for delta decompression",
            ));
        }

        let mut decoder = Decoder::with_dictionary(io::Cursor::new(delta), reference)
            .map_err(|e| StoreError::corrupt(key, e))?;
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| StoreError::corrupt(key, e))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_lz4_roundtrip(data in prop::collection::vec(0u8..=255, 0..100_000)) {
            let c = compress(&data, Codec::Lz4).unwrap();
            let d = decompress(&c, Codec::Lz4, "prop").unwrap();
            prop_assert_eq!(d, data);
        }

        #[test]
        fn prop_zstd_roundtrip(data in prop::collection::vec(0u8..=255, 0..100_000)) {
            let c = compress(&data, Codec::Zstd { level: 3 }).unwrap();
            let d = decompress(&c, Codec::Zstd { level: 3 }, "prop").unwrap();
            prop_assert_eq!(d, data);
        }

        #[test]
        fn prop_delta_roundtrip(
            base in prop::collection::vec(0u8..=255, 1..20_000),
            edit_at in 0usize..20_000,
            edit in 0u8..=255,
        ) {
            let mut target = base.clone();
            let i = edit_at % target.len();
            target[i] = edit;
            let delta = DeltaCompressor::compress_delta(&target, &base, 3).unwrap();
            let back = DeltaCompressor::decompress_delta(&delta, &base, "prop").unwrap();
            prop_assert_eq!(back, target);
        }
    }

    #[test]
    fn empty_roundtrips() {
        for codec in [Codec::Lz4, Codec::Zstd { level: 3 }, Codec::Zstd { level: 19 }] {
            let c = compress(&[], codec).unwrap();
            let d = decompress(&c, codec, "empty").unwrap();
            assert_eq!(d, b"");
        }
    }

    #[test]
    fn segments_concatenate_in_order() {
        let mut writer = SegmentWriter::new(Vec::new()).unwrap();
        writer.append_bytes(b"first segment ").unwrap();
        writer.append_reader(&b"second"[..]).unwrap();
        let (out, totals) = writer.finish().unwrap();
        assert_eq!(totals.segments, 2);
        assert_eq!(totals.raw_bytes, 20);
        assert_eq!(totals.encoded_bytes, out.len() as u64);
        assert_eq!(decode_segments(&out, "t").unwrap(), b"first segment second");
    }

    #[test]
    fn encoded_frame_can_be_spliced() {
        let staged = compress(b"pre-compressed payload", Codec::Lz4).unwrap();
        let frames = segment_frames(&staged, "staged").unwrap();
        assert_eq!(frames.len(), 1);

        let mut writer = SegmentWriter::new(Vec::new()).unwrap();
        writer.append_bytes(b"header|").unwrap();
        writer
            .append_encoded(frames[0].frame, frames[0].raw_len)
            .unwrap();
        let (out, _) = writer.finish().unwrap();
        assert_eq!(
            decode_segments(&out, "t").unwrap(),
            b"header|pre-compressed payload"
        );
    }

    #[test]
    fn truncated_container_is_corrupt() {
        let c = compress(b"some bytes that will be truncated", Codec::Lz4).unwrap();
        let err = decompress(&c[..c.len() - 3], Codec::Lz4, "v1.lz4").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn flipped_frame_byte_is_corrupt() {
        let data: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        let mut c = compress(&data, Codec::Lz4).unwrap();
        c[HEADER_LEN] ^= 0xff;
        let err = decompress(&c, Codec::Lz4, "v1.lz4").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn garbage_zstd_is_corrupt() {
        let err = decompress(b"definitely not zstd", Codec::Zstd { level: 3 }, "v1.zstd")
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn delta_of_small_edit_is_small() {
        let base: Vec<u8> = (0..10_240u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let mut target = base.clone();
        target[5_000] ^= 0x5a;
        let delta = DeltaCompressor::compress_delta(&target, &base, 3).unwrap();
        assert!(delta.len() < target.len() / 10, "delta was {} bytes", delta.len());
        let back = DeltaCompressor::decompress_delta(&delta, &base, "d").unwrap();
        assert_eq!(back, target);
    }

    #[test]
    fn delta_rejects_empty_reference() {
        assert!(DeltaCompressor::compress_delta(b"data", b"", 3).is_err());
    }

    #[test]
    fn window_log_is_clamped() {
        assert_eq!(delta_window_log(0, 0), MIN_DELTA_WINDOW_LOG);
        assert_eq!(delta_window_log(1 << 40, 0), MAX_DELTA_WINDOW_LOG);
        assert_eq!(delta_window_log(1 << 20, 0), 21);
    }
}
