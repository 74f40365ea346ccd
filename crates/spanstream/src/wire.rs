//! Length-delimited report framing.
//!
//! A report on the wire is a sequence of frames, each `kind` byte + u32 LE
//! body length + MessagePack body: one header frame, one metrics frame,
//! then the span frames accumulated since the last flush. A new header
//! frame starts the next report; EOF ends the stream.
//!
//! Span frames are stored in the ring buffer exactly as they appear on the
//! wire, so a flush emits the allotted region without re-encoding.

use crate::span::SpanRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Write};
use thiserror::Error;

/// Frame prefix: kind byte plus u32 LE body length.
pub const FRAME_PREFIX_LEN: usize = 5;

/// Upper bound on a single frame body; larger lengths indicate stream
/// corruption rather than a legitimate report.
pub const MAX_FRAME_BODY_LEN: usize = 16 << 20;

/// Wire-level errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown frame kind {0}")]
    UnknownFrameKind(u8),
    #[error("frame body of {0} bytes exceeds the maximum")]
    OversizedFrame(usize),
    #[error("failed to encode frame body: {0}")]
    Encode(String),
    #[error("failed to decode frame body: {0}")]
    Decode(String),
}

/// Frame kinds, in report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Header = 0,
    Metrics = 1,
    Span = 2,
}

impl FrameKind {
    fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0 => Ok(Self::Header),
            1 => Ok(Self::Metrics),
            2 => Ok(Self::Span),
            other => Err(WireError::UnknownFrameKind(other)),
        }
    }
}

/// Report header shared by every report a recorder emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportHeader {
    /// Random identifier distinguishing recorder instances.
    pub reporter_id: u64,
    pub access_token: String,
    pub component_name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Per-report metrics: spans dropped since the previous report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsFrame {
    pub dropped_spans: u64,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Header(ReportHeader),
    Metrics(MetricsFrame),
    Span(SpanRecord),
}

/// `io::Write` sink that only counts, for sizing passes.
#[derive(Default)]
struct CountingWriter {
    written: usize,
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn body_len<T: Serialize>(value: &T) -> io::Result<usize> {
    let mut counter = CountingWriter::default();
    rmp_serde::encode::write_named(&mut counter, value)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(counter.written)
}

/// On-wire length of `span` as a frame, prefix included.
///
/// This is the sizing pass of the two-pass serialization: the recorder
/// reserves exactly this many ring bytes, then serializes into them with
/// [`write_span_frame`].
pub fn span_frame_len(span: &SpanRecord) -> io::Result<usize> {
    Ok(FRAME_PREFIX_LEN + body_len(span)?)
}

/// Serializes `span` as a frame of exactly `frame_len` bytes into `writer`.
///
/// `frame_len` must come from [`span_frame_len`] over the same value.
pub fn write_span_frame<W: Write>(
    writer: &mut W,
    span: &SpanRecord,
    frame_len: usize,
) -> io::Result<()> {
    let body = (frame_len - FRAME_PREFIX_LEN) as u32;
    writer.write_all(&[FrameKind::Span as u8])?;
    writer.write_all(&body.to_le_bytes())?;
    rmp_serde::encode::write_named(writer, span)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn encode_frame<T: Serialize>(kind: FrameKind, value: &T) -> Result<Vec<u8>, WireError> {
    let body =
        rmp_serde::to_vec_named(value).map_err(|err| WireError::Encode(err.to_string()))?;
    let mut frame = Vec::with_capacity(FRAME_PREFIX_LEN + body.len());
    frame.push(kind as u8);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encodes the report header frame. Built once per recorder and shared.
pub fn encode_header_frame(header: &ReportHeader) -> Result<Vec<u8>, WireError> {
    encode_frame(FrameKind::Header, header)
}

/// Encodes a metrics frame carrying the dropped-span count.
pub fn encode_metrics_frame(dropped_spans: u64) -> Result<Vec<u8>, WireError> {
    encode_frame(FrameKind::Metrics, &MetricsFrame { dropped_spans })
}

/// Counts the span frames laid back-to-back across the (possibly split)
/// allotment region.
///
/// The region holds only whole, committed span frames, so running off a
/// prefix means cursor corruption; the walk treats that as zero remaining
/// rather than reading past the region.
pub fn count_span_frames(first: &[u8], second: &[u8]) -> usize {
    let total = first.len() + second.len();
    let at = |i: usize| {
        if i < first.len() {
            first[i]
        } else {
            second[i - first.len()]
        }
    };

    let mut pos = 0usize;
    let mut count = 0usize;
    while pos + FRAME_PREFIX_LEN <= total {
        let body = u32::from_le_bytes([at(pos + 1), at(pos + 2), at(pos + 3), at(pos + 4)]);
        pos += FRAME_PREFIX_LEN + body as usize;
        if pos > total {
            break;
        }
        count += 1;
    }
    count
}

/// Incremental frame decoder for the satellite side of the stream.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pos: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw stream bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        // Reclaim consumed prefix before growing.
        if self.pos > 0 && self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > 4096 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Decodes the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, WireError> {
        let available = self.buf.len() - self.pos;
        if available < FRAME_PREFIX_LEN {
            return Ok(None);
        }
        let kind = FrameKind::from_byte(self.buf[self.pos])?;
        let body_len = u32::from_le_bytes([
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
            self.buf[self.pos + 4],
        ]) as usize;
        if body_len > MAX_FRAME_BODY_LEN {
            return Err(WireError::OversizedFrame(body_len));
        }
        if available < FRAME_PREFIX_LEN + body_len {
            return Ok(None);
        }

        let body_start = self.pos + FRAME_PREFIX_LEN;
        let body = &self.buf[body_start..body_start + body_len];
        let frame = match kind {
            FrameKind::Header => Frame::Header(
                rmp_serde::from_slice(body).map_err(|err| WireError::Decode(err.to_string()))?,
            ),
            FrameKind::Metrics => Frame::Metrics(
                rmp_serde::from_slice(body).map_err(|err| WireError::Decode(err.to_string()))?,
            ),
            FrameKind::Span => Frame::Span(
                rmp_serde::from_slice(body).map_err(|err| WireError::Decode(err.to_string()))?,
            ),
        };
        self.pos = body_start + body_len;
        Ok(Some(frame))
    }

    /// Whether a partial frame is still buffered.
    pub fn has_partial_frame(&self) -> bool {
        self.pos < self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{ReferenceKind, TagValue};

    fn sample_span() -> SpanRecord {
        let mut span = SpanRecord::new(42, 7, "query.users");
        span.parent_span_id = Some(6);
        span.start_timestamp_micros = 1_700_000_000_000_000;
        span.duration_micros = 1_250;
        span.set_tag("db.kind", TagValue::String("postgres".into()));
        span.set_tag("rows", TagValue::Int(38));
        span.set_tag("cache_hit", TagValue::Bool(false));
        span.set_tag("load", TagValue::Double(0.75));
        span.log(
            1_700_000_000_000_100,
            [("event".to_string(), "retry".to_string())].into(),
        );
        span.set_baggage_item("tenant", "acme");
        span.add_reference(ReferenceKind::ChildOf, 42, 6);
        span
    }

    #[test]
    fn span_frame_round_trips_key_by_key() {
        let span = sample_span();
        let len = span_frame_len(&span).unwrap();
        let mut encoded = Vec::new();
        write_span_frame(&mut encoded, &span, len).unwrap();
        assert_eq!(encoded.len(), len);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded);
        let frame = decoder.next_frame().unwrap().unwrap();
        match frame {
            Frame::Span(decoded) => {
                assert_eq!(decoded.tags, span.tags);
                assert_eq!(decoded.logs, span.logs);
                assert_eq!(decoded.baggage, span.baggage);
                assert_eq!(decoded, span);
            }
            other => panic!("expected span frame, got {other:?}"),
        }
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn header_and_metrics_frames_round_trip() {
        let header = ReportHeader {
            reporter_id: 99,
            access_token: "token".into(),
            component_name: "api".into(),
            tags: [("region".to_string(), "eu-1".to_string())].into(),
        };
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode_header_frame(&header).unwrap());
        decoder.feed(&encode_metrics_frame(17).unwrap());

        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(Frame::Header(header.clone()))
        );
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(Frame::Metrics(MetricsFrame { dropped_spans: 17 }))
        );
    }

    #[test]
    fn decoder_handles_byte_at_a_time_feeding() {
        let span = sample_span();
        let len = span_frame_len(&span).unwrap();
        let mut encoded = Vec::new();
        write_span_frame(&mut encoded, &span, len).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut decoded = None;
        for byte in &encoded {
            decoder.feed(std::slice::from_ref(byte));
            if let Some(frame) = decoder.next_frame().unwrap() {
                decoded = Some(frame);
            }
        }
        assert_eq!(decoded, Some(Frame::Span(span)));
        assert!(!decoder.has_partial_frame());
    }

    #[test]
    fn unknown_frame_kind_is_an_error() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[9, 0, 0, 0, 0]);
        assert!(matches!(
            decoder.next_frame(),
            Err(WireError::UnknownFrameKind(9))
        ));
    }

    #[test]
    fn counts_frames_across_a_split_region() {
        let span = sample_span();
        let len = span_frame_len(&span).unwrap();
        let mut encoded = Vec::new();
        for _ in 0..3 {
            write_span_frame(&mut encoded, &span, len).unwrap();
        }
        // Split in the middle of the second frame's prefix.
        let split = len + 2;
        assert_eq!(count_span_frames(&encoded[..split], &encoded[split..]), 3);
        assert_eq!(count_span_frames(&encoded, &[]), 3);
        assert_eq!(count_span_frames(&[], &[]), 0);
    }
}
