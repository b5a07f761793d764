//! Ogg page demuxer
//!
//! Pulls codec packets out of the Ogg stream an external encoder writes to
//! its stdout. Pages are read one at a time:
//!
//! ```text
//! ┌──────┬─────┬──────┬─────────┬────────┬─────┬─────┬────┬───────────────┬──────────┐
//! │ OggS │ ver │ type │ granule │ serial │ seq │ crc │ n  │ lacing[n]     │ payload  │
//! │  4   │  1  │  1   │    8    │   4    │  4  │  4  │ 1  │ n             │ Σ lacing │
//! └──────┴─────┴──────┴─────────┴────────┴─────┴─────┴────┴───────────────┴──────────┘
//! ```
//!
//! Anything that is not a page start is skipped byte by byte until the next
//! capture pattern. How the payload is cut into packets is up to a
//! [`PacketExtractor`].

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::{PacketExtraction, StreamConfig};
use crate::constants::MAX_PAGE_BYTES;
use crate::error::{Error, ProtocolError, Result};

/// Page capture pattern
pub const CAPTURE_PATTERN: [u8; 4] = *b"OggS";

/// Fixed part of a page header, capture pattern included
pub const PAGE_HEADER_LEN: usize = 27;

/// Header type flag: page continues a packet from the previous page
pub const FLAG_CONTINUED: u8 = 0x01;

/// One Ogg page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPage {
    pub header_type: u8,
    pub granule_position: u64,
    pub serial: u32,
    pub sequence: u32,
    pub segment_table: Vec<u8>,
    pub payload: Bytes,
}

impl ContainerPage {
    /// Payload split according to the segment table
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let mut pos = 0usize;
        self.segment_table.iter().map(move |&len| {
            let start = pos.min(self.payload.len());
            pos += len as usize;
            &self.payload[start..pos.min(self.payload.len())]
        })
    }

    pub fn is_continuation(&self) -> bool {
        self.header_type & FLAG_CONTINUED != 0
    }
}

/// A codec packet ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub data: Bytes,
    /// Granule position of the page that completed the packet
    pub granule_position: u64,
}

/// Turns pages into codec packets
pub trait PacketExtractor: Send {
    fn extract(&mut self, page: &ContainerPage) -> Vec<CapturedPacket>;
}

/// Keeps segments whose first byte looks like an Opus TOC byte and
/// concatenates them into one packet per page.
///
/// This is a heuristic, not a property of the container. It matches what
/// ffmpeg emits with one Opus frame per page.
#[derive(Debug, Default, Clone, Copy)]
pub struct TocHeuristic;

impl TocHeuristic {
    /// Any of the top five bits (the TOC config field) set
    pub fn looks_like_packet(segment: &[u8]) -> bool {
        segment.first().map_or(false, |&b| b & 0xF8 != 0)
    }
}

impl PacketExtractor for TocHeuristic {
    fn extract(&mut self, page: &ContainerPage) -> Vec<CapturedPacket> {
        let mut packet = BytesMut::new();
        for segment in page.segments() {
            if Self::looks_like_packet(segment) {
                packet.extend_from_slice(segment);
            }
        }

        if packet.is_empty() {
            return Vec::new();
        }
        vec![CapturedPacket {
            data: packet.freeze(),
            granule_position: page.granule_position,
        }]
    }
}

/// Proper Ogg lacing: a segment shorter than 255 bytes ends a packet, and
/// packets may span pages. Opus header packets are dropped.
#[derive(Debug, Default)]
pub struct LacingExtractor {
    partial: BytesMut,
}

impl LacingExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_header_packet(packet: &[u8]) -> bool {
        packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags")
    }
}

impl PacketExtractor for LacingExtractor {
    fn extract(&mut self, page: &ContainerPage) -> Vec<CapturedPacket> {
        if !page.is_continuation() && !self.partial.is_empty() {
            tracing::debug!(bytes = self.partial.len(), "Dropping unterminated packet");
            self.partial.clear();
        }

        let mut packets = Vec::new();
        for (segment, &lacing) in page.segments().zip(page.segment_table.iter()) {
            self.partial.extend_from_slice(segment);
            if lacing < 255 {
                let packet = self.partial.split().freeze();
                if !packet.is_empty() && !Self::is_header_packet(&packet) {
                    packets.push(CapturedPacket {
                        data: packet,
                        granule_position: page.granule_position,
                    });
                }
            }
        }
        packets
    }
}

/// Build the extractor selected in configuration
pub fn extractor_for(strategy: PacketExtraction) -> Box<dyn PacketExtractor> {
    match strategy {
        PacketExtraction::TocHeuristic => Box::new(TocHeuristic),
        PacketExtraction::Lacing => Box::new(LacingExtractor::new()),
    }
}

/// Demuxer statistics
#[derive(Debug, Clone, Default)]
pub struct DemuxStats {
    pub pages: u64,
    pub packets: u64,
    /// Bytes skipped while looking for a capture pattern
    pub skipped_bytes: u64,
    pub oversized_pages: u64,
}

/// Lazy packet sequence over an Ogg byte stream. One-shot: once the stream
/// ends the demuxer is spent.
pub struct OggDemuxer<R> {
    reader: R,
    extractor: Box<dyn PacketExtractor>,
    max_page_bytes: usize,
    pending: VecDeque<CapturedPacket>,
    stats: DemuxStats,
}

impl<R: AsyncRead + Unpin> OggDemuxer<R> {
    pub fn new(reader: R, extractor: Box<dyn PacketExtractor>) -> Self {
        Self {
            reader,
            extractor,
            max_page_bytes: MAX_PAGE_BYTES,
            pending: VecDeque::new(),
            stats: DemuxStats::default(),
        }
    }

    pub fn from_config(reader: R, config: &StreamConfig) -> Self {
        Self::new(reader, extractor_for(config.packet_extraction))
            .with_max_page_bytes(config.max_page_bytes)
    }

    pub fn with_max_page_bytes(mut self, limit: usize) -> Self {
        self.max_page_bytes = limit;
        self
    }

    pub fn stats(&self) -> &DemuxStats {
        &self.stats
    }

    /// Next packet, `Ok(None)` once the stream ends cleanly.
    ///
    /// Oversized pages are dropped and reading continues; a stream that ends
    /// inside a page yields `TruncatedPage`.
    pub async fn next_packet(&mut self) -> Result<Option<CapturedPacket>> {
        loop {
            if let Some(packet) = self.pending.pop_front() {
                self.stats.packets += 1;
                return Ok(Some(packet));
            }

            match self.read_page().await {
                Ok(Some(page)) => {
                    let packets = self.extractor.extract(&page);
                    self.pending.extend(packets);
                }
                Ok(None) => return Ok(None),
                Err(Error::Protocol(err @ ProtocolError::OversizedPage { .. })) => {
                    tracing::warn!(error = %err, "Dropping page");
                    self.stats.oversized_pages += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read the next page, skipping any bytes before its capture pattern
    pub async fn read_page(&mut self) -> Result<Option<ContainerPage>> {
        if !self.sync().await? {
            return Ok(None);
        }

        let mut header = [0u8; PAGE_HEADER_LEN - 4];
        self.read_exact_or_truncated(&mut header).await?;

        let mut fields = &header[..];
        let _version = fields.get_u8();
        let header_type = fields.get_u8();
        let granule_position = fields.get_u64_le();
        let serial = fields.get_u32_le();
        let sequence = fields.get_u32_le();
        let _crc = fields.get_u32_le();
        let page_segments = fields.get_u8() as usize;

        let mut segment_table = vec![0u8; page_segments];
        self.read_exact_or_truncated(&mut segment_table).await?;

        let total: usize = segment_table.iter().map(|&len| len as usize).sum();
        if total > self.max_page_bytes {
            return Err(ProtocolError::OversizedPage {
                size: total,
                limit: self.max_page_bytes,
            }
            .into());
        }

        let mut payload = vec![0u8; total];
        self.read_exact_or_truncated(&mut payload).await?;

        self.stats.pages += 1;
        Ok(Some(ContainerPage {
            header_type,
            granule_position,
            serial,
            sequence,
            segment_table,
            payload: Bytes::from(payload),
        }))
    }

    /// Consume bytes up to and including the next capture pattern.
    /// Returns false if the stream ends first.
    async fn sync(&mut self) -> Result<bool> {
        let mut window = [0u8; 4];
        let got = self.fill(&mut window).await?;
        if got < window.len() {
            self.stats.skipped_bytes += got as u64;
            return Ok(false);
        }

        while window != CAPTURE_PATTERN {
            let mut next = [0u8; 1];
            if self.fill(&mut next).await? == 0 {
                self.stats.skipped_bytes += window.len() as u64;
                return Ok(false);
            }
            window.rotate_left(1);
            window[3] = next[0];
            self.stats.skipped_bytes += 1;
        }

        Ok(true)
    }

    async fn read_exact_or_truncated(&mut self, buf: &mut [u8]) -> Result<()> {
        let got = self.fill(buf).await?;
        if got < buf.len() {
            return Err(ProtocolError::TruncatedPage {
                expected: buf.len(),
                got,
            }
            .into());
        }
        Ok(())
    }

    /// Read until `buf` is full or the stream ends; returns bytes read
    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}
