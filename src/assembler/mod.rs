//! Frame reassembly from out-of-order data packets.
//!
//! The assembler owns an arena of `total_packets + 1` fixed-size slots
//! (index 0 unused, devices number payload packets from 1) allocated once per
//! connect, and an arrival bitmap over the same indices. Every exposure starts
//! with [`FrameAssembler::begin_frame`], which clears the bitmap and byte
//! counter without touching the arena.
//!
//! ## Invariants
//!
//! - A slot is written at most once per frame; duplicates are dropped
//! - `bytes_received` is the sum of the marked slots' lengths
//! - A frame is complete exactly when `bytes_received == frame_bytes`
//! - Gaps are reported only for jumps past the highest index seen, so a late
//!   packet filling a hole never re-reports a run already requested
//!
//! The last payload packet carries the device's 64-byte end-of-frame marker,
//! which is stripped before the slot length is counted.

mod bitmap;

pub use bitmap::PacketBitmap;

use std::time::Instant;
use tracing::{debug, trace};

use crate::protocol::{DataPacket, PacketKind};
use crate::retransmit::{RetransmitRequest, scan_gaps};
use crate::types::{CameraDescriptor, PixelBuffer, TRAILER_RESERVE};
use crate::{CameraError, Result};

/// Why a packet was not ingested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No frame has been started
    NotStarted,
    /// Belongs to the previous, retired frame
    StaleFrame,
    /// Frame id differs from the current frame's
    ForeignFrame,
    /// Index 0 or past the last packet
    IndexOutOfRange,
    /// Payload longer than a slot
    Oversized,
    /// Frame already complete
    AlreadyComplete,
}

/// Result of ingesting one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Leader recorded or payload stored
    Accepted,
    /// Payload for an index that is already marked
    Duplicate,
    /// This packet completed the frame
    Complete,
    /// Payload jumped forward past unreceived indices
    GapDetected(RetransmitRequest),
    /// Trailer arrived before the frame was complete
    EarlyTrailer,
    /// Trailer arrived after an abort; the frame is retired
    Drained,
    Ignored(IgnoreReason),
}

/// Per-exposure packet reassembly buffer
pub struct FrameAssembler {
    descriptor: CameraDescriptor,
    slot_size: usize,
    arena: Vec<u8>,
    lengths: Vec<usize>,
    bitmap: PacketBitmap,
    bytes_received: usize,
    frame_id: Option<u16>,
    retired: Option<u16>,
    highest_index: Option<u32>,
    active: bool,
    aborted: bool,
    complete: bool,
    last_packet: Option<Instant>,
}

impl FrameAssembler {
    /// Allocate the slot table for `descriptor`.
    pub fn new(descriptor: CameraDescriptor) -> Self {
        let slots = descriptor.total_packets() as usize + 1;
        let slot_size = descriptor.effective_payload();
        Self {
            descriptor,
            slot_size,
            arena: vec![0; slots * slot_size],
            lengths: vec![0; slots],
            bitmap: PacketBitmap::new(slots),
            bytes_received: 0,
            frame_id: None,
            retired: None,
            highest_index: None,
            active: false,
            aborted: false,
            complete: false,
            last_packet: None,
        }
    }

    /// Reset for a new frame.
    ///
    /// `frame_id` pins the expected id when the caller knows it; otherwise
    /// the leader (or the first payload if the leader is lost) establishes it.
    /// The previous frame's id is remembered so its late packets are dropped.
    pub fn begin_frame(&mut self, frame_id: Option<u16>) {
        if let Some(previous) = self.frame_id.take() {
            self.retired = Some(previous);
        }
        self.bitmap.clear();
        self.bytes_received = 0;
        self.frame_id = frame_id;
        self.highest_index = None;
        self.active = true;
        self.aborted = false;
        self.complete = false;
        self.last_packet = None;
        debug!(frame_id = ?frame_id, retired = ?self.retired, "frame started");
    }

    /// Flag the frame as aborted; a later trailer drains it.
    pub fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    /// Stop accepting packets until the next [`begin_frame`](Self::begin_frame).
    pub fn retire(&mut self) {
        self.active = false;
    }

    pub fn ingest(&mut self, packet: &DataPacket<'_>, now: Instant) -> IngestOutcome {
        if !self.active {
            return IngestOutcome::Ignored(IgnoreReason::NotStarted);
        }
        if self.retired == Some(packet.frame_id) && self.frame_id != Some(packet.frame_id) {
            trace!(frame_id = packet.frame_id, "dropping packet of retired frame");
            return IngestOutcome::Ignored(IgnoreReason::StaleFrame);
        }
        if self.frame_id.is_some_and(|id| id != packet.frame_id) && packet.kind != PacketKind::Leader {
            return IngestOutcome::Ignored(IgnoreReason::ForeignFrame);
        }

        self.last_packet = Some(now);
        if self.complete {
            return IngestOutcome::Ignored(IgnoreReason::AlreadyComplete);
        }

        match packet.kind {
            PacketKind::Leader => {
                self.frame_id = Some(packet.frame_id);
                self.advance(packet.index);
                trace!(frame_id = packet.frame_id, index = packet.index, "leader");
                IngestOutcome::Accepted
            }
            PacketKind::Payload => self.ingest_payload(packet),
            PacketKind::Trailer => {
                if self.aborted {
                    debug!(frame_id = packet.frame_id, "trailer after abort, frame drained");
                    self.active = false;
                    IngestOutcome::Drained
                } else {
                    debug!(
                        frame_id = packet.frame_id,
                        received = self.bytes_received,
                        expected = self.descriptor.frame_bytes(),
                        "trailer before frame complete"
                    );
                    IngestOutcome::EarlyTrailer
                }
            }
        }
    }

    fn ingest_payload(&mut self, packet: &DataPacket<'_>) -> IngestOutcome {
        let index = packet.index;
        let Some(range) = self.descriptor.pixel_range(index) else {
            return IngestOutcome::Ignored(IgnoreReason::IndexOutOfRange);
        };
        if packet.payload.len() > self.slot_size {
            return IngestOutcome::Ignored(IgnoreReason::Oversized);
        }

        let mut len = packet.payload.len();
        if index == self.descriptor.total_packets() {
            len = len.saturating_sub(TRAILER_RESERVE);
        }
        // Marker bytes spilling into the second-to-last packet lie past the frame
        len = len.min(range.len());

        if !self.bitmap.set(index as usize) {
            return IngestOutcome::Duplicate;
        }
        let offset = index as usize * self.slot_size;
        self.arena[offset..offset + len].copy_from_slice(&packet.payload[..len]);
        self.lengths[index as usize] = len;
        self.bytes_received += len;

        let previous = self.highest_index;
        self.advance(index);
        if self.bytes_received == self.descriptor.frame_bytes() {
            self.complete = true;
            debug!(frame_id = ?self.frame_id, packets = self.bitmap.count(), "frame complete");
            return IngestOutcome::Complete;
        }

        let Some(frame_id) = self.frame_id else {
            // Leader lost; the first payload establishes the frame
            self.frame_id = Some(packet.frame_id);
            return IngestOutcome::Accepted;
        };
        match previous {
            Some(previous) if index > previous + 1 => {
                let from = previous as usize + 1;
                match self.bitmap.next_unmarked(from, index as usize) {
                    Some(first) => {
                        let last = self
                            .bitmap
                            .next_marked(first, index as usize)
                            .unwrap_or(index as usize)
                            - 1;
                        IngestOutcome::GapDetected(RetransmitRequest {
                            frame_id,
                            first: first as u32,
                            last: last as u32,
                        })
                    }
                    None => IngestOutcome::Accepted,
                }
            }
            _ => IngestOutcome::Accepted,
        }
    }

    fn advance(&mut self, index: u32) {
        self.highest_index = Some(self.highest_index.map_or(index, |highest| highest.max(index)));
    }

    /// Reconstructed frame, if every byte arrived.
    ///
    /// Otherwise reports the missing runs as [`CameraError::FrameIncomplete`].
    pub fn finish(&self) -> Result<PixelBuffer> {
        let expected = self.descriptor.frame_bytes();
        if !self.complete || self.bytes_received != expected {
            return Err(CameraError::FrameIncomplete {
                frame_id: self.frame_id,
                received: self.bytes_received,
                expected,
                missing: self.missing(),
            });
        }

        let mut data = Vec::with_capacity(expected);
        for index in 1..=self.descriptor.total_packets() as usize {
            if self.bitmap.get(index) {
                let offset = index * self.slot_size;
                data.extend_from_slice(&self.arena[offset..offset + self.lengths[index]]);
            }
        }
        Ok(PixelBuffer::new(data, self.descriptor.width(), self.descriptor.height(), self.frame_id))
    }

    /// Runs of packets not yet received
    pub fn missing(&self) -> Vec<(u32, u32)> {
        scan_gaps(&self.bitmap, self.descriptor.total_packets())
    }

    pub fn descriptor(&self) -> &CameraDescriptor {
        &self.descriptor
    }

    pub fn bitmap(&self) -> &PacketBitmap {
        &self.bitmap
    }

    pub fn frame_id(&self) -> Option<u16> {
        self.frame_id
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// When the last packet of the current frame arrived
    pub fn last_packet(&self) -> Option<Instant> {
        self.last_packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FrameDatagrams, test_pattern};
    use proptest::prelude::*;

    fn small_descriptor() -> CameraDescriptor {
        // 200 pixel bytes + 64 marker bytes over 66-byte payloads: 4 packets
        CameraDescriptor::with_payload(10, 10, 66).unwrap()
    }

    fn ingest_raw(assembler: &mut FrameAssembler, datagram: &[u8]) -> IngestOutcome {
        let packet = DataPacket::parse(datagram).unwrap();
        assembler.ingest(&packet, Instant::now())
    }

    #[test]
    fn in_order_frame_is_bit_identical() {
        let descriptor = small_descriptor();
        let pixels = test_pattern(descriptor.frame_bytes());
        let frame = FrameDatagrams::build(&descriptor, 7, &pixels);
        let mut assembler = FrameAssembler::new(descriptor);
        assembler.begin_frame(None);

        assert_eq!(ingest_raw(&mut assembler, &frame.leader), IngestOutcome::Accepted);
        let (last, body) = frame.payloads.split_last().unwrap();
        for datagram in body {
            assert_eq!(ingest_raw(&mut assembler, datagram), IngestOutcome::Accepted);
        }
        assert_eq!(ingest_raw(&mut assembler, last), IngestOutcome::Complete);
        assert_eq!(
            ingest_raw(&mut assembler, &frame.trailer),
            IngestOutcome::Ignored(IgnoreReason::AlreadyComplete)
        );

        let buffer = assembler.finish().unwrap();
        assert_eq!(buffer.frame_id, Some(7));
        assert_eq!(&buffer.data[..], &pixels[..]);
    }

    #[test]
    fn marker_straddling_two_packets_is_stripped() {
        // 264 stream bytes over 64-byte payloads: packet 4 holds the last 8 pixel
        // bytes and the start of the marker, packet 5 the rest of the marker
        let descriptor = CameraDescriptor::with_payload(10, 10, 64).unwrap();
        assert_eq!(descriptor.total_packets(), 5);
        let pixels = test_pattern(descriptor.frame_bytes());
        let frame = FrameDatagrams::build(&descriptor, 3, &pixels);
        let mut assembler = FrameAssembler::new(descriptor);
        assembler.begin_frame(None);

        let outcomes: Vec<_> =
            frame.payloads.iter().map(|datagram| ingest_raw(&mut assembler, datagram)).collect();
        assert_eq!(outcomes[3], IngestOutcome::Complete);
        assert_eq!(outcomes[4], IngestOutcome::Ignored(IgnoreReason::AlreadyComplete));
        assert_eq!(&assembler.finish().unwrap().data[..], &pixels[..]);
    }

    #[test]
    fn duplicate_does_not_change_byte_count() {
        let descriptor = small_descriptor();
        let frame = FrameDatagrams::build(&descriptor, 1, &test_pattern(descriptor.frame_bytes()));
        let mut assembler = FrameAssembler::new(descriptor);
        assembler.begin_frame(Some(1));

        ingest_raw(&mut assembler, &frame.payloads[0]);
        let before = assembler.bytes_received();
        assert_eq!(ingest_raw(&mut assembler, &frame.payloads[0]), IngestOutcome::Duplicate);
        assert_eq!(assembler.bytes_received(), before);
    }

    #[test]
    fn forward_jump_requests_the_skipped_run() {
        let descriptor = CameraDescriptor::with_payload(64, 64, 1024).unwrap();
        let frame = FrameDatagrams::build(&descriptor, 2, &test_pattern(descriptor.frame_bytes()));
        let mut assembler = FrameAssembler::new(descriptor);
        assembler.begin_frame(None);

        ingest_raw(&mut assembler, &frame.leader);
        ingest_raw(&mut assembler, &frame.payloads[0]);
        assert_eq!(
            ingest_raw(&mut assembler, &frame.payloads[4]),
            IngestOutcome::GapDetected(RetransmitRequest { frame_id: 2, first: 2, last: 4 })
        );
        // late arrival filling the hole is reordering, not a new gap
        assert_eq!(ingest_raw(&mut assembler, &frame.payloads[2]), IngestOutcome::Accepted);
        assert_eq!(assembler.missing(), vec![(2, 2), (4, 4), (6, descriptor.total_packets())]);
    }

    #[test]
    fn filled_hole_does_not_re_report_the_pending_run() {
        let descriptor = CameraDescriptor::with_payload(64, 64, 1024).unwrap();
        let frame = FrameDatagrams::build(&descriptor, 2, &test_pattern(descriptor.frame_bytes()));
        let mut assembler = FrameAssembler::new(descriptor);
        assembler.begin_frame(None);

        // leader, 1, 5, then 3 fills part of the hole and 6 follows 5
        let order = [&frame.leader, &frame.payloads[0], &frame.payloads[4], &frame.payloads[2], &frame.payloads[5]];
        let outcomes: Vec<_> =
            order.into_iter().map(|datagram| ingest_raw(&mut assembler, datagram)).collect();
        assert_eq!(
            outcomes,
            vec![
                IngestOutcome::Accepted,
                IngestOutcome::Accepted,
                IngestOutcome::GapDetected(RetransmitRequest { frame_id: 2, first: 2, last: 4 }),
                IngestOutcome::Accepted,
                IngestOutcome::Accepted,
            ]
        );

        // a new hole past the high-water mark still counts
        assert_eq!(
            ingest_raw(&mut assembler, &frame.payloads[7]),
            IngestOutcome::GapDetected(RetransmitRequest { frame_id: 2, first: 7, last: 7 })
        );
    }

    #[test]
    fn lost_leader_adopts_frame_id_without_gap_request() {
        let descriptor = CameraDescriptor::with_payload(64, 64, 1024).unwrap();
        let frame = FrameDatagrams::build(&descriptor, 9, &test_pattern(descriptor.frame_bytes()));
        let mut assembler = FrameAssembler::new(descriptor);
        assembler.begin_frame(None);

        assert_eq!(ingest_raw(&mut assembler, &frame.payloads[3]), IngestOutcome::Accepted);
        assert_eq!(assembler.frame_id(), Some(9));
    }

    #[test]
    fn early_trailer_and_drain_after_abort() {
        let descriptor = small_descriptor();
        let frame = FrameDatagrams::build(&descriptor, 4, &test_pattern(descriptor.frame_bytes()));
        let mut assembler = FrameAssembler::new(descriptor);
        assembler.begin_frame(None);
        ingest_raw(&mut assembler, &frame.leader);
        ingest_raw(&mut assembler, &frame.payloads[0]);
        assert_eq!(ingest_raw(&mut assembler, &frame.trailer), IngestOutcome::EarlyTrailer);

        assembler.mark_aborted();
        assert_eq!(ingest_raw(&mut assembler, &frame.trailer), IngestOutcome::Drained);
        assert!(!assembler.is_active());
        assert!(matches!(assembler.finish(), Err(CameraError::FrameIncomplete { .. })));
    }

    #[test]
    fn stale_and_malformed_packets_are_ignored() {
        let descriptor = small_descriptor();
        let pixels = test_pattern(descriptor.frame_bytes());
        let old = FrameDatagrams::build(&descriptor, 5, &pixels);
        let new = FrameDatagrams::build(&descriptor, 6, &pixels);
        let mut assembler = FrameAssembler::new(descriptor);

        assert_eq!(
            ingest_raw(&mut assembler, &old.payloads[0]),
            IngestOutcome::Ignored(IgnoreReason::NotStarted)
        );
        assembler.begin_frame(None);
        ingest_raw(&mut assembler, &old.leader);
        assembler.begin_frame(None);
        assert_eq!(
            ingest_raw(&mut assembler, &old.payloads[1]),
            IngestOutcome::Ignored(IgnoreReason::StaleFrame)
        );
        ingest_raw(&mut assembler, &new.leader);
        assert_eq!(
            ingest_raw(&mut assembler, &old.payloads[1]),
            IngestOutcome::Ignored(IgnoreReason::StaleFrame)
        );

        let zero = DataPacket { status: 0, frame_id: 6, kind: PacketKind::Payload, index: 0, payload: &[0; 8] };
        let past = DataPacket { index: 5, ..zero };
        let oversized = DataPacket { index: 1, payload: &[0; 67], ..zero };
        let now = Instant::now();
        assert_eq!(assembler.ingest(&zero, now), IngestOutcome::Ignored(IgnoreReason::IndexOutOfRange));
        assert_eq!(assembler.ingest(&past, now), IngestOutcome::Ignored(IgnoreReason::IndexOutOfRange));
        assert_eq!(assembler.ingest(&oversized, now), IngestOutcome::Ignored(IgnoreReason::Oversized));
        assert_eq!(assembler.bytes_received(), 0);
    }

    #[test]
    fn incomplete_finish_reports_missing_runs() {
        let descriptor = small_descriptor();
        let frame = FrameDatagrams::build(&descriptor, 1, &test_pattern(descriptor.frame_bytes()));
        let mut assembler = FrameAssembler::new(descriptor);
        assembler.begin_frame(Some(1));
        ingest_raw(&mut assembler, &frame.payloads[0]);
        ingest_raw(&mut assembler, &frame.payloads[3]);

        match assembler.finish() {
            Err(CameraError::FrameIncomplete { frame_id, received, expected, missing }) => {
                assert_eq!(frame_id, Some(1));
                assert_eq!(received, 68);
                assert_eq!(expected, 200);
                assert_eq!(missing, vec![(2, 3)]);
            }
            other => panic!("Expected FrameIncomplete, got {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn any_arrival_order_reconstructs_the_frame(
            order in Just((0usize..23).collect::<Vec<_>>()).prop_shuffle(),
            duplicates in proptest::collection::vec(0usize..23, 0..10),
        ) {
            // 32x32 frame: 2048 pixel bytes + 64 marker bytes over 96-byte payloads
            let descriptor = CameraDescriptor::with_payload(32, 32, 96).unwrap();
            prop_assert_eq!(descriptor.total_packets(), 22);
            let pixels = test_pattern(descriptor.frame_bytes());
            let frame = FrameDatagrams::build(&descriptor, 11, &pixels);
            let mut assembler = FrameAssembler::new(descriptor);
            assembler.begin_frame(None);

            let mut completions = 0;
            for (position, &slot) in order.iter().enumerate() {
                // slot 22 stands for the leader
                let datagram = if slot == 22 { &frame.leader } else { &frame.payloads[slot] };
                if ingest_raw(&mut assembler, datagram) == IngestOutcome::Complete {
                    completions += 1;
                }
                if let Some(&dup) = duplicates.get(position) {
                    if dup < 22 && assembler.bitmap().get(dup + 1) && !assembler.is_complete() {
                        let before = assembler.bytes_received();
                        prop_assert_eq!(ingest_raw(&mut assembler, &frame.payloads[dup]), IngestOutcome::Duplicate);
                        prop_assert_eq!(assembler.bytes_received(), before);
                    }
                }
            }

            prop_assert_eq!(completions, 1);
            prop_assert_eq!(assembler.bytes_received(), descriptor.frame_bytes());
            let buffer = assembler.finish().unwrap();
            prop_assert_eq!(&buffer.data[..], &pixels[..]);
        }
    }
}
