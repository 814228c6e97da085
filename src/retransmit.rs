//! Gap scanning and selective resend policy.
//!
//! The device resends a run of packets when asked with a resend command; the
//! resent packets arrive as ordinary payload packets and are ingested by the
//! assembler like any other. Requests are therefore fire-and-forget, and the
//! policy here only decides *which* run to request and *whether* to request it
//! again.
//!
//! Only the oldest gap is requested per invocation. Later gaps surface on the
//! next scan, triggered by the watchdog or by the next unexpected index. A
//! frame gets a bounded number of requests; past that it is given up as
//! incomplete.

use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::assembler::{FrameAssembler, PacketBitmap};
use crate::config::RetransmitSection;

/// One contiguous run of missing packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetransmitRequest {
    pub frame_id: u16,
    pub first: u32,
    pub last: u32,
}

impl RetransmitRequest {
    pub fn packets(&self) -> u32 {
        self.last - self.first + 1
    }
}

/// Maximal runs of unmarked indices in `1..=total`, oldest first.
pub fn scan_gaps(bitmap: &PacketBitmap, total: u32) -> Vec<(u32, u32)> {
    let end = total as usize + 1;
    let mut gaps = Vec::new();
    let mut cursor = 1;
    while let Some(first) = bitmap.next_unmarked(cursor, end) {
        let last = bitmap.next_marked(first, end).unwrap_or(end) - 1;
        gaps.push((first as u32, last as u32));
        cursor = last + 1;
    }
    gaps
}

/// What the controller decided after a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitDecision {
    /// Send this request
    Request(RetransmitRequest),
    /// Same run was requested within the backoff, or nothing to do yet
    Suppressed,
    /// Every packet arrived yet the byte count is wrong; resending cannot help
    NoGaps,
    /// Packets are still missing but the frame's request budget is spent
    Exhausted,
}

/// De-duplicating resend policy for one frame at a time
#[derive(Debug, Clone)]
pub struct RetransmitController {
    backoff: Duration,
    max_requests: u32,
    last: Option<(RetransmitRequest, Instant)>,
    issued: u32,
}

impl RetransmitController {
    pub fn new(backoff: Duration, max_requests: u32) -> Self {
        Self { backoff, max_requests, last: None, issued: 0 }
    }

    pub fn from_settings(settings: &RetransmitSection) -> Self {
        Self::new(settings.backoff(), settings.max_requests)
    }

    /// Forget previous requests; called at the start of every frame.
    pub fn reset(&mut self) {
        self.last = None;
        self.issued = 0;
    }

    /// Requests issued since the last reset
    pub fn issued(&self) -> u32 {
        self.issued
    }

    /// Whether the frame's request budget is spent
    pub fn is_exhausted(&self) -> bool {
        self.issued >= self.max_requests
    }

    /// Admit `request` unless the budget is spent or the identical run went
    /// out within the backoff.
    pub fn admit(&mut self, request: RetransmitRequest, now: Instant) -> bool {
        if self.is_exhausted() {
            trace!(first = request.first, last = request.last, issued = self.issued, "resend budget spent");
            return false;
        }
        let repeated = self.last.is_some_and(|(previous, at)| {
            previous == request && now.saturating_duration_since(at) < self.backoff
        });
        if repeated {
            trace!(first = request.first, last = request.last, "resend suppressed by backoff");
            return false;
        }
        self.last = Some((request, now));
        self.issued += 1;
        true
    }

    /// Scan the assembler and pick the oldest gap to request.
    pub fn next_request(&mut self, assembler: &FrameAssembler, now: Instant) -> RetransmitDecision {
        if assembler.is_complete() {
            return RetransmitDecision::Suppressed;
        }
        let Some(frame_id) = assembler.frame_id() else {
            return RetransmitDecision::Suppressed;
        };
        let total = assembler.descriptor().total_packets();
        match scan_gaps(assembler.bitmap(), total).first() {
            Some(_) if self.is_exhausted() => {
                debug!(frame_id, issued = self.issued, "giving up on missing packets");
                RetransmitDecision::Exhausted
            }
            Some(&(first, last)) => {
                let request = RetransmitRequest { frame_id, first, last };
                if self.admit(request, now) {
                    RetransmitDecision::Request(request)
                } else {
                    RetransmitDecision::Suppressed
                }
            }
            None => {
                debug!(
                    frame_id,
                    received = assembler.bytes_received(),
                    expected = assembler.descriptor().frame_bytes(),
                    "all packets marked but frame size mismatched"
                );
                RetransmitDecision::NoGaps
            }
        }
    }
}
