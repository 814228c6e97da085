//! Inbound datagram dispatch
//!
//! One task owns the read side of both sockets. Control replies are forwarded
//! to the register channel's reply queue; data packets are classified and fed
//! to the frame assembler. The task never waits on the register channel
//! itself: resend requests are sent from short-lived spawned tasks, because
//! the channel may be blocked waiting for a reply only this task can deliver.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::assembler::{FrameAssembler, IngestOutcome};
use crate::channel::RegisterChannel;
use crate::machine::ExposureStateMachine;
use crate::protocol::{ControlReply, DataPacket};
use crate::retransmit::{RetransmitController, RetransmitDecision, RetransmitRequest};
use crate::transport::DatagramLink;
use crate::types::CameraDescriptor;

const MAX_DATAGRAM: usize = 65_536;
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Transfer state shared by the receiver and the backend's command path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferSignal {
    Pending,
    Complete,
    /// Trailer seen after an abort
    Drained,
    /// Cannot complete: the resend budget is spent, or every packet arrived
    /// yet the frame size is wrong
    Stalled,
}

/// Assembler, resend policy and completion signal of the current frame
pub(crate) struct Transfer {
    assembler: Mutex<Option<FrameAssembler>>,
    retransmit: Mutex<RetransmitController>,
    signal: watch::Sender<TransferSignal>,
}

/// Packet arrival clock, read from tokio's timer so it agrees with the watchdog's
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Transfer {
    pub(crate) fn new(retransmit: RetransmitController) -> Self {
        let (signal, _) = watch::channel(TransferSignal::Pending);
        Self {
            assembler: Mutex::new(None),
            retransmit: Mutex::new(retransmit),
            signal,
        }
    }

    /// Allocate the slot table once the frame layout is known.
    pub(crate) fn install(&self, descriptor: CameraDescriptor) {
        *lock(&self.assembler) = Some(FrameAssembler::new(descriptor));
    }

    /// Run `f` on the assembler, if one is installed.
    pub(crate) fn with_assembler<R>(&self, f: impl FnOnce(&mut FrameAssembler) -> R) -> Option<R> {
        lock(&self.assembler).as_mut().map(f)
    }

    pub(crate) fn begin(&self) {
        self.with_assembler(|assembler| assembler.begin_frame(None));
        lock(&self.retransmit).reset();
        self.signal.send_replace(TransferSignal::Pending);
    }

    pub(crate) fn abort(&self) {
        self.with_assembler(FrameAssembler::mark_aborted);
    }

    pub(crate) fn since_last_packet(&self, now: Instant) -> Option<Duration> {
        self.with_assembler(|assembler| assembler.last_packet())
            .flatten()
            .map(|at| now.saturating_duration_since(at))
    }

    /// Wait for the current frame to leave `Pending`.
    pub(crate) async fn wait(&self) -> TransferSignal {
        let mut rx = self.signal.subscribe();
        match rx.wait_for(|signal| *signal != TransferSignal::Pending).await {
            Ok(signal) => *signal,
            Err(_) => TransferSignal::Stalled,
        }
    }

    fn finish(&self, signal: TransferSignal) {
        self.signal.send_replace(signal);
    }

    fn admit(&self, request: RetransmitRequest, now: Instant) -> bool {
        lock(&self.retransmit).admit(request, now)
    }

    /// Pick the oldest gap to request.
    ///
    /// When resending cannot help any more the frame is retired and the
    /// transfer flagged as stalled, so the download reports what is missing.
    pub(crate) fn next_resend(&self, now: Instant) -> RetransmitDecision {
        let mut assembler = lock(&self.assembler);
        let Some(assembler) = assembler.as_mut() else {
            return RetransmitDecision::Suppressed;
        };
        let decision = lock(&self.retransmit).next_request(assembler, now);
        if matches!(decision, RetransmitDecision::NoGaps | RetransmitDecision::Exhausted) {
            warn!(
                ?decision,
                received = assembler.bytes_received(),
                expected = assembler.descriptor().frame_bytes(),
                "frame cannot complete, stopping transfer"
            );
            assembler.retire();
            self.finish(TransferSignal::Stalled);
        }
        decision
    }
}

/// Fire a resend request without blocking the caller.
pub(crate) fn send_resend(channel: &Arc<RegisterChannel>, request: RetransmitRequest) {
    let channel = channel.clone();
    tokio::spawn(async move {
        if let Err(e) = channel.request_resend(request.frame_id, request.first, request.last).await {
            warn!(first = request.first, last = request.last, "resend request failed: {}", e);
        }
    });
}

/// Inbound dispatch task
pub(crate) struct DatagramReceiver {
    pub(crate) control: Arc<dyn DatagramLink>,
    pub(crate) data: Arc<dyn DatagramLink>,
    pub(crate) replies: mpsc::Sender<ControlReply>,
    pub(crate) transfer: Arc<Transfer>,
    pub(crate) channel: Arc<RegisterChannel>,
    pub(crate) machine: ExposureStateMachine,
    pub(crate) cancel: CancellationToken,
}

impl DatagramReceiver {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!("datagram receiver started");
        let mut control_buf = vec![0u8; MAX_DATAGRAM];
        let mut data_buf = vec![0u8; MAX_DATAGRAM];
        let mut packets = 0u64;
        let mut errors = 0u32;

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("datagram receiver cancelled");
                    break;
                }
                result = self.control.recv(&mut control_buf) => {
                    result.map(|len| self.dispatch_control(&control_buf[..len]))
                }
                result = self.data.recv(&mut data_buf) => {
                    result.map(|len| {
                        packets += 1;
                        self.dispatch_data(&data_buf[..len]);
                    })
                }
            };

            match result {
                Ok(()) => errors = 0,
                Err(e) => {
                    errors += 1;
                    warn!("socket receive failed ({}/{}): {}", errors, MAX_CONSECUTIVE_ERRORS, e);
                    if errors >= MAX_CONSECUTIVE_ERRORS {
                        error!("too many receive errors, stopping receiver");
                        self.machine.fail(format!("datagram receiver stopped: {e}"));
                        break;
                    }
                    let backoff = Duration::from_millis(50 * (1 << errors.min(5)));
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!(packets, "datagram receiver ended");
    }

    fn dispatch_control(&self, datagram: &[u8]) {
        let reply = match ControlReply::decode(datagram) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("dropping control datagram: {}", e);
                return;
            }
        };
        match self.replies.try_send(reply) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(reply)) => {
                warn!(sequence = reply.sequence, "reply queue full, dropping reply");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("reply queue closed");
            }
        }
    }

    fn dispatch_data(&self, datagram: &[u8]) {
        let packet = match DataPacket::parse(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("dropping data datagram: {}", e);
                return;
            }
        };
        let now = now();
        let Some(outcome) = self.transfer.with_assembler(|assembler| assembler.ingest(&packet, now))
        else {
            return;
        };

        // Any packet of the current frame means integration is over
        if !matches!(outcome, IngestOutcome::Ignored(_)) {
            self.machine.mark_readout();
        }

        match outcome {
            IngestOutcome::Complete => self.transfer.finish(TransferSignal::Complete),
            IngestOutcome::Drained => self.transfer.finish(TransferSignal::Drained),
            IngestOutcome::GapDetected(request) => {
                if self.transfer.admit(request, now) {
                    send_resend(&self.channel, request);
                }
            }
            IngestOutcome::EarlyTrailer => {
                if let RetransmitDecision::Request(request) = self.transfer.next_resend(now) {
                    send_resend(&self.channel, request);
                }
            }
            IngestOutcome::Ignored(reason) => {
                trace!(frame_id = packet.frame_id, index = packet.index, ?reason, "packet ignored");
            }
            IngestOutcome::Accepted | IngestOutcome::Duplicate => {}
        }
    }
}
