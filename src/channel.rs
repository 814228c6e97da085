//! Register channel: request/reply over the unreliable control path.
//!
//! Every command carries a 16-bit sequence id and the channel waits for the
//! reply that mirrors it. Only one request is in flight at a time; concurrent
//! callers queue on the channel lock so ids and replies stay paired.
//!
//! Replies are not read from the socket here. The datagram receiver decodes
//! them and forwards them through an mpsc queue, so one task owns the socket
//! read side.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ChannelSection;
use crate::protocol::{ControlCommand, ControlReply, DiscoveryReply, DISCOVERY_REPLY_MIN_LEN};
use crate::transport::DatagramLink;
use crate::{CameraError, Result};

/// Sequence ids for outbound control messages.
///
/// Never yields 0, which is reserved for "no pending request".
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    last: u16,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the next live id. Wraps from 0xFFFF to 1.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u16 {
        self.last = match self.last.wrapping_add(1) {
            0 => 1,
            id => id,
        };
        self.last
    }

    /// Last id handed out, 0 before the first
    pub fn last(&self) -> u16 {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = 0;
    }
}

struct ChannelState {
    counter: SequenceCounter,
    replies: mpsc::Receiver<ControlReply>,
}

/// Serialized register read/write client
pub struct RegisterChannel {
    link: Arc<dyn DatagramLink>,
    state: Mutex<ChannelState>,
    timeout: Duration,
    attempts: u32,
}

impl RegisterChannel {
    /// Build a channel sending on `link` and matching replies from `replies`.
    pub fn new(
        link: Arc<dyn DatagramLink>,
        replies: mpsc::Receiver<ControlReply>,
        settings: &ChannelSection,
    ) -> Self {
        Self {
            link,
            state: Mutex::new(ChannelState { counter: SequenceCounter::new(), replies }),
            timeout: settings.timeout(),
            attempts: settings.attempts.max(1),
        }
    }

    /// Read a 32-bit register.
    pub async fn read(&self, address: u32) -> Result<u32> {
        let reply = self.transact(ControlCommand::Read { address }, "read", self.attempts).await?;
        reply.read_value().map_err(|e| {
            warn!(address = %format!("{address:#06x}"), "malformed read reply: {}", e);
            e
        })
    }

    /// Write a 32-bit register and require the device's acknowledgment.
    pub async fn write(&self, address: u32, value: u32) -> Result<()> {
        let command = ControlCommand::Write { address, value };
        let reply = self.transact(command, "write", self.attempts).await?;
        if !reply.write_acknowledged() {
            return Err(CameraError::protocol(
                "write reply",
                format!("register {address:#06x} not acknowledged: {:02X?}", reply.datagram),
            ));
        }
        Ok(())
    }

    /// Write then read back, returning what the device actually holds.
    pub async fn write_verified(&self, address: u32, value: u32) -> Result<u32> {
        self.write(address, value).await?;
        self.read(address).await
    }

    /// Discovery handshake. Resets the sequence counter first.
    pub async fn discover(&self, attempts: u32) -> Result<DiscoveryReply> {
        self.state.lock().await.counter.reset();
        for attempt in 1..=attempts.max(1) {
            match self.transact(ControlCommand::Discovery, "discovery", 1).await {
                Ok(reply) if reply.len() >= DISCOVERY_REPLY_MIN_LEN => {
                    return DiscoveryReply::parse(&reply);
                }
                Ok(reply) => {
                    warn!(attempt, len = reply.len(), "discovery reply too short");
                }
                Err(CameraError::ChannelUnresponsive { .. }) => {
                    debug!(attempt, "no discovery reply");
                }
                Err(e) => return Err(e),
            }
        }
        Err(CameraError::connection_failed("failed to communicate with camera"))
    }

    /// Ask the device to resend packets `first..=last` of `frame_id`.
    ///
    /// Fire-and-forget: resent data arrives as ordinary payload packets.
    pub async fn request_resend(&self, frame_id: u16, first: u32, last: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let sequence = state.counter.next();
        let frame = ControlCommand::Resend { frame_id, first, last }.encode(sequence);
        debug!(frame_id, first, last, sequence, "requesting resend");
        self.link.send(&frame).await?;
        Ok(())
    }

    async fn transact(
        &self,
        command: ControlCommand,
        operation: &str,
        attempts: u32,
    ) -> Result<ControlReply> {
        let mut state = self.state.lock().await;

        // Late replies to an earlier, abandoned request
        while let Ok(stale) = state.replies.try_recv() {
            trace!(sequence = stale.sequence, "dropping stale reply");
        }

        for attempt in 1..=attempts {
            let sequence = state.counter.next();
            let frame = command.encode(sequence);
            trace!(operation, sequence, attempt, "sending control command");
            self.link.send(&frame).await?;

            let deadline = Instant::now() + self.timeout;
            loop {
                match tokio::time::timeout_at(deadline, state.replies.recv()).await {
                    Ok(Some(reply)) if reply.sequence == sequence => return Ok(reply),
                    Ok(Some(reply)) => {
                        debug!(expected = sequence, got = reply.sequence, "discarding mismatched reply");
                    }
                    Ok(None) => {
                        return Err(CameraError::connection_failed("control reply queue closed"));
                    }
                    Err(_) => {
                        debug!(
                            operation,
                            address = %format!("{:#06x}", command.address()),
                            attempt,
                            "control reply timed out"
                        );
                        break;
                    }
                }
            }
        }

        warn!(
            operation,
            address = %format!("{:#06x}", command.address()),
            attempts,
            "camera unresponsive"
        );
        Err(CameraError::ChannelUnresponsive {
            operation: operation.to_string(),
            address: command.address(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryLink;

    fn channel_with_device() -> (Arc<RegisterChannel>, MemoryLink, mpsc::Sender<ControlReply>) {
        let (host, device) = MemoryLink::pair();
        let (reply_tx, reply_rx) = mpsc::channel(16);
        let settings = ChannelSection { timeout_ms: 500, attempts: 3 };
        (Arc::new(RegisterChannel::new(Arc::new(host), reply_rx, &settings)), device, reply_tx)
    }

    async fn next_command(device: &MemoryLink) -> (u16, ControlCommand) {
        let mut buf = [0u8; 64];
        let len = device.recv(&mut buf).await.unwrap();
        ControlCommand::decode(&buf[..len]).unwrap()
    }

    #[test]
    fn sequence_wraps_past_zero() {
        let mut counter = SequenceCounter { last: 0xFFFE };
        assert_eq!(counter.next(), 0xFFFF);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        counter.reset();
        assert_eq!(counter.last(), 0);
        assert_eq!(counter.next(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_returns_matching_reply() {
        let (channel, device, replies) = channel_with_device();
        let reader = tokio::spawn({
            let channel = channel.clone();
            async move { channel.read(0xA004).await }
        });

        let (sequence, command) = next_command(&device).await;
        assert_eq!(command, ControlCommand::Read { address: 0xA004 });
        replies.send(ControlReply::decode(&ControlReply::encode_read(sequence, 4096)).unwrap()).await.unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), 4096);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_reply_does_not_consume_an_attempt() {
        let (channel, device, replies) = channel_with_device();
        let reader = tokio::spawn({
            let channel = channel.clone();
            async move { channel.read(0x0D04).await }
        });

        let (sequence, _) = next_command(&device).await;
        let wrong = sequence.wrapping_add(100);
        replies.send(ControlReply::decode(&ControlReply::encode_read(wrong, 1)).unwrap()).await.unwrap();
        replies.send(ControlReply::decode(&ControlReply::encode_read(sequence, 1500)).unwrap()).await.unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), 1500);
        // no retransmission of the command happened
        let mut buf = [0u8; 64];
        assert!(
            tokio::time::timeout(Duration::from_millis(10), device.recv(&mut buf)).await.is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_is_unresponsive_after_budget() {
        let (channel, device, _replies) = channel_with_device();
        let started = Instant::now();
        let err = channel.write(0x0938, 12_000).await.unwrap_err();

        match err {
            CameraError::ChannelUnresponsive { operation, address, attempts } => {
                assert_eq!(operation, "write");
                assert_eq!(address, 0x0938);
                assert_eq!(attempts, 3);
            }
            other => panic!("Expected ChannelUnresponsive, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(1500));

        // three commands with fresh sequence ids
        let ids: Vec<u16> = [
            next_command(&device).await.0,
            next_command(&device).await.0,
            next_command(&device).await.0,
        ]
        .into();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_lost_reply() {
        let (channel, device, replies) = channel_with_device();
        let writer = tokio::spawn({
            let channel = channel.clone();
            async move { channel.write(0x20000, 1).await }
        });

        let _lost = next_command(&device).await;
        let (sequence, _) = next_command(&device).await;
        replies.send(ControlReply::decode(&ControlReply::encode_write_ack(sequence, true)).unwrap()).await.unwrap();
        writer.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_write_is_a_protocol_error() {
        let (channel, device, replies) = channel_with_device();
        let writer = tokio::spawn({
            let channel = channel.clone();
            async move { channel.write(0x20008, 5).await }
        });
        let (sequence, _) = next_command(&device).await;
        replies.send(ControlReply::decode(&ControlReply::encode_write_ack(sequence, false)).unwrap()).await.unwrap();
        assert!(matches!(writer.await.unwrap(), Err(CameraError::Protocol { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_are_serialized() {
        let (channel, device, replies) = channel_with_device();
        let a = tokio::spawn({
            let channel = channel.clone();
            async move { channel.read(0xA004).await }
        });
        let b = tokio::spawn({
            let channel = channel.clone();
            async move { channel.read(0xA008).await }
        });

        for _ in 0..2 {
            let (sequence, command) = next_command(&device).await;
            // only one command is outstanding at a time
            let mut buf = [0u8; 64];
            assert!(
                tokio::time::timeout(Duration::from_millis(50), device.recv(&mut buf)).await.is_err()
            );
            let value = if command.address() == 0xA004 { 2048 } else { 1024 };
            replies.send(ControlReply::decode(&ControlReply::encode_read(sequence, value)).unwrap()).await.unwrap();
        }

        assert_eq!(a.await.unwrap().unwrap(), 2048);
        assert_eq!(b.await.unwrap().unwrap(), 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_retries_then_fails() {
        let (channel, device, _replies) = channel_with_device();
        let err = channel.discover(3).await.unwrap_err();
        assert!(matches!(err, CameraError::Connection { .. }));
        for expected in 1..=3u16 {
            assert_eq!(next_command(&device).await, (expected, ControlCommand::Discovery));
        }
    }
}
