//! Link supervision task.
//!
//! One task owns the byte stream, the framer and the command slot. It writes
//! queued commands one at a time, routes RESPONSE packets to the slot and
//! forwards everything else as [`LinkEvent`]s. A periodic version probe
//! detects a hung module; repeated misses hard-reset and reopen the
//! transport.

use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until};
use tracing::{debug, info, trace, warn};

use super::channel::{
    CommandChannel, CommandSlot, LinkRequest, Liveness, LivenessVerdict, SlotOutcome, Waiter,
};
use super::commands::{Outgoing, version_command};
use super::packet::{Framer, Packet, PacketType};
use crate::core::CommandError;
use crate::gateway::LinkConfig;

const READ_CHUNK: usize = 256;

/// Byte transport towards the radio module (serial line, TCP bridge, ...).
pub trait Transport: Send + 'static {
    /// Open byte stream.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open (or reopen) the stream.
    fn open(&mut self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Hard-reset the module, e.g. by toggling its reset line.
    fn hard_reset(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Something the link reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A complete non-RESPONSE packet.
    Packet(Arc<Packet>),
    /// The transport is being hard-reset.
    Reset {
        /// Consecutive attempt, starting at 1.
        attempt: u32,
    },
    /// The transport was reopened after a reset.
    Reopened,
    /// Reset attempts are exhausted; the link has stopped.
    Failed,
}

/// Spawn the link task for `transport`.
///
/// The task stops when every [`CommandChannel`] clone and the event
/// receiver are dropped, or after [`LinkEvent::Failed`].
pub fn spawn_link<T: Transport>(
    transport: T,
    config: LinkConfig,
) -> (CommandChannel, mpsc::Receiver<LinkEvent>, JoinHandle<()>) {
    let depth = config.queue_depth.max(1);
    let (request_tx, requests) = mpsc::channel(depth);
    let (urgent_tx, urgent) = mpsc::channel(depth);
    let (events, event_rx) = mpsc::channel(depth);
    let channel = CommandChannel::new(request_tx, urgent_tx, config.command_timeout());
    let link = Link {
        liveness: Liveness::new(config.liveness_retries, config.max_resets),
        transport,
        requests,
        urgent,
        events,
        slot: CommandSlot::new(),
        framer: Framer::new(),
        dropped_events: 0,
        config,
    };
    let handle = tokio::spawn(link.run());
    (channel, event_rx, handle)
}

enum SessionEnd {
    Shutdown,
    Escalate(LivenessVerdict),
}

enum Wake {
    Read(io::Result<usize>),
    Request(Option<LinkRequest>),
    Urgent(Option<Outgoing>),
    Deadline,
    Probe,
}

struct Link<T: Transport> {
    transport: T,
    requests: mpsc::Receiver<LinkRequest>,
    urgent: mpsc::Receiver<Outgoing>,
    events: mpsc::Sender<LinkEvent>,
    slot: CommandSlot,
    liveness: Liveness,
    framer: Framer,
    dropped_events: u64,
    config: LinkConfig,
}

impl<T: Transport> Link<T> {
    async fn run(mut self) {
        let mut reopened = false;
        loop {
            let verdict = match self.transport.open().await {
                Ok(stream) => {
                    if reopened {
                        info!("transport reopened");
                        if self.events.try_send(LinkEvent::Reopened).is_err() {
                            debug!("reopen event not delivered");
                        }
                    }
                    match self.session(stream, reopened).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Escalate(verdict) => verdict,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to open transport");
                    self.liveness.begin_reset()
                }
            };

            self.framer.reset();
            match verdict {
                LivenessVerdict::Healthy => {}
                LivenessVerdict::Reset { attempt } => {
                    self.slot.cancel(CommandError::Io("transport reset".into()));
                    self.hard_reset(attempt).await;
                }
                LivenessVerdict::Exhausted => {
                    self.fail().await;
                    break;
                }
            }
            reopened = true;
        }
        debug!(stats = ?self.framer.stats(), dropped_events = self.dropped_events, "link stopped");
    }

    async fn hard_reset(&mut self, attempt: u32) {
        warn!(attempt, "hard-resetting transport");
        match self.events.try_send(LinkEvent::Reset { attempt }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped_events += 1;
                warn!(
                    attempt,
                    dropped = self.dropped_events,
                    "event queue full, reset not reported"
                );
            }
            Err(TrySendError::Closed(_)) => debug!("reset event not delivered"),
        }
        if let Err(e) = self.transport.hard_reset().await {
            warn!(error = %e, "hard reset failed");
        }
        sleep(self.config.reset_settle()).await;
    }

    async fn fail(&mut self) {
        warn!(
            resets = self.liveness.resets(),
            "transport reset attempts exhausted, stopping link"
        );
        self.slot.cancel(CommandError::ResetExhausted);
        self.requests.close();
        self.urgent.close();
        while let Ok(request) = self.requests.try_recv() {
            if let LinkRequest::Command { reply, .. } = request {
                let _ = reply.send(Err(CommandError::ResetExhausted));
            }
        }
        if self.events.send(LinkEvent::Failed).await.is_err() {
            debug!("failure event not delivered");
        }
    }

    async fn session(&mut self, stream: T::Stream, probe_now: bool) -> SessionEnd {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = [0u8; READ_CHUNK];
        let period = self.config.liveness_interval();
        let mut probe = interval_at(Instant::now() + period, period);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probe_due = probe_now;

        loop {
            if probe_due && self.slot.is_free() {
                probe_due = false;
                trace!("sending liveness probe");
                if let Err(e) = write_packet(&mut writer, &version_command()).await {
                    warn!(error = %e, "probe write failed");
                    return SessionEnd::Escalate(self.liveness.begin_reset());
                }
                self.slot
                    .occupy(Waiter::Probe, Instant::now() + self.config.command_timeout());
            }

            let deadline = self.slot.deadline();
            let wake = tokio::select! {
                r = reader.read(&mut buf) => Wake::Read(r),
                o = self.urgent.recv() => Wake::Urgent(o),
                r = self.requests.recv(), if self.slot.is_free() => Wake::Request(r),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    Wake::Deadline
                }
                _ = probe.tick() => Wake::Probe,
            };

            match wake {
                Wake::Read(Ok(0)) => {
                    warn!("transport closed by peer");
                    return SessionEnd::Escalate(self.liveness.begin_reset());
                }
                Wake::Read(Err(e)) => {
                    warn!(error = %e, "transport read failed");
                    return SessionEnd::Escalate(self.liveness.begin_reset());
                }
                Wake::Read(Ok(n)) => {
                    for packet in self.framer.feed(&buf[..n]) {
                        if !self.receive(packet) {
                            return SessionEnd::Shutdown;
                        }
                    }
                }
                Wake::Request(None) | Wake::Urgent(None) => {
                    debug!("all command handles dropped");
                    return SessionEnd::Shutdown;
                }
                Wake::Request(Some(request)) => {
                    if let Err(e) = self.send(&mut writer, request).await {
                        warn!(error = %e, "transport write failed");
                        return SessionEnd::Escalate(self.liveness.begin_reset());
                    }
                }
                Wake::Urgent(Some(outgoing)) => {
                    if let Err(e) = self.post(&mut writer, outgoing).await {
                        warn!(error = %e, "transport write failed");
                        return SessionEnd::Escalate(self.liveness.begin_reset());
                    }
                }
                Wake::Deadline => {
                    if let SlotOutcome::Probe { answered: false } = self.slot.expire(Instant::now())
                    {
                        match self.liveness.record_miss() {
                            LivenessVerdict::Healthy => {
                                warn!(misses = self.liveness.misses(), "liveness probe missed");
                            }
                            verdict => return SessionEnd::Escalate(verdict),
                        }
                    }
                }
                Wake::Probe => probe_due = true,
            }
        }
    }

    /// Route a received packet. Returns false once nobody listens.
    fn receive(&mut self, packet: Packet) -> bool {
        if packet.packet_type() == Some(PacketType::Response) {
            match self.slot.complete(packet) {
                SlotOutcome::Empty => debug!("unsolicited response dropped"),
                SlotOutcome::Probe { .. } => {
                    trace!("liveness probe answered");
                    self.liveness.record_success();
                }
                SlotOutcome::Caller | SlotOutcome::Detached => {}
            }
            return true;
        }
        match self.events.try_send(LinkEvent::Packet(Arc::new(packet))) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped_events += 1;
                warn!(dropped = self.dropped_events, "event queue full, packet dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    async fn send<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        request: LinkRequest,
    ) -> io::Result<()> {
        match request {
            LinkRequest::Command {
                packet,
                timeout,
                reply,
            } => {
                if reply.is_closed() {
                    return Ok(());
                }
                let bytes = match packet.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = reply.send(Err(CommandError::Io(e.to_string())));
                        return Ok(());
                    }
                };
                if let Err(e) = write_bytes(writer, &bytes).await {
                    let _ = reply.send(Err(CommandError::Io(e.to_string())));
                    return Err(e);
                }
                self.slot.occupy(Waiter::Caller(reply), Instant::now() + timeout);
            }
            LinkRequest::Post(outgoing) => self.post(writer, outgoing).await?,
        }
        Ok(())
    }

    /// Write a packet nobody waits on. Its RESPONSE, if any, is still
    /// accounted for in the slot.
    async fn post<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        outgoing: Outgoing,
    ) -> io::Result<()> {
        if outgoing.is_expired(Instant::now()) {
            debug!(
                packet_type = ?outgoing.packet.packet_type(),
                "send deadline passed, dropping packet"
            );
            return Ok(());
        }
        let bytes = match outgoing.packet.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "dropping unserializable packet");
                return Ok(());
            }
        };
        write_bytes(writer, &bytes).await?;
        // Responses we send are not answered by the module.
        if outgoing.packet.packet_type() != Some(PacketType::Response) {
            self.slot
                .expect_response(Instant::now() + self.config.command_timeout());
        }
        Ok(())
    }
}

async fn write_bytes<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> io::Result<()> {
    let bytes = packet
        .to_bytes()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    write_bytes(writer, &bytes).await
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::io::DuplexStream;

    use super::*;
    use crate::core::ResponseCode;
    use crate::radio::Rorg;
    use crate::transport::commands::{Outgoing, id_base_command};

    /// Transport handing out pre-made duplex streams.
    pub(crate) struct MockTransport {
        streams: VecDeque<DuplexStream>,
        pub(crate) resets: Arc<AtomicU32>,
    }

    impl MockTransport {
        /// Returns the transport and the module side of each stream.
        pub(crate) fn new(sessions: usize) -> (Self, Vec<DuplexStream>) {
            let mut streams = VecDeque::new();
            let mut modules = Vec::new();
            for _ in 0..sessions {
                let (host, module) = tokio::io::duplex(1024);
                streams.push_back(host);
                modules.push(module);
            }
            let transport = Self {
                streams,
                resets: Arc::new(AtomicU32::new(0)),
            };
            (transport, modules)
        }
    }

    impl Transport for MockTransport {
        type Stream = DuplexStream;

        async fn open(&mut self) -> io::Result<DuplexStream> {
            self.streams
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
        }

        async fn hard_reset(&mut self) -> io::Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn response_bytes(data: &[u8]) -> Vec<u8> {
        let mut p = Packet::with_type(PacketType::Response, data.len(), 0);
        p.data_mut().copy_from_slice(data);
        p.finalize(false);
        p.to_bytes().unwrap()
    }

    /// Read one complete packet from the module side.
    pub(crate) async fn read_packet(module: &mut DuplexStream) -> Packet {
        let mut framer = Framer::new();
        let mut byte = [0u8; 1];
        loop {
            module.read_exact(&mut byte).await.unwrap();
            if let Some(p) = framer.feed(&byte).pop() {
                return p;
            }
        }
    }

    fn config() -> LinkConfig {
        LinkConfig {
            command_timeout_ms: 100,
            liveness_interval_ms: 60_000,
            reset_settle_ms: 10,
            ..LinkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_request_response() {
        let (transport, mut modules) = MockTransport::new(1);
        let (channel, _events, _task) = spawn_link(transport, config());
        let mut module = modules.remove(0);

        let caller = tokio::spawn(async move { channel.read_id_base().await });
        let request = read_packet(&mut module).await;
        assert_eq!(request.data(), id_base_command().data());
        module
            .write_all(&response_bytes(&[0x00, 0xFF, 0x80, 0x00, 0x00]))
            .await
            .unwrap();

        let id = caller.await.unwrap().unwrap();
        assert_eq!(id.base.0, 0xFF80_0000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout() {
        let (transport, modules) = MockTransport::new(1);
        let (channel, _events, _task) = spawn_link(transport, config());
        assert_eq!(
            channel.request(version_command()).await,
            Err(CommandError::Timeout)
        );
        drop(modules);
    }

    #[tokio::test]
    async fn test_negative_response() {
        let (transport, mut modules) = MockTransport::new(1);
        let (channel, _events, _task) = spawn_link(transport, config());
        let mut module = modules.remove(0);

        let caller = tokio::spawn(async move { channel.reset().await });
        read_packet(&mut module).await;
        module.write_all(&response_bytes(&[0x02])).await.unwrap();
        assert_eq!(
            caller.await.unwrap(),
            Err(CommandError::Rejected(ResponseCode::NotSupported))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_command_in_flight() {
        let (transport, mut modules) = MockTransport::new(1);
        let (channel, _events, _task) = spawn_link(transport, config());
        let mut module = modules.remove(0);

        let first = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request(version_command()).await })
        };
        let first_packet = read_packet(&mut module).await;
        assert_eq!(first_packet.data(), version_command().data());

        let second = tokio::spawn(async move { channel.request(id_base_command()).await });

        let mut byte = [0u8; 1];
        let early = tokio::time::timeout(Duration::from_millis(50), module.read(&mut byte)).await;
        assert!(early.is_err(), "second command written before first completed");

        module.write_all(&response_bytes(&[0x00])).await.unwrap();
        assert!(first.await.unwrap().is_ok());

        let second_packet = read_packet(&mut module).await;
        assert_eq!(second_packet.data(), id_base_command().data());
        module.write_all(&response_bytes(&[0x00])).await.unwrap();
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_radio_packets_forwarded() {
        let (transport, mut modules) = MockTransport::new(1);
        let (_channel, mut events, _task) = spawn_link(transport, config());
        let mut module = modules.remove(0);

        let mut telegram = Packet::radio(Rorg::Rps, 1);
        telegram.finalize(false);
        // Leading garbage is skipped by the framer.
        module.write_all(&[0x00, 0x13]).await.unwrap();
        module.write_all(&telegram.to_bytes().unwrap()).await.unwrap();

        match events.recv().await {
            Some(LinkEvent::Packet(p)) => assert_eq!(p.rorg(), Rorg::Rps),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_post_dropped() {
        let (transport, mut modules) = MockTransport::new(1);
        let (channel, _events, _task) = spawn_link(transport, config());
        let mut module = modules.remove(0);

        let stale = Outgoing::with_deadline(
            version_command(),
            Instant::now() - Duration::from_millis(1),
        );
        channel.post(stale).await.unwrap();
        channel.post(Outgoing::new(id_base_command())).await.unwrap();

        let written = read_packet(&mut module).await;
        assert_eq!(written.data(), id_base_command().data());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_post_skips_busy_slot() {
        let (transport, mut modules) = MockTransport::new(1);
        let cfg = LinkConfig {
            liveness_interval_ms: 1_000,
            ..config()
        };
        let (channel, _events, _task) = spawn_link(transport, cfg);
        let mut module = modules.remove(0);

        let liveness = read_packet(&mut module).await;
        assert_eq!(liveness.data(), version_command().data());

        // Answer to a module request while the liveness check is pending.
        let mut answer = Packet::with_type(PacketType::Response, 1, 0);
        answer.finalize(false);
        channel.post(Outgoing::new(answer)).await.unwrap();
        let written = read_packet(&mut module).await;
        assert_eq!(written.packet_type(), Some(PacketType::Response));

        module.write_all(&response_bytes(&[0x00])).await.unwrap();
        let caller = tokio::spawn(async move { channel.read_id_base().await });
        assert_eq!(read_packet(&mut module).await.data(), id_base_command().data());
        module
            .write_all(&response_bytes(&[0x00, 0xFF, 0x80, 0x00, 0x00]))
            .await
            .unwrap();
        assert_eq!(caller.await.unwrap().unwrap().base.0, 0xFF80_0000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_post_skips_busy_slot() {
        let (transport, mut modules) = MockTransport::new(1);
        let (channel, _events, _task) = spawn_link(transport, config());
        let mut module = modules.remove(0);

        let first = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request(version_command()).await })
        };
        assert_eq!(read_packet(&mut module).await.data(), version_command().data());

        let mut telegram = Packet::radio(Rorg::Rps, 1);
        telegram.finalize(false);
        let deadline = Instant::now() + Duration::from_millis(10);
        channel
            .post(Outgoing::with_deadline(telegram, deadline))
            .await
            .unwrap();
        let written = read_packet(&mut module).await;
        assert_eq!(written.packet_type(), Some(PacketType::RadioErp1));
        assert!(!first.is_finished());

        // Responses arrive in write order: the command, then the telegram.
        module.write_all(&response_bytes(&[0x00])).await.unwrap();
        assert!(first.await.unwrap().is_ok());
        module.write_all(&response_bytes(&[0x00])).await.unwrap();

        let second = tokio::spawn(async move { channel.read_id_base().await });
        assert_eq!(read_packet(&mut module).await.data(), id_base_command().data());
        module
            .write_all(&response_bytes(&[0x00, 0xFF, 0x80, 0x00, 0x00]))
            .await
            .unwrap();
        assert_eq!(second.await.unwrap().unwrap().base.0, 0xFF80_0000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_with_full_event_queue() {
        let (transport, mut modules) = MockTransport::new(2);
        let resets = transport.resets.clone();
        let cfg = LinkConfig {
            liveness_interval_ms: 1_000,
            liveness_retries: 1,
            max_resets: 1,
            queue_depth: 1,
            ..config()
        };
        let (_channel, mut events, task) = spawn_link(transport, cfg);

        let mut telegram = Packet::radio(Rorg::Rps, 1);
        telegram.finalize(false);
        modules[0].write_all(&telegram.to_bytes().unwrap()).await.unwrap();
        sleep(Duration::from_secs(5)).await;

        // Reset and reopen found the queue full and were skipped.
        assert!(matches!(events.recv().await, Some(LinkEvent::Packet(_))));
        assert_eq!(events.recv().await, Some(LinkEvent::Failed));
        task.await.unwrap();
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_escalates_to_reset_and_failure() {
        let (transport, modules) = MockTransport::new(2);
        let resets = transport.resets.clone();
        let cfg = LinkConfig {
            liveness_interval_ms: 1_000,
            liveness_retries: 1,
            max_resets: 1,
            ..config()
        };
        let (channel, mut events, task) = spawn_link(transport, cfg);

        assert_eq!(events.recv().await, Some(LinkEvent::Reset { attempt: 1 }));
        assert_eq!(events.recv().await, Some(LinkEvent::Reopened));
        assert_eq!(events.recv().await, Some(LinkEvent::Failed));
        task.await.unwrap();

        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(
            channel.request(version_command()).await,
            Err(CommandError::ChannelClosed)
        );
        drop(modules);
    }
}
