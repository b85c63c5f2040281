//! Gateway runtime: the link task plus one task owning the controller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use super::config::{GatewayConfig, SecurityConfig};
use crate::core::{Address, CommandError, DeviceRegistry, GatewayError, SecurityStore};
use crate::crypto::{FileSecurityStore, MemorySecurityStore, SecurityRegistry};
use crate::learn::{ControllerAction, LearnController, LearnEvent, LearnMode};
use crate::transport::{CommandChannel, LinkEvent, Outgoing, Packet, Transport, spawn_link};

/// Something the host should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// A learn action finished.
    Learn(LearnEvent),
    /// Learning ended because its time ran out.
    LearnTimeout,
    /// The transport is being hard-reset.
    LinkReset {
        /// Consecutive attempt.
        attempt: u32,
    },
    /// The transport is back after a reset.
    LinkRestored,
    /// The transport is gone for good.
    LinkFailed,
}

/// Snapshot of the gateway state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStatus {
    /// Learning is enabled.
    pub learning: bool,
    /// The module's ID base, if it could be read.
    pub id_base: Option<Address>,
    /// Secure contexts held.
    pub secure_contexts: usize,
}

type Ack<T> = oneshot::Sender<Result<T, GatewayError>>;

#[derive(Debug)]
enum GatewayCommand {
    StartLearning {
        mode: LearnMode,
        proximity_check_disabled: bool,
        timeout: Duration,
        ack: Ack<()>,
    },
    StopLearning {
        ack: Ack<()>,
    },
    Send {
        address: Address,
        telegram: Packet,
        ack: Ack<()>,
    },
    Status {
        ack: Ack<GatewayStatus>,
    },
    Shutdown,
}

/// Cloneable handle to a running gateway.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    commands: mpsc::Sender<GatewayCommand>,
    link: CommandChannel,
}

impl GatewayHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(Ack<T>) -> GatewayCommand,
    ) -> Result<T, GatewayError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(command(ack))
            .await
            .map_err(|_| CommandError::ChannelClosed)?;
        rx.await.map_err(|_| CommandError::ChannelClosed)?
    }

    /// Enable learning for at most `timeout`.
    pub async fn start_learning(
        &self,
        mode: LearnMode,
        proximity_check_disabled: bool,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        self.call(|ack| GatewayCommand::StartLearning {
            mode,
            proximity_check_disabled,
            timeout,
            ack,
        })
        .await
    }

    /// Disable learning.
    pub async fn stop_learning(&self) -> Result<(), GatewayError> {
        self.call(|ack| GatewayCommand::StopLearning { ack }).await
    }

    /// Send a radio telegram to `address`, secured when the device is.
    pub async fn send(&self, address: Address, telegram: Packet) -> Result<(), GatewayError> {
        self.call(|ack| GatewayCommand::Send {
            address,
            telegram,
            ack,
        })
        .await
    }

    /// Current state.
    pub async fn status(&self) -> Result<GatewayStatus, GatewayError> {
        self.call(|ack| GatewayCommand::Status { ack }).await
    }

    /// Raw command channel to the module.
    pub fn link(&self) -> &CommandChannel {
        &self.link
    }
}

/// Secure context store for the configuration: files when a directory is
/// configured, memory otherwise.
pub fn open_store(config: &SecurityConfig) -> Result<Box<dyn SecurityStore>, GatewayError> {
    let store: Box<dyn SecurityStore> = match &config.store_dir {
        Some(dir) => Box::new(FileSecurityStore::open(dir)?),
        None => Box::new(MemorySecurityStore::new()),
    };
    Ok(store)
}

/// A running gateway.
///
/// # Example
///
/// ```ignore
/// let config = GatewayConfig::load("/etc/esp3/gateway.toml")?;
/// let store = open_store(&config.security)?;
/// let (gateway, mut events) = Gateway::start(config, serial, my_registry, store).await?;
///
/// gateway.handle().start_learning(LearnMode::Both, false, Duration::from_secs(60)).await?;
/// while let Some(event) = events.recv().await {
///     if let GatewayEvent::Learn(learned) = event {
///         println!("{learned:?}");
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Gateway<R> {
    handle: GatewayHandle,
    task: JoinHandle<R>,
    link_task: JoinHandle<()>,
}

impl<R: DeviceRegistry + 'static> Gateway<R> {
    /// Restore secure contexts, start the link and read the module's ID base.
    ///
    /// An unreadable ID base is logged; the own-address filter then stays off.
    pub async fn start<T: Transport>(
        config: GatewayConfig,
        transport: T,
        registry: R,
        store: Box<dyn SecurityStore>,
    ) -> Result<(Self, mpsc::Receiver<GatewayEvent>), GatewayError> {
        config.validate()?;
        let mut security = SecurityRegistry::new(
            store,
            config.security.window(),
            config.security.rlc_save_distance,
        );
        security.load()?;

        let (link, link_events, link_task) = spawn_link(transport, config.link.clone());
        let mut controller = LearnController::new(registry, security, config.learn.clone());
        match link.read_id_base().await {
            Ok(id) => {
                info!(
                    id_base = %id.base,
                    remaining_writes = ?id.remaining_writes,
                    "gateway started"
                );
                controller.set_id_base(id.base);
            }
            Err(e) => warn!(error = %e, "could not read ID base, own-address filter disabled"),
        }

        let depth = config.link.queue_depth.max(1);
        let (command_tx, commands) = mpsc::channel(depth);
        let (events, event_rx) = mpsc::channel(depth);
        let runtime = Runtime {
            controller,
            link: link.clone(),
            link_events,
            commands,
            events,
            learn_deadline: None,
            smart_ack_learn: config.link.smart_ack_learn,
        };
        let task = tokio::spawn(runtime.run());
        let handle = GatewayHandle {
            commands: command_tx,
            link,
        };
        Ok((
            Self {
                handle,
                task,
                link_task,
            },
            event_rx,
        ))
    }

    /// A handle for controlling the gateway.
    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    /// Stop both tasks, flush secure contexts and return the device registry.
    pub async fn shutdown(self) -> Result<R, GatewayError> {
        if self
            .handle
            .commands
            .send(GatewayCommand::Shutdown)
            .await
            .is_err()
        {
            debug!("gateway task already stopped");
        }
        let registry = self
            .task
            .await
            .map_err(|e| GatewayError::Task(e.to_string()))?;
        self.link_task.abort();
        Ok(registry)
    }
}

enum Wake {
    Link(Option<LinkEvent>),
    Command(Option<GatewayCommand>),
    LearnTimeout,
}

struct Runtime<R: DeviceRegistry> {
    controller: LearnController<R>,
    link: CommandChannel,
    link_events: mpsc::Receiver<LinkEvent>,
    commands: mpsc::Receiver<GatewayCommand>,
    events: mpsc::Sender<GatewayEvent>,
    learn_deadline: Option<Instant>,
    smart_ack_learn: bool,
}

impl<R: DeviceRegistry + 'static> Runtime<R> {
    async fn run(mut self) -> R {
        loop {
            let deadline = self.learn_deadline;
            let wake = tokio::select! {
                ev = self.link_events.recv() => Wake::Link(ev),
                cmd = self.commands.recv() => Wake::Command(cmd),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    Wake::LearnTimeout
                }
            };

            match wake {
                Wake::Link(Some(LinkEvent::Packet(packet))) => self.on_packet(&packet).await,
                Wake::Link(Some(LinkEvent::Reset { attempt })) => {
                    emit(&self.events, GatewayEvent::LinkReset { attempt }).await;
                }
                Wake::Link(Some(LinkEvent::Reopened)) => {
                    emit(&self.events, GatewayEvent::LinkRestored).await;
                }
                Wake::Link(Some(LinkEvent::Failed)) => {
                    emit(&self.events, GatewayEvent::LinkFailed).await;
                    break;
                }
                Wake::Link(None) => {
                    debug!("link task ended");
                    break;
                }
                Wake::Command(Some(GatewayCommand::Shutdown)) | Wake::Command(None) => break,
                Wake::Command(Some(command)) => self.on_command(command).await,
                Wake::LearnTimeout => {
                    info!("learn mode timed out");
                    self.end_learning();
                    emit(&self.events, GatewayEvent::LearnTimeout).await;
                }
            }
        }

        match self.controller.security_mut().flush() {
            Ok(saved) => debug!(saved, "secure contexts flushed"),
            Err(e) => warn!(error = %e, "failed to flush secure contexts"),
        }
        self.controller.into_registry()
    }

    async fn on_packet(&mut self, packet: &Arc<Packet>) {
        let was_learning = self.controller.is_learning();
        for action in self.controller.handle(packet) {
            match action {
                ControllerAction::Transmit(outgoing) => {
                    if self.link.post(outgoing).await.is_err() {
                        warn!("link closed, confirmation not sent");
                    }
                }
                ControllerAction::Event(event) => {
                    emit(&self.events, GatewayEvent::Learn(event)).await;
                }
            }
        }
        if was_learning && !self.controller.is_learning() {
            self.end_learning();
        }
    }

    async fn on_command(&mut self, command: GatewayCommand) {
        match command {
            GatewayCommand::StartLearning {
                mode,
                proximity_check_disabled,
                timeout,
                ack,
            } => {
                self.controller.start_learning(mode, proximity_check_disabled);
                self.learn_deadline = Some(Instant::now() + timeout);
                self.set_smart_ack_learn(true, timeout);
                let _ = ack.send(Ok(()));
            }
            GatewayCommand::StopLearning { ack } => {
                self.end_learning();
                let _ = ack.send(Ok(()));
            }
            GatewayCommand::Send {
                address,
                telegram,
                ack,
            } => {
                let result = match self.controller.prepare(address, &telegram) {
                    Ok(packet) => self
                        .link
                        .post(Outgoing::new(packet))
                        .await
                        .map_err(GatewayError::from),
                    Err(e) => Err(e.into()),
                };
                let _ = ack.send(result);
            }
            GatewayCommand::Status { ack } => {
                let _ = ack.send(Ok(GatewayStatus {
                    learning: self.controller.is_learning(),
                    id_base: self.controller.id_base(),
                    secure_contexts: self.controller.security().len(),
                }));
            }
            GatewayCommand::Shutdown => {}
        }
    }

    fn end_learning(&mut self) {
        let had_deadline = self.learn_deadline.take().is_some();
        self.controller.stop_learning();
        if had_deadline {
            self.set_smart_ack_learn(false, Duration::ZERO);
        }
    }

    /// Switch the module's smart-ack learn mode in the background.
    fn set_smart_ack_learn(&self, enable: bool, timeout: Duration) {
        if !self.smart_ack_learn {
            return;
        }
        let link = self.link.clone();
        tokio::spawn(async move {
            if let Err(e) = link.set_learn_mode(enable, timeout).await {
                warn!(enable, error = %e, "failed to switch smart-ack learn mode");
            }
        });
    }
}

/// Takes the sender alone so no `&Runtime` is held across the await.
async fn emit(events: &mpsc::Sender<GatewayEvent>, event: GatewayEvent) {
    if events.send(event).await.is_err() {
        debug!("gateway event dropped, no receiver");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::learn::MockRegistry;
    use crate::radio::{Eep, Rorg};
    use crate::transport::link_tests::{MockTransport, read_packet, response_bytes};
    use crate::transport::{PacketType, id_base_command};

    const DEVICE: Address = Address(0xAABB_CCDD);

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.link.command_timeout_ms = 100;
        config.link.liveness_interval_ms = 600_000;
        config
    }

    fn teach_in_bytes() -> Vec<u8> {
        let mut p = Packet::radio(Rorg::FourBs, 4);
        p.set_radio_user_data(&[0x08, 0x08, 0x0B, 0x80]);
        p.set_sender(DEVICE);
        p.finalize(false);
        p.to_bytes().unwrap()
    }

    #[tokio::test]
    async fn test_gateway_learn_in() {
        let (transport, mut modules) = MockTransport::new(1);
        let mut module = modules.remove(0);
        let answer = tokio::spawn(async move {
            let request = read_packet(&mut module).await;
            assert_eq!(request.data(), id_base_command().data());
            module
                .write_all(&response_bytes(&[0x00, 0xFF, 0x80, 0x00, 0x00]))
                .await
                .unwrap();
            module
        });

        let (gateway, mut events) = Gateway::start(
            config(),
            transport,
            MockRegistry::default(),
            Box::new(MemorySecurityStore::new()),
        )
        .await
        .unwrap();
        let mut module = answer.await.unwrap();
        let handle = gateway.handle();

        let status = handle.status().await.unwrap();
        assert_eq!(status.id_base, Some(Address(0xFF80_0000)));
        assert!(!status.learning);

        handle
            .start_learning(LearnMode::Both, false, Duration::from_secs(60))
            .await
            .unwrap();
        module.write_all(&teach_in_bytes()).await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(GatewayEvent::Learn(LearnEvent::LearnedIn {
                address: DEVICE,
                eep: Eep::new(0xA5, 0x02, 0x01),
                manufacturer: 0x00B,
                devices: 1,
                secure: false,
            }))
        );
        assert!(!handle.status().await.unwrap().learning);

        let registry = gateway.shutdown().await.unwrap();
        assert!(registry.devices.contains_key(&DEVICE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_learn_timeout() {
        let (transport, modules) = MockTransport::new(1);
        let (gateway, mut events) = Gateway::start(
            config(),
            transport,
            MockRegistry::default(),
            Box::new(MemorySecurityStore::new()),
        )
        .await
        .unwrap();
        let handle = gateway.handle();
        assert_eq!(handle.status().await.unwrap().id_base, None);

        handle
            .start_learning(LearnMode::LearnInOnly, false, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(events.recv().await, Some(GatewayEvent::LearnTimeout));
        assert!(!handle.status().await.unwrap().learning);

        gateway.shutdown().await.unwrap();
        drop(modules);
    }

    #[tokio::test]
    async fn test_send_plain_telegram() {
        let (transport, mut modules) = MockTransport::new(1);
        let mut module = modules.remove(0);
        let answer = tokio::spawn(async move {
            read_packet(&mut module).await;
            module.write_all(&response_bytes(&[0x02])).await.unwrap();
            module
        });
        let (gateway, _events) = Gateway::start(
            config(),
            transport,
            MockRegistry::default(),
            Box::new(MemorySecurityStore::new()),
        )
        .await
        .unwrap();
        let mut module = answer.await.unwrap();

        let mut telegram = Packet::radio(Rorg::Vld, 2);
        telegram.set_radio_user_data(&[0x01, 0x64]);
        telegram.set_destination(DEVICE);
        telegram.finalize(false);
        gateway.handle().send(DEVICE, telegram.clone()).await.unwrap();

        let written = read_packet(&mut module).await;
        assert_eq!(written.packet_type(), Some(PacketType::RadioErp1));
        assert_eq!(written.radio_user_data(), telegram.radio_user_data());
        gateway.shutdown().await.unwrap();
    }

    #[test]
    fn test_open_store() {
        assert!(open_store(&SecurityConfig::default()).is_ok());
    }
}
