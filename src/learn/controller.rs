//! Learn & dispatch controller.
//!
//! Every incoming packet ends up here. While learning, teach-in telegrams
//! become pairing decisions; otherwise telegrams fan out to the devices
//! registered for their sender. Secure telegrams are authenticated and
//! decrypted on the way in.

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::confirm::{
    SmartAckConfirm, SmartAckLearnRequest, UteQuery, UteResult, smart_ack_confirm, ute_response,
};
use super::session::{LearnMode, LearnSession};
use crate::core::{
    Address, CryptoError, DeviceRegistry, EEP_SECURE_PTM, LearnRefusal, MANUFACTURER_UNKNOWN,
    TeachIn,
};
use crate::crypto::{SecureContext, SecurityRegistry, TeachInOutcome, TeachInPolicy};
use crate::gateway::LearnConfig;
use crate::radio::{Eep, Rorg, TeachInInfo};
use crate::transport::{Instant, Outgoing, Packet, PacketType};

/// Response time announced in smart-ack confirmations.
const SMART_ACK_RESPONSE_TIME_MS: u16 = 0;

/// Why a learn action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnFailure {
    /// The registry has no model for the profile.
    UnknownProfile,
    /// The registry is full.
    CapacityExceeded,
    /// The session mode or the request forbids the action.
    NotPermitted,
    /// The request arrived too weak.
    SignalTooWeak,
}

impl From<LearnRefusal> for LearnFailure {
    fn from(refusal: LearnRefusal) -> Self {
        match refusal {
            LearnRefusal::UnknownProfile => Self::UnknownProfile,
            LearnRefusal::CapacityExceeded => Self::CapacityExceeded,
        }
    }
}

/// Outcome of a learn attempt, reported once per action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearnEvent {
    /// Device(s) paired.
    LearnedIn {
        /// Device address.
        address: Address,
        /// Profile the devices were created for.
        eep: Eep,
        /// Manufacturer code.
        manufacturer: u16,
        /// Devices created.
        devices: usize,
        /// The device talks securely.
        secure: bool,
    },
    /// Device(s) unpaired.
    LearnedOut {
        /// Device address.
        address: Address,
        /// Profile removed.
        eep: Eep,
        /// Devices removed.
        removed: usize,
    },
    /// Nothing changed.
    Failed {
        /// Device address.
        address: Address,
        /// Announced profile.
        eep: Eep,
        /// Reason.
        reason: LearnFailure,
    },
}

/// Work for the caller after processing a packet, in order.
#[derive(Debug, Clone)]
pub enum ControllerAction {
    /// Queue a packet on the command link.
    Transmit(Outgoing),
    /// Report a learn outcome.
    Event(LearnEvent),
}

/// Routes packets into teach-in handling or device dispatch.
#[derive(Debug)]
pub struct LearnController<R: DeviceRegistry> {
    registry: R,
    security: SecurityRegistry,
    session: LearnSession,
    config: LearnConfig,
    id_base: Option<Address>,
    /// Secure contexts established this session that no device uses yet.
    unclaimed: HashSet<Address>,
}

impl<R: DeviceRegistry> LearnController<R> {
    /// Create a controller around the host registry and the secure contexts.
    pub fn new(registry: R, security: SecurityRegistry, config: LearnConfig) -> Self {
        Self {
            registry,
            security,
            session: LearnSession::new(),
            config,
            id_base: None,
            unclaimed: HashSet::new(),
        }
    }

    /// Device registry.
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Mutable device registry.
    pub fn registry_mut(&mut self) -> &mut R {
        &mut self.registry
    }

    /// Secure contexts.
    pub fn security(&self) -> &SecurityRegistry {
        &self.security
    }

    /// Mutable secure contexts.
    pub fn security_mut(&mut self) -> &mut SecurityRegistry {
        &mut self.security
    }

    /// Give the device registry back, e.g. on shutdown.
    pub fn into_registry(self) -> R {
        self.registry
    }

    /// Current learn session.
    pub fn session(&self) -> &LearnSession {
        &self.session
    }

    /// Set the first address of the gateway's own block.
    pub fn set_id_base(&mut self, id_base: Address) {
        self.id_base = Some(id_base);
    }

    /// The gateway's ID base, once known.
    pub fn id_base(&self) -> Option<Address> {
        self.id_base
    }

    /// Enable learning until one action succeeds or [`stop_learning`](Self::stop_learning).
    pub fn start_learning(&mut self, mode: LearnMode, proximity_check_disabled: bool) {
        info!(?mode, proximity_check_disabled, "learning started");
        self.session.start(mode, proximity_check_disabled);
    }

    /// Disable learning.
    ///
    /// Secure contexts established during the session but never followed by
    /// a device teach-in are dropped.
    pub fn stop_learning(&mut self) {
        if self.session.is_enabled() {
            info!("learning stopped");
        }
        self.session.stop();
        self.release_unclaimed();
    }

    fn complete_session(&mut self) {
        self.session.complete();
        self.release_unclaimed();
    }

    fn release_unclaimed(&mut self) {
        for address in mem::take(&mut self.unclaimed) {
            if !self.registry.has_any_devices(address) {
                debug!(address = %address, "no device followed the secure teach-in");
                self.forget_context(address);
            }
        }
    }

    /// Whether learning is enabled.
    pub fn is_learning(&self) -> bool {
        self.session.is_enabled()
    }

    /// Prepare an outgoing telegram for `address`, securing it when the
    /// device has an established context.
    pub fn prepare(&mut self, address: Address, plain: &Packet) -> Result<Packet, CryptoError> {
        if self.security.is_established(address) {
            self.security.pack(address, plain)
        } else {
            Ok(plain.clone())
        }
    }

    /// Process one packet from the link.
    pub fn handle(&mut self, packet: &Arc<Packet>) -> Vec<ControllerAction> {
        let mut actions = Vec::new();
        match packet.packet_type() {
            Some(PacketType::RadioErp1) => self.handle_radio(packet, &mut actions),
            Some(PacketType::Event) => match SmartAckLearnRequest::parse(packet) {
                Some(request) => self.handle_smart_ack(packet, request, &mut actions),
                None => trace!(code = ?packet.data().first(), "ignoring event"),
            },
            other => trace!(packet_type = ?other, "ignoring packet"),
        }
        actions
    }

    fn gateway_address(&self) -> Address {
        self.id_base.unwrap_or(Address(0))
    }

    fn is_own_address(&self, address: Address) -> bool {
        self.id_base.is_some_and(|base| address.is_in_block(base))
    }

    fn response_deadline(&self) -> Instant {
        Instant::now() + self.config.teach_in_response_deadline()
    }

    fn handle_radio(&mut self, packet: &Arc<Packet>, actions: &mut Vec<ControllerAction>) {
        let sender = packet.sender();
        let rorg = packet.rorg();
        if self.session.is_enabled() && self.is_own_address(sender) {
            trace!(address = %sender, "ignoring telegram from own address block");
            return;
        }
        if rorg == Rorg::SecTi {
            self.handle_secure_teach_in(packet, actions);
            return;
        }

        let telegram = if rorg.is_secure() {
            match self.security.unpack(packet) {
                Ok(plain) => Arc::new(plain),
                Err(e) => {
                    debug!(address = %sender, error = %e, "secure telegram rejected");
                    return;
                }
            }
        } else if self.security.is_established(sender) {
            debug!(address = %sender, ?rorg, "discarding non-secure telegram from secured device");
            return;
        } else {
            Arc::clone(packet)
        };

        if self.session.is_enabled() {
            self.learn(&telegram, None, actions);
        } else {
            self.dispatch(&telegram);
        }
    }

    fn handle_secure_teach_in(
        &mut self,
        packet: &Arc<Packet>,
        actions: &mut Vec<ControllerAction>,
    ) {
        let address = packet.sender();
        let deadline = self.response_deadline();
        let policy = TeachInPolicy {
            learn_in_allowed: self.session.allows_learn_in(),
            gateway: self.gateway_address(),
        };
        let (newly_established, response) = match self.security.teach_in(packet, policy) {
            Ok(TeachInOutcome::Incomplete) => {
                trace!(address = %address, "secure teach-in segment stored");
                return;
            }
            Ok(TeachInOutcome::Complete {
                newly_established,
                response,
            }) => (newly_established, response),
            Err(e) => {
                debug!(address = %address, error = %e, "secure teach-in rejected");
                return;
            }
        };

        for segment in response.into_iter().flatten() {
            actions.push(ControllerAction::Transmit(Outgoing::with_deadline(
                segment, deadline,
            )));
        }

        let ptm = self.security.get(address).is_some_and(SecureContext::is_ptm);
        let info = if ptm {
            TeachInInfo {
                eep: Eep::from_u32(EEP_SECURE_PTM),
                manufacturer: MANUFACTURER_UNKNOWN,
            }
        } else {
            TeachInInfo::unknown(Rorg::SecTi.as_byte())
        };

        if !self.session.is_enabled() {
            if self.registry.has_any_devices(address) {
                debug!(
                    address = %address,
                    "secure teach-in outside learn mode, identifying device"
                );
                self.registry.identify(address, &info);
            }
        } else if ptm {
            // Push buttons send nothing else to learn from.
            let learned = self.learn(packet, Some(info), actions);
            if newly_established && !learned && !self.registry.has_any_devices(address) {
                self.forget_context(address);
            }
        } else if newly_established {
            self.unclaimed.insert(address);
        }
    }

    /// Decide and perform learn-in or learn-out. Returns whether an action succeeded.
    fn learn(
        &mut self,
        telegram: &Arc<Packet>,
        announced: Option<TeachInInfo>,
        actions: &mut Vec<ControllerAction>,
    ) -> bool {
        let address = telegram.sender();
        let implicit = announced.is_some() || telegram.rorg().has_implicit_teach_in();
        let info = match announced {
            Some(info) => info,
            None if telegram.has_teach_in_info(None) => telegram.eep_info(),
            None => {
                trace!(address = %address, rorg = ?telegram.rorg(), "no teach-in info");
                return false;
            }
        };

        if implicit && !self.session.proximity_check_disabled() {
            let min = self.config.min_learn_dbm;
            if !telegram.dbm().is_some_and(|dbm| dbm >= min) {
                debug!(
                    address = %address,
                    dbm = ?telegram.dbm(),
                    min,
                    "implicit teach-in too weak"
                );
                return false;
            }
        }

        let ute = UteQuery::parse(telegram);
        let exists = self.registry.has_devices(address, info.eep);
        let learn_in =
            !exists && self.session.allows_learn_in() && ute.is_none_or(|q| q.allows_learn_in());
        let learn_out =
            exists && self.session.allows_learn_out() && ute.is_none_or(|q| q.allows_learn_out());

        if learn_in {
            let security = self.security.get(address).filter(|c| c.is_established());
            let secure = security.is_some();
            let created = self.registry.create_devices(&TeachIn {
                address,
                eep: info.eep,
                manufacturer: info.manufacturer,
                telegram,
                security,
            });
            match created {
                Ok(devices) => {
                    self.confirm_ute(telegram, ute, UteResult::AcceptedIn, actions);
                    info!(address = %address, eep = %info.eep, devices, secure, "learned in");
                    actions.push(ControllerAction::Event(LearnEvent::LearnedIn {
                        address,
                        eep: info.eep,
                        manufacturer: info.manufacturer,
                        devices,
                        secure,
                    }));
                    self.complete_session();
                    true
                }
                Err(refusal) => {
                    let result = match refusal {
                        LearnRefusal::UnknownProfile => UteResult::EepNotSupported,
                        LearnRefusal::CapacityExceeded => UteResult::Refused,
                    };
                    self.confirm_ute(telegram, ute, result, actions);
                    self.report_failure(address, info.eep, refusal.into(), actions);
                    false
                }
            }
        } else if learn_out {
            let removed = self.registry.remove_devices(
                address,
                info.eep,
                self.config.keep_settings_on_learn_out,
            );
            self.confirm_ute(telegram, ute, UteResult::AcceptedOut, actions);
            info!(address = %address, eep = %info.eep, removed, "learned out");
            actions.push(ControllerAction::Event(LearnEvent::LearnedOut {
                address,
                eep: info.eep,
                removed,
            }));
            self.complete_session();
            if !self.registry.has_any_devices(address) {
                self.forget_context(address);
            }
            true
        } else {
            self.confirm_ute(telegram, ute, UteResult::Refused, actions);
            self.report_failure(address, info.eep, LearnFailure::NotPermitted, actions);
            false
        }
    }

    fn report_failure(
        &self,
        address: Address,
        eep: Eep,
        reason: LearnFailure,
        actions: &mut Vec<ControllerAction>,
    ) {
        info!(address = %address, eep = %eep, ?reason, "learn failed");
        actions.push(ControllerAction::Event(LearnEvent::Failed {
            address,
            eep,
            reason,
        }));
    }

    fn confirm_ute(
        &self,
        telegram: &Packet,
        query: Option<UteQuery>,
        result: UteResult,
        actions: &mut Vec<ControllerAction>,
    ) {
        if let Some(query) = query {
            if query.response_expected {
                let response = ute_response(telegram, result, self.gateway_address());
                actions.push(ControllerAction::Transmit(Outgoing::with_deadline(
                    response,
                    self.response_deadline(),
                )));
            }
        }
    }

    fn forget_context(&mut self, address: Address) {
        if let Err(e) = self.security.forget(address) {
            warn!(address = %address, error = %e, "failed to remove secure context record");
        }
    }

    fn dispatch(&mut self, telegram: &Arc<Packet>) {
        let address = telegram.sender();
        if !self.registry.has_any_devices(address) {
            trace!(address = %address, "telegram from unknown device");
            return;
        }
        // Every RPS press carries implicit teach-in bits; only explicit ones identify.
        if telegram.rorg() != Rorg::Rps && telegram.has_teach_in_info(None) {
            debug!(address = %address, "teach-in outside learn mode, identifying device");
            self.registry.identify(address, &telegram.eep_info());
            return;
        }
        self.registry.dispatch(address, telegram);
    }

    fn handle_smart_ack(
        &mut self,
        event: &Arc<Packet>,
        request: SmartAckLearnRequest,
        actions: &mut Vec<ControllerAction>,
    ) {
        let address = request.client;
        let eep = request.eep;
        let deadline = self.response_deadline();
        let confirm = move |code| {
            ControllerAction::Transmit(Outgoing::with_deadline(
                smart_ack_confirm(code, SMART_ACK_RESPONSE_TIME_MS),
                deadline,
            ))
        };

        if !self.session.is_enabled() {
            debug!(address = %address, eep = %eep, "smart-ack learn request while idle");
            actions.push(confirm(SmartAckConfirm::EepNotAccepted));
            return;
        }
        if !self.session.proximity_check_disabled() && request.dbm < self.config.min_learn_dbm {
            actions.push(confirm(SmartAckConfirm::RssiTooLow));
            self.report_failure(address, eep, LearnFailure::SignalTooWeak, actions);
            return;
        }

        let exists = self.registry.has_devices(address, eep);
        if !exists && self.session.allows_learn_in() {
            let created = self.registry.create_devices(&TeachIn {
                address,
                eep,
                manufacturer: request.manufacturer,
                telegram: event,
                security: None,
            });
            match created {
                Ok(devices) => {
                    actions.push(confirm(SmartAckConfirm::LearnIn));
                    info!(address = %address, eep = %eep, devices, "smart-ack learned in");
                    actions.push(ControllerAction::Event(LearnEvent::LearnedIn {
                        address,
                        eep,
                        manufacturer: request.manufacturer,
                        devices,
                        secure: false,
                    }));
                    self.complete_session();
                }
                Err(refusal) => {
                    let code = match refusal {
                        LearnRefusal::UnknownProfile => SmartAckConfirm::EepNotAccepted,
                        LearnRefusal::CapacityExceeded => SmartAckConfirm::ControllerFull,
                    };
                    actions.push(confirm(code));
                    self.report_failure(address, eep, refusal.into(), actions);
                }
            }
        } else if exists && self.session.allows_learn_out() {
            let removed =
                self.registry
                    .remove_devices(address, eep, self.config.keep_settings_on_learn_out);
            actions.push(confirm(SmartAckConfirm::LearnOut));
            info!(address = %address, eep = %eep, removed, "smart-ack learned out");
            actions.push(ControllerAction::Event(LearnEvent::LearnedOut {
                address,
                eep,
                removed,
            }));
            self.complete_session();
        } else {
            actions.push(confirm(SmartAckConfirm::EepNotAccepted));
            self.report_failure(address, eep, LearnFailure::NotPermitted, actions);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::crypto::{
        MemorySecurityStore, RollingChannel, SecureTeachInInfo, SecurityLevelFormat,
        build_teach_in,
    };
    use crate::learn::confirm::tests::{smart_ack_event, ute_query};

    const DEVICE: Address = Address(0xAABB_CCDD);
    const ID_BASE: Address = Address(0xFF80_0000);
    const KEY: [u8; 16] = [
        0x86, 0x9F, 0xAB, 0x7D, 0x29, 0x6C, 0x9E, 0x48, 0xCE, 0xBF, 0xF3, 0x4D, 0xF6, 0x37, 0x35,
        0x8A,
    ];

    /// In-memory device registry recording every call.
    #[derive(Debug, Default)]
    pub(crate) struct MockRegistry {
        pub(crate) devices: HashMap<Address, Vec<Eep>>,
        pub(crate) dispatched: Vec<(Address, Arc<Packet>)>,
        pub(crate) identified: Vec<Address>,
        pub(crate) secure_teach_ins: usize,
        pub(crate) refuse: Option<LearnRefusal>,
    }

    impl DeviceRegistry for MockRegistry {
        fn has_devices(&self, address: Address, eep: Eep) -> bool {
            self.devices.get(&address).is_some_and(|e| e.contains(&eep))
        }

        fn has_any_devices(&self, address: Address) -> bool {
            self.devices.get(&address).is_some_and(|e| !e.is_empty())
        }

        fn create_devices(&mut self, teach_in: &TeachIn<'_>) -> Result<usize, LearnRefusal> {
            if let Some(refusal) = self.refuse {
                return Err(refusal);
            }
            if teach_in.security.is_some() {
                self.secure_teach_ins += 1;
            }
            self.devices
                .entry(teach_in.address)
                .or_default()
                .push(teach_in.eep);
            Ok(1)
        }

        fn remove_devices(&mut self, address: Address, eep: Eep, _keep_settings: bool) -> usize {
            let Some(list) = self.devices.get_mut(&address) else {
                return 0;
            };
            let before = list.len();
            list.retain(|e| *e != eep);
            let removed = before - list.len();
            if list.is_empty() {
                self.devices.remove(&address);
            }
            removed
        }

        fn dispatch(&mut self, address: Address, telegram: &Arc<Packet>) {
            self.dispatched.push((address, Arc::clone(telegram)));
        }

        fn identify(&mut self, address: Address, _info: &TeachInInfo) {
            self.identified.push(address);
        }
    }

    fn controller() -> LearnController<MockRegistry> {
        let security = SecurityRegistry::with_store(Box::new(MemorySecurityStore::new()));
        let mut controller =
            LearnController::new(MockRegistry::default(), security, LearnConfig::default());
        controller.set_id_base(ID_BASE);
        controller
    }

    /// 4BS teach-in with profile A5-02-01 and manufacturer 0x00B.
    fn four_bs_teach_in(sender: Address) -> Arc<Packet> {
        let mut p = Packet::radio(Rorg::FourBs, 4);
        p.set_radio_user_data(&[0x02 << 2, 0x01 << 3, 0x0B, 0x80]);
        p.set_sender(sender);
        p.finalize(false);
        Arc::new(p)
    }

    fn four_bs_data(sender: Address) -> Arc<Packet> {
        let mut p = Packet::radio(Rorg::FourBs, 4);
        p.set_radio_user_data(&[0x00, 0x00, 0x80, 0x08]);
        p.set_sender(sender);
        p.finalize(false);
        Arc::new(p)
    }

    fn with_dbm(packet: &Packet, dbm: u8) -> Packet {
        let mut p = packet.clone();
        p.opt_data_mut()[5] = dbm;
        p.finalize(false);
        p
    }

    fn rps_press(sender: Address, dbm: u8) -> Arc<Packet> {
        let mut p = Packet::radio(Rorg::Rps, 1);
        p.set_radio_user_data(&[0x30]);
        p.set_sender(sender);
        p.set_status(0x30);
        Arc::new(with_dbm(&p, dbm))
    }

    fn secure_teach_in(info: u8, dbm: u8) -> Vec<Arc<Packet>> {
        build_teach_in(
            SecureTeachInInfo(info),
            SecurityLevelFormat::parse(0xF3).unwrap(),
            0x10,
            &KEY,
            DEVICE,
            Address::BROADCAST,
        )
        .iter()
        .map(|p| Arc::new(with_dbm(p, dbm)))
        .collect()
    }

    fn events(actions: &[ControllerAction]) -> Vec<LearnEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                ControllerAction::Event(e) => Some(e.clone()),
                ControllerAction::Transmit(_) => None,
            })
            .collect()
    }

    fn transmitted(actions: &[ControllerAction]) -> Vec<Packet> {
        actions
            .iter()
            .filter_map(|a| match a {
                ControllerAction::Transmit(o) => Some(o.packet.clone()),
                ControllerAction::Event(_) => None,
            })
            .collect()
    }

    fn a5_02_01() -> Eep {
        Eep::new(0xA5, 0x02, 0x01)
    }

    #[test]
    fn test_learn_in_scenario() {
        let mut c = controller();
        c.start_learning(LearnMode::Both, false);

        let actions = c.handle(&four_bs_teach_in(DEVICE));
        assert_eq!(
            events(&actions),
            vec![LearnEvent::LearnedIn {
                address: DEVICE,
                eep: a5_02_01(),
                manufacturer: 0x00B,
                devices: 1,
                secure: false,
            }]
        );
        assert!(c.registry().has_devices(DEVICE, a5_02_01()));
        assert!(!c.is_learning());
    }

    #[test]
    fn test_learn_single_action() {
        let mut c = controller();
        c.start_learning(LearnMode::Both, false);

        let telegram = four_bs_teach_in(DEVICE);
        let mut all = Vec::new();
        for _ in 0..3 {
            all.extend(events(&c.handle(&telegram)));
        }
        assert_eq!(all.len(), 1);
        assert!(matches!(all[0], LearnEvent::LearnedIn { .. }));
        assert!(!c.is_learning());
        assert_eq!(c.registry().devices[&DEVICE].len(), 1);
        assert_eq!(c.registry().identified, vec![DEVICE, DEVICE]);
    }

    #[test]
    fn test_learn_out_scenario() {
        let mut c = controller();
        c.registry_mut().devices.insert(DEVICE, vec![a5_02_01()]);
        c.start_learning(LearnMode::Both, false);

        let actions = c.handle(&four_bs_teach_in(DEVICE));
        assert_eq!(
            events(&actions),
            vec![LearnEvent::LearnedOut {
                address: DEVICE,
                eep: a5_02_01(),
                removed: 1,
            }]
        );
        assert!(!c.registry().has_any_devices(DEVICE));
        assert!(!c.is_learning());
    }

    #[test]
    fn test_learn_in_only_refuses_known_device() {
        let mut c = controller();
        c.registry_mut().devices.insert(DEVICE, vec![a5_02_01()]);
        c.start_learning(LearnMode::LearnInOnly, false);

        let actions = c.handle(&four_bs_teach_in(DEVICE));
        assert_eq!(
            events(&actions),
            vec![LearnEvent::Failed {
                address: DEVICE,
                eep: a5_02_01(),
                reason: LearnFailure::NotPermitted,
            }]
        );
        assert!(c.registry().has_devices(DEVICE, a5_02_01()));
        assert!(c.is_learning());
    }

    #[test]
    fn test_registry_refusal_keeps_learning() {
        let mut c = controller();
        c.registry_mut().refuse = Some(LearnRefusal::CapacityExceeded);
        c.start_learning(LearnMode::Both, false);

        let actions = c.handle(&four_bs_teach_in(DEVICE));
        assert!(matches!(
            events(&actions)[..],
            [LearnEvent::Failed {
                reason: LearnFailure::CapacityExceeded,
                ..
            }]
        ));
        assert!(c.is_learning());
    }

    #[test]
    fn test_own_telegrams_ignored_while_learning() {
        let mut c = controller();
        c.start_learning(LearnMode::Both, false);
        assert!(c.handle(&four_bs_teach_in(Address(0xFF80_0005))).is_empty());
        assert!(c.is_learning());
    }

    #[test]
    fn test_implicit_teach_in_needs_proximity() {
        let mut c = controller();
        c.start_learning(LearnMode::Both, false);
        assert!(c.handle(&rps_press(DEVICE, 80)).is_empty());
        assert!(c.is_learning());

        let actions = c.handle(&rps_press(DEVICE, 40));
        assert!(matches!(events(&actions)[..], [LearnEvent::LearnedIn { .. }]));

        let mut c = controller();
        c.start_learning(LearnMode::Both, true);
        let actions = c.handle(&rps_press(DEVICE, 90));
        assert!(matches!(events(&actions)[..], [LearnEvent::LearnedIn { .. }]));
    }

    #[test]
    fn test_dispatch_when_idle() {
        let mut c = controller();
        c.registry_mut().devices.insert(DEVICE, vec![a5_02_01()]);

        let data = four_bs_data(DEVICE);
        assert!(c.handle(&data).is_empty());
        assert!(c.handle(&four_bs_data(Address(0x1234))).is_empty());

        let dispatched = &c.registry().dispatched;
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].0, DEVICE);
        assert!(Arc::ptr_eq(&dispatched[0].1, &data));
    }

    #[test]
    fn test_ute_confirmation_precedes_event() {
        let mut c = controller();
        c.start_learning(LearnMode::Both, false);
        let eep = Eep::new(0xD2, 0x01, 0x12);

        let actions = c.handle(&Arc::new(ute_query(0x80, eep, DEVICE)));
        assert_eq!(actions.len(), 2);
        let ControllerAction::Transmit(out) = &actions[0] else {
            panic!("confirmation must come first");
        };
        assert!(out.deadline.is_some());
        assert_eq!(out.packet.radio_user_data()[0], 0x91);
        assert_eq!(out.packet.destination(), DEVICE);
        assert_eq!(out.packet.sender(), ID_BASE);
        assert!(matches!(
            actions[1],
            ControllerAction::Event(LearnEvent::LearnedIn { .. })
        ));
    }

    #[cfg(feature = "transport")]
    #[tokio::test(start_paused = true)]
    async fn test_confirmation_deadline_uses_runtime_clock() {
        let mut c = controller();
        c.start_learning(LearnMode::Both, false);
        tokio::time::advance(std::time::Duration::from_secs(3_600)).await;

        let actions = c.handle(&Arc::new(ute_query(0x80, Eep::new(0xD2, 0x01, 0x12), DEVICE)));
        let ControllerAction::Transmit(out) = &actions[0] else {
            panic!("expected a confirmation");
        };
        let expected = Instant::now() + LearnConfig::default().teach_in_response_deadline();
        assert_eq!(out.deadline, Some(expected));
        assert!(!out.is_expired(Instant::now()));
    }

    #[test]
    fn test_ute_unknown_profile() {
        let mut c = controller();
        c.registry_mut().refuse = Some(LearnRefusal::UnknownProfile);
        c.start_learning(LearnMode::Both, false);

        let actions = c.handle(&Arc::new(ute_query(0x00, Eep::new(0xD2, 0x7F, 0x7F), DEVICE)));
        let sent = transmitted(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].radio_user_data()[0], 0x31);
        assert!(matches!(
            events(&actions)[..],
            [LearnEvent::Failed {
                reason: LearnFailure::UnknownProfile,
                ..
            }]
        ));
    }

    #[test]
    fn test_secure_ptm_implicit_teach_in() {
        let mut c = controller();
        c.start_learning(LearnMode::Both, false);

        let ptm_info = SecureTeachInInfo::new(0, 0, true, 0).0;
        let mut actions = Vec::new();
        for p in secure_teach_in(ptm_info, 40) {
            actions.extend(c.handle(&p));
        }
        assert_eq!(
            events(&actions),
            vec![LearnEvent::LearnedIn {
                address: DEVICE,
                eep: Eep::from_u32(EEP_SECURE_PTM),
                manufacturer: MANUFACTURER_UNKNOWN,
                devices: 1,
                secure: true,
            }]
        );
        assert!(transmitted(&actions).is_empty());
        assert!(c.security().is_established(DEVICE));
        assert_eq!(c.registry().secure_teach_ins, 1);
    }

    #[test]
    fn test_weak_secure_ptm_teach_in_leaves_no_context() {
        let mut c = controller();
        c.start_learning(LearnMode::Both, false);
        let ptm_info = SecureTeachInInfo::new(0, 0, true, 0).0;
        for p in secure_teach_in(ptm_info, 90) {
            assert!(events(&c.handle(&p)).is_empty());
        }
        assert!(c.security().get(DEVICE).is_none());
        assert!(c.is_learning());
    }

    #[test]
    fn test_unclaimed_secure_context_dropped_when_learning_ends() {
        let mut c = controller();
        c.start_learning(LearnMode::Both, false);
        for p in secure_teach_in(0x00, 40) {
            c.handle(&p);
        }
        assert!(c.security().is_established(DEVICE));

        // No device teach-in follows before learning is stopped.
        c.stop_learning();
        assert!(c.security().get(DEVICE).is_none());

        // Plain telegrams from the address are no longer discarded.
        c.registry_mut().devices.insert(DEVICE, vec![a5_02_01()]);
        c.handle(&four_bs_data(DEVICE));
        assert_eq!(c.registry().dispatched.len(), 1);
    }

    #[test]
    fn test_claimed_secure_context_kept_when_learning_ends() {
        let mut c = controller();
        paired_secure_device(&mut c);
        c.stop_learning();
        assert!(c.security().is_established(DEVICE));
    }

    #[test]
    fn test_secure_teach_in_refused_when_idle() {
        let mut c = controller();
        for p in secure_teach_in(0x00, 40) {
            assert!(c.handle(&p).is_empty());
        }
        assert!(c.security().is_empty());
    }

    #[test]
    fn test_bidirectional_teach_in_response() {
        let mut c = controller();
        c.start_learning(LearnMode::Both, false);

        let mut actions = Vec::new();
        for p in secure_teach_in(0x01, 40) {
            actions.extend(c.handle(&p));
        }
        let sent = transmitted(&actions);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|p| p.rorg() == Rorg::SecTi));
        assert!(sent.iter().all(|p| p.destination() == DEVICE));
        assert!(events(&actions).is_empty());
        // Non-PTM devices follow up with a teach-in telegram.
        assert!(c.is_learning());
        assert!(c.security().get(DEVICE).is_some_and(|s| s.outbound().is_some()));
    }

    /// Establish a non-PTM secure context and pair a device through an
    /// encapsulated 4BS teach-in. Returns the device side channel.
    fn paired_secure_device(c: &mut LearnController<MockRegistry>) -> RollingChannel {
        c.start_learning(LearnMode::Both, false);
        for p in secure_teach_in(0x00, 40) {
            c.handle(&p);
        }
        let mut device = RollingChannel::new(SecurityLevelFormat::parse(0xF3).unwrap(), KEY, 0x10);
        let sealed = device.seal(&four_bs_teach_in(DEVICE)).unwrap();
        let actions = c.handle(&Arc::new(sealed));
        assert!(matches!(
            events(&actions)[..],
            [LearnEvent::LearnedIn { secure: true, .. }]
        ));
        device
    }

    #[test]
    fn test_secure_downgrade_rejected() {
        let mut c = controller();
        let mut device = paired_secure_device(&mut c);
        let rlc_before = c.security().get(DEVICE).unwrap().inbound().unwrap().rlc();

        assert!(c.handle(&four_bs_data(DEVICE)).is_empty());
        assert!(c.registry().dispatched.is_empty());
        assert_eq!(
            c.security().get(DEVICE).unwrap().inbound().unwrap().rlc(),
            rlc_before
        );

        let sealed = device.seal(&four_bs_data(DEVICE)).unwrap();
        c.handle(&Arc::new(sealed));
        let dispatched = &c.registry().dispatched;
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].1.rorg(), Rorg::FourBs);
        assert_eq!(dispatched[0].1.radio_user_data(), four_bs_data(DEVICE).radio_user_data());
    }

    #[test]
    fn test_secure_downgrade_rejected_while_learning() {
        let mut c = controller();
        paired_secure_device(&mut c);
        c.registry_mut().devices.clear();
        c.start_learning(LearnMode::Both, false);

        assert!(c.handle(&four_bs_teach_in(DEVICE)).is_empty());
        assert!(c.is_learning());
    }

    #[test]
    fn test_learn_out_forgets_secure_context() {
        let mut c = controller();
        let mut device = paired_secure_device(&mut c);
        c.start_learning(LearnMode::Both, false);

        let sealed = device.seal(&four_bs_teach_in(DEVICE)).unwrap();
        let actions = c.handle(&Arc::new(sealed));
        assert!(matches!(events(&actions)[..], [LearnEvent::LearnedOut { .. }]));
        assert!(c.security().get(DEVICE).is_none());
    }

    #[test]
    fn test_prepare_packs_for_secure_devices() {
        let mut c = controller();
        c.start_learning(LearnMode::Both, false);
        for p in secure_teach_in(0x01, 40) {
            c.handle(&p);
        }
        let mut plain = Packet::radio(Rorg::Vld, 2);
        plain.set_radio_user_data(&[0x01, 0x64]);
        plain.set_destination(DEVICE);
        plain.finalize(false);

        assert_eq!(c.prepare(DEVICE, &plain).unwrap().rorg(), Rorg::SecEncaps);
        assert_eq!(c.prepare(Address(0x42), &plain).unwrap(), plain);
    }

    #[test]
    fn test_smart_ack_learn() {
        let mut c = controller();
        let eep = Eep::new(0xA5, 0x02, 0x05);
        let event = Arc::new(smart_ack_event(eep, 40, DEVICE));

        let idle = c.handle(&event);
        assert_eq!(transmitted(&idle)[0].data()[3], SmartAckConfirm::EepNotAccepted as u8);
        assert!(events(&idle).is_empty());

        c.start_learning(LearnMode::Both, false);
        let actions = c.handle(&event);
        assert_eq!(transmitted(&actions)[0].data(), &[0x00, 0x00, 0x00, 0x00]);
        assert!(matches!(events(&actions)[..], [LearnEvent::LearnedIn { .. }]));

        c.start_learning(LearnMode::Both, false);
        let weak = c.handle(&Arc::new(smart_ack_event(eep, 90, DEVICE)));
        assert_eq!(transmitted(&weak)[0].data()[3], SmartAckConfirm::RssiTooLow as u8);

        let actions = c.handle(&event);
        assert_eq!(transmitted(&actions)[0].data()[3], SmartAckConfirm::LearnOut as u8);
        assert!(matches!(events(&actions)[..], [LearnEvent::LearnedOut { .. }]));
    }
}
