//! Address to secure context map with throttled persistence.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::context::{RollingChannel, SecureContext, TeachInOutcome, TeachInPolicy};
use super::rlc::{ReplayWindow, SecurityLevelFormat};
use crate::core::{
    Address, CryptoError, DEFAULT_RLC_SAVE_DISTANCE, PRIVATE_KEY_SIZE, SecurityStore, StoreError,
};
use crate::transport::Packet;

/// Persisted form of one direction of a secure link.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Security level format byte.
    pub slf: u8,
    /// Counter value expected (or used) next.
    pub rlc: u32,
    /// Private key.
    pub key: [u8; PRIVATE_KEY_SIZE],
}

impl fmt::Debug for ChannelRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRecord")
            .field("slf", &self.slf)
            .field("rlc", &self.rlc)
            .finish_non_exhaustive()
    }
}

impl ChannelRecord {
    fn from_channel(channel: &RollingChannel) -> Self {
        Self {
            slf: channel.slf().as_byte(),
            rlc: channel.rlc(),
            key: *channel.keys().key(),
        }
    }

    fn to_channel(&self) -> Result<RollingChannel, CryptoError> {
        Ok(RollingChannel::new(
            SecurityLevelFormat::parse(self.slf)?,
            self.key,
            self.rlc,
        ))
    }
}

/// Persisted secure context of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureRecord {
    /// Device address.
    pub address: Address,
    /// Teach-in info byte.
    pub teach_in_info: u8,
    /// Device to gateway channel.
    pub inbound: ChannelRecord,
    /// Gateway to device channel, for bidirectional devices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<ChannelRecord>,
}

impl SecureRecord {
    /// Snapshot an established context.
    pub fn from_context(context: &SecureContext) -> Option<Self> {
        let inbound = context.inbound()?;
        Some(Self {
            address: context.address(),
            teach_in_info: context.teach_in_info().0,
            inbound: ChannelRecord::from_channel(inbound),
            outbound: context.outbound().map(ChannelRecord::from_channel),
        })
    }

    /// Rebuild the context.
    pub fn to_context(&self) -> Result<SecureContext, CryptoError> {
        let outbound = self
            .outbound
            .as_ref()
            .map(ChannelRecord::to_channel)
            .transpose()?;
        Ok(SecureContext::restore(
            self.address,
            self.teach_in_info,
            self.inbound.to_channel()?,
            outbound,
        ))
    }
}

/// Owner of all secure contexts.
///
/// Lives on the single task that processes telegrams, so no locking is
/// needed around the map.
pub struct SecurityRegistry {
    contexts: HashMap<Address, SecureContext>,
    store: Box<dyn SecurityStore>,
    window: ReplayWindow,
    save_distance: u32,
}

impl fmt::Debug for SecurityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityRegistry")
            .field("contexts", &self.contexts.len())
            .field("window", &self.window)
            .field("save_distance", &self.save_distance)
            .finish()
    }
}

impl SecurityRegistry {
    /// Create an empty registry.
    ///
    /// The save distance is capped below the window's look-ahead so a
    /// restored counter always lies within reach of the device's next one.
    pub fn new(store: Box<dyn SecurityStore>, window: ReplayWindow, save_distance: u32) -> Self {
        let limit = window.lookahead() - 1;
        if save_distance > limit {
            warn!(save_distance, limit, "save distance capped to the RLC look-ahead");
        }
        Self {
            contexts: HashMap::new(),
            store,
            window,
            save_distance: save_distance.min(limit),
        }
    }

    /// Counter advance between two saves of a context.
    pub fn save_distance(&self) -> u32 {
        self.save_distance
    }

    /// Registry with default window and save distance.
    pub fn with_store(store: Box<dyn SecurityStore>) -> Self {
        Self::new(store, ReplayWindow::default(), DEFAULT_RLC_SAVE_DISTANCE)
    }

    /// Restore all persisted contexts. Returns how many were loaded.
    ///
    /// Records with an unsupported format are skipped.
    pub fn load(&mut self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut loaded = 0;
        for record in self.store.load_all()? {
            match record.to_context() {
                Ok(mut context) => {
                    context.mark_saved(now);
                    self.contexts.insert(record.address, context);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(address = %record.address, error = %e, "skipping stored secure context");
                }
            }
        }
        info!(loaded, "secure contexts restored");
        Ok(loaded)
    }

    /// Replay window in use.
    pub fn window(&self) -> ReplayWindow {
        self.window
    }

    /// Context for an address.
    pub fn get(&self, address: Address) -> Option<&SecureContext> {
        self.contexts.get(&address)
    }

    /// Whether an established context exists for an address.
    pub fn is_established(&self, address: Address) -> bool {
        self.contexts
            .get(&address)
            .is_some_and(SecureContext::is_established)
    }

    /// Number of contexts, established or pending.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether the registry holds no contexts.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Feed a SEC_TI telegram for its sender.
    ///
    /// New contexts are only created while learn-in is allowed. A complete
    /// teach-in is persisted immediately.
    pub fn teach_in(
        &mut self,
        packet: &Packet,
        policy: TeachInPolicy,
    ) -> Result<TeachInOutcome, CryptoError> {
        let address = packet.sender();
        if !policy.learn_in_allowed && !self.contexts.contains_key(&address) {
            return Err(CryptoError::LearnInNotAllowed);
        }
        let context = self
            .contexts
            .entry(address)
            .or_insert_with(|| SecureContext::new(address));
        let result = context.teach_in(packet, policy);

        if !context.is_established() && !context.is_pending() {
            self.contexts.remove(&address);
        } else if matches!(result, Ok(TeachInOutcome::Complete { .. })) {
            self.persist_logged(address, true);
        }
        result
    }

    /// Authenticate and decrypt a secure telegram from its sender.
    pub fn unpack(&mut self, packet: &Packet) -> Result<Packet, CryptoError> {
        let address = packet.sender();
        let context = self
            .contexts
            .get_mut(&address)
            .ok_or(CryptoError::NotEstablished)?;
        let plain = context.unpack(packet, &self.window)?;
        self.persist_logged(address, false);
        Ok(plain)
    }

    /// Secure an outgoing telegram for `address`.
    pub fn pack(&mut self, address: Address, plain: &Packet) -> Result<Packet, CryptoError> {
        let context = self
            .contexts
            .get_mut(&address)
            .ok_or(CryptoError::NotEstablished)?;
        let secure = context.pack(plain)?;
        self.persist_logged(address, false);
        Ok(secure)
    }

    /// Save a context if forced or if its counters advanced far enough.
    ///
    /// Returns whether a save happened.
    pub fn persist(&mut self, address: Address, force: bool) -> Result<bool, StoreError> {
        let Some(context) = self.contexts.get_mut(&address) else {
            return Ok(false);
        };
        let due = match context.unsaved_advance() {
            None => true,
            Some(advance) => force || advance >= self.save_distance,
        };
        if !due {
            return Ok(false);
        }
        let Some(record) = SecureRecord::from_context(context) else {
            return Ok(false);
        };
        self.store.save(&record)?;
        context.mark_saved(Instant::now());
        debug!(address = %address, rlc = record.inbound.rlc, "secure context saved");
        Ok(true)
    }

    fn persist_logged(&mut self, address: Address, force: bool) {
        if let Err(e) = self.persist(address, force) {
            warn!(address = %address, error = %e, "failed to persist secure context");
        }
    }

    /// Save every context with unsaved counter progress (shutdown).
    pub fn flush(&mut self) -> Result<usize, StoreError> {
        let dirty: Vec<Address> = self
            .contexts
            .iter()
            .filter(|(_, c)| c.is_established() && c.unsaved_advance() != Some(0))
            .map(|(a, _)| *a)
            .collect();
        let mut saved = 0;
        for address in dirty {
            if self.persist(address, true)? {
                saved += 1;
            }
        }
        Ok(saved)
    }

    /// Drop the context of an address and its stored record.
    pub fn forget(&mut self, address: Address) -> Result<bool, StoreError> {
        let existed = self.contexts.remove(&address).is_some();
        if existed {
            self.store.remove(address)?;
            info!(address = %address, "secure context forgotten");
        }
        Ok(existed)
    }
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    records: HashMap<Address, SecureRecord>,
    saves: usize,
}

/// In-memory [`SecurityStore`]. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemorySecurityStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

impl MemorySecurityStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stored record for an address.
    pub fn get(&self, address: Address) -> Option<SecureRecord> {
        self.lock().records.get(&address).cloned()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether no records are stored.
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Total number of save calls.
    pub fn save_count(&self) -> usize {
        self.lock().saves
    }
}

impl SecurityStore for MemorySecurityStore {
    fn save(&mut self, record: &SecureRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.records.insert(record.address, record.clone());
        inner.saves += 1;
        Ok(())
    }

    fn remove(&mut self, address: Address) -> Result<(), StoreError> {
        self.lock().records.remove(&address);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<SecureRecord>, StoreError> {
        Ok(self.lock().records.values().cloned().collect())
    }
}

/// [`SecurityStore`] writing one TOML file per address into a directory.
#[derive(Debug, Clone)]
pub struct FileSecurityStore {
    dir: PathBuf,
}

impl FileSecurityStore {
    /// Use (and create if needed) `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, address: Address) -> PathBuf {
        self.dir.join(format!("{address}.toml"))
    }
}

impl SecurityStore for FileSecurityStore {
    fn save(&mut self, record: &SecureRecord) -> Result<(), StoreError> {
        let text = toml::to_string(record).map_err(|e| StoreError::Format(e.to_string()))?;
        let path = self.path(record.address);
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&mut self, address: Address) -> Result<(), StoreError> {
        match fs::remove_file(self.path(address)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn load_all(&self) -> Result<Vec<SecureRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let text = fs::read_to_string(&path)?;
            let record: SecureRecord =
                toml::from_str(&text).map_err(|e| StoreError::Format(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }
}
