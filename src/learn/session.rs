//! Learn session state.

/// Which learn actions a session permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LearnMode {
    /// Only pair new devices.
    LearnInOnly,
    /// Only unpair known devices.
    LearnOutOnly,
    /// Pair unknown devices, unpair known ones.
    #[default]
    Both,
}

/// Process-wide learn state.
///
/// Clears itself after exactly one successful learn-in or learn-out, so a
/// held button or a repeating telegram cannot toggle pairing back and forth.
#[derive(Debug, Clone, Default)]
pub struct LearnSession {
    enabled: bool,
    proximity_check_disabled: bool,
    mode: LearnMode,
}

impl LearnSession {
    /// Idle session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable learning.
    pub fn start(&mut self, mode: LearnMode, proximity_check_disabled: bool) {
        self.enabled = true;
        self.mode = mode;
        self.proximity_check_disabled = proximity_check_disabled;
    }

    /// Disable learning.
    pub fn stop(&mut self) {
        self.enabled = false;
        self.proximity_check_disabled = false;
        self.mode = LearnMode::Both;
    }

    /// A learn action succeeded; return to idle.
    pub fn complete(&mut self) {
        self.stop();
    }

    /// Whether learning is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current mode. Meaningless while idle.
    pub fn mode(&self) -> LearnMode {
        self.mode
    }

    /// Whether weak implicit teach-in signals are accepted.
    pub fn proximity_check_disabled(&self) -> bool {
        self.proximity_check_disabled
    }

    /// Whether a new device may be paired now.
    pub fn allows_learn_in(&self) -> bool {
        self.enabled && self.mode != LearnMode::LearnOutOnly
    }

    /// Whether a known device may be unpaired now.
    pub fn allows_learn_out(&self) -> bool {
        self.enabled && self.mode != LearnMode::LearnInOnly
    }
}
