//! Learn & dispatch.
//!
//! [`LearnController`] turns incoming packets into pairing decisions while a
//! [`LearnSession`] is active and fans telegrams out to paired devices
//! otherwise. Confirmations the radio protocol expects during teach-in are
//! returned as [`ControllerAction::Transmit`] ahead of the learn event.

mod confirm;
mod controller;
mod session;

pub use confirm::{
    SmartAckConfirm, SmartAckLearnRequest, UteQuery, UteRequest, UteResult, smart_ack_confirm,
    ute_response,
};
pub use controller::{ControllerAction, LearnController, LearnEvent, LearnFailure};
pub use session::{LearnMode, LearnSession};

#[cfg(test)]
pub(crate) use controller::tests::MockRegistry;
