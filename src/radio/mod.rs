//! Radio telegram layer: RORG classification, field accessors and
//! equipment-profile extraction on top of framed packets.

mod eep;
mod rorg;
mod telegram;

pub use eep::{Eep, Extractor, FieldDescriptor, TeachInInfo, extract_bits, linear_scale};
pub use rorg::Rorg;
