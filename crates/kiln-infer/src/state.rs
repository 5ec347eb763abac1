//! Chain elements.

use nalgebra::DVector;

/// Outcome of the swap attempt recorded on a state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapType {
    NoAttempt = 0,
    Accept = 1,
    Reject = 2,
}

impl SwapType {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SwapType::NoAttempt),
            1 => Some(SwapType::Accept),
            2 => Some(SwapType::Reject),
            _ => None,
        }
    }
}

/// One element of a chain. Immutable once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    /// Sampled parameter vector.
    pub sample: DVector<f64>,
    /// Negative log likelihood of the sample.
    pub energy: f64,
    /// Proposal scale the chain used at this step.
    pub sigma: f64,
    /// Inverse temperature of the chain at this step.
    pub beta: f64,
    /// Whether the proposal behind this state was accepted.
    pub accepted: bool,
    /// Swap outcome recorded on the colder chain of the attempted pair.
    pub swap_type: SwapType,
}
