use crate::U256;

const FACTOR_DENOMINATOR: u64 = 1_000;

/// Rejected escalation factor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Fee escalation factor must be finite and greater than 1, got {0}")]
pub struct InvalidEscalationFactor(pub f64);

/// Computes replacement fees for stuck transactions.
///
/// The factor is held as a fixed point ratio with three decimals so the
/// arithmetic stays in `U256`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEscalator {
    numerator: U256,
    denominator: U256,
}

impl FeeEscalator {
    /// An escalator multiplying by `factor`.
    pub fn new(factor: f64) -> Result<Self, InvalidEscalationFactor> {
        if !factor.is_finite() || factor <= 1.0 {
            return Err(InvalidEscalationFactor(factor));
        }
        let scaled = (factor * FACTOR_DENOMINATOR as f64).round() as u64;
        Ok(Self {
            numerator: U256::from(scaled.max(FACTOR_DENOMINATOR + 1)),
            denominator: U256::from(FACTOR_DENOMINATOR),
        })
    }

    /// The fee a replacement of a transaction paying `old_fee` must pay
    /// when the network currently asks for `network_fee`.
    ///
    /// Below the network level the network level wins, otherwise the old fee
    /// is scaled by the factor. The result is always strictly above
    /// `old_fee` unless `old_fee` is already `U256::MAX`.
    pub fn escalate(&self, old_fee: U256, network_fee: U256) -> U256 {
        let escalated = if old_fee < network_fee {
            network_fee
        } else {
            let (quotient, _) = old_fee.saturating_mul(self.numerator).div_mod(self.denominator);
            quotient
        };
        if escalated > old_fee {
            escalated
        } else {
            old_fee.saturating_add(U256::one())
        }
    }
}

impl Default for FeeEscalator {
    fn default() -> Self {
        Self {
            numerator: U256::from(1_100u64),
            denominator: U256::from(FACTOR_DENOMINATOR),
        }
    }
}
