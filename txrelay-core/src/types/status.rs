use std::fmt;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::{InvalidStatus, InvalidTransition};

/// One independent bit of a queued transaction's status.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusFlag {
    /// Admitted and waiting for dispatch
    Queued,
    /// Picked by a dispatch pass, submission in progress
    Reserved,
    /// Accepted by the node at least once
    Sent,
    /// Submitted and awaiting confirmation
    InNetwork,
    /// The last submission attempt failed locally or was rejected
    LocalError,
    /// Confirmed on chain with a successful receipt
    Final,
    /// Will never confirm as-is: failed receipt, or superseded by a replacement
    Obsolete,
}

impl StatusFlag {
    const fn bit(self) -> u16 {
        match self {
            StatusFlag::Queued => 1,
            StatusFlag::Reserved => 1 << 1,
            StatusFlag::Sent => 1 << 2,
            StatusFlag::InNetwork => 1 << 3,
            StatusFlag::LocalError => 1 << 4,
            StatusFlag::Final => 1 << 5,
            StatusFlag::Obsolete => 1 << 6,
        }
    }
}

/// A set of [`StatusFlag`]s. Used both as the payload of [`TxStatus`] and as
/// an include/exclude mask when listing the queue.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "Vec<StatusFlag>", from = "Vec<StatusFlag>")]
pub struct StatusSet(u16);

impl StatusSet {
    /// No flags
    pub const EMPTY: StatusSet = StatusSet(0);
    /// The two mutually exclusive outcome flags
    pub const TERMINAL: StatusSet = StatusSet::of(&[StatusFlag::Final, StatusFlag::Obsolete]);

    /// Build a set from a list of flags.
    pub const fn of(flags: &[StatusFlag]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < flags.len() {
            bits |= flags[i].bit();
            i += 1;
        }
        StatusSet(bits)
    }

    /// Whether `flag` is in the set
    pub const fn contains(&self, flag: StatusFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// Whether every flag of `other` is in the set
    pub const fn contains_all(&self, other: StatusSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether at least one flag of `other` is in the set
    pub const fn intersects(&self, other: StatusSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether the set is empty
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate over the flags in declaration order.
    pub fn flags(&self) -> impl Iterator<Item = StatusFlag> + '_ {
        StatusFlag::iter().filter(|flag| self.contains(*flag))
    }

    const fn with(self, flags: StatusSet) -> Self {
        StatusSet(self.0 | flags.0)
    }

    const fn without(self, flags: StatusSet) -> Self {
        StatusSet(self.0 & !flags.0)
    }
}

impl From<Vec<StatusFlag>> for StatusSet {
    fn from(flags: Vec<StatusFlag>) -> Self {
        StatusSet::of(&flags)
    }
}

impl From<StatusSet> for Vec<StatusFlag> {
    fn from(set: StatusSet) -> Self {
        set.flags().collect()
    }
}

impl From<StatusFlag> for StatusSet {
    fn from(flag: StatusFlag) -> Self {
        StatusSet(flag.bit())
    }
}

impl fmt::Debug for StatusSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "EMPTY");
        }
        let names: Vec<String> = self.flags().map(|flag| flag.to_string()).collect();
        write!(f, "{}", names.join("|"))
    }
}

/// A requested change to a transaction's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    /// A dispatch pass takes the entry
    Reserve,
    /// The node accepted the submission
    Submitted,
    /// Submission failed
    LocalError,
    /// A failed entry is made eligible for dispatch again
    Requeue,
    /// Confirmed on chain. `success` is the receipt outcome.
    Finalize {
        /// receipt outcome
        success: bool,
    },
    /// A replacement with a higher fee takes over this nonce
    Supersede,
}

/// Status of a queued transaction.
///
/// The only way to change it is [`TxStatus::apply`], which rejects transitions
/// that are illegal from the current flags. Once [`StatusFlag::Final`] or
/// [`StatusFlag::Obsolete`] is set, no transition is accepted.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "StatusSet", try_from = "StatusSet")]
pub struct TxStatus(StatusSet);

impl TxStatus {
    /// Status of a freshly admitted transaction
    pub const fn queued() -> Self {
        TxStatus(StatusSet::of(&[StatusFlag::Queued]))
    }

    /// The raw flag set
    pub const fn flags(&self) -> StatusSet {
        self.0
    }

    /// Whether `flag` is set
    pub const fn has(&self, flag: StatusFlag) -> bool {
        self.0.contains(flag)
    }

    /// FINAL or OBSOLETE
    pub const fn is_terminal(&self) -> bool {
        self.0.intersects(StatusSet::TERMINAL)
    }

    /// Submitted and not yet resolved
    pub const fn is_in_flight(&self) -> bool {
        self.has(StatusFlag::InNetwork) && !self.is_terminal()
    }

    /// Compute the status after `transition`, or explain why it is illegal.
    pub fn apply(&self, transition: Transition) -> Result<TxStatus, InvalidTransition> {
        use StatusFlag::*;

        let flags = self.0;
        let invalid = || InvalidTransition {
            from: flags,
            transition,
        };
        if self.is_terminal() {
            return Err(invalid());
        }

        let next = match transition {
            Transition::Reserve => {
                if !flags.contains(Queued) || flags.contains(Reserved) {
                    return Err(invalid());
                }
                flags.with(Reserved.into())
            }
            Transition::Submitted => {
                if !flags.contains(Reserved) {
                    return Err(invalid());
                }
                flags
                    .without(StatusSet::of(&[Queued, Reserved, LocalError]))
                    .with(StatusSet::of(&[Sent, InNetwork]))
            }
            Transition::LocalError => {
                if !flags.intersects(StatusSet::of(&[Queued, Reserved])) {
                    return Err(invalid());
                }
                flags
                    .without(StatusSet::of(&[Queued, Reserved]))
                    .with(LocalError.into())
            }
            Transition::Requeue => {
                if !flags.contains(LocalError) {
                    return Err(invalid());
                }
                flags.without(LocalError.into()).with(Queued.into())
            }
            Transition::Finalize { success: true } => flags
                .without(StatusSet::of(&[Queued, Reserved]))
                .with(Final.into()),
            Transition::Finalize { success: false } | Transition::Supersede => flags
                .without(StatusSet::of(&[Queued, Reserved]))
                .with(Obsolete.into()),
        };
        Ok(TxStatus(next))
    }
}

impl From<TxStatus> for StatusSet {
    fn from(status: TxStatus) -> Self {
        status.0
    }
}

impl TryFrom<StatusSet> for TxStatus {
    type Error = InvalidStatus;

    fn try_from(flags: StatusSet) -> Result<Self, Self::Error> {
        if flags.contains_all(StatusSet::TERMINAL) {
            return Err(InvalidStatus(flags));
        }
        Ok(TxStatus(flags))
    }
}

impl Default for TxStatus {
    fn default() -> Self {
        Self::queued()
    }
}

impl fmt::Debug for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxStatus({:?})", self.0)
    }
}
