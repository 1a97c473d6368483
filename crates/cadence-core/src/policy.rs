//! Collection policies: how a fired handle's values populate its slot.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Policy applied when a completion handle fires.
///
/// Slot positions follow allocation order; `Spread` and `None` are the
/// only policies that renumber later slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Slot takes the first supplied value (Null when none was given).
    #[default]
    First,

    /// Like `First`, but the error channel is ignored entirely: the
    /// handle behaves as a plain event listener that cannot fail.
    Event,

    /// Slot takes all supplied values as one array.
    Collapse,

    /// Supplied values are spliced in place of the slot; later slots
    /// shift right by `count - 1`.
    Spread,

    /// Slot is removed; later slots shift left by one. Errors still
    /// end the run.
    None,

    /// Like `None`, and errors from this handle are swallowed.
    Ignore,

    /// Like `First`, but an unfired slot finalizes to `[]` instead of
    /// Null. Used for the fan-out group's own slot.
    Group,
}

impl Policy {
    /// Does an error supplied to this handle end the run?
    pub fn escalates_errors(self) -> bool {
        !matches!(self, Policy::Event | Policy::Ignore)
    }
}

/// Error for [`Policy::from_str`].
#[derive(Debug, thiserror::Error)]
#[error("unknown policy name: {0}")]
pub struct UnknownPolicy(String);

impl FromStr for Policy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(Policy::First),
            "event" => Ok(Policy::Event),
            "collapse" => Ok(Policy::Collapse),
            "spread" => Ok(Policy::Spread),
            "none" => Ok(Policy::None),
            "ignore" => Ok(Policy::Ignore),
            "group" => Ok(Policy::Group),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}
