use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockSide {
    Upper,
    Under,
}

impl std::fmt::Display for LockSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upper => write!(f, "upper"),
            Self::Under => write!(f, "under"),
        }
    }
}

/// Returned when a lock request collides with the opposite lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{held} lock already set at level {level}")]
pub struct LockConflict {
    pub held: LockSide,
    pub level: usize,
}

/// Mutually exclusive upper/under clamps on the selectable level range.
///
/// Locks are lazy: they constrain the next controller evaluation rather than
/// forcing an immediate transition, so a lock request can never race an
/// in-flight level application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrequencyLockManager {
    upper: Option<usize>,
    under: Option<usize>,
}

impl FrequencyLockManager {
    pub fn set_upper(&mut self, level: usize) -> Result<(), LockConflict> {
        if let Some(under) = self.under {
            return Err(LockConflict {
                held: LockSide::Under,
                level: under,
            });
        }
        self.upper = Some(level);
        Ok(())
    }

    pub fn clear_upper(&mut self) {
        self.upper = None;
    }

    pub fn set_under(&mut self, level: usize) -> Result<(), LockConflict> {
        if let Some(upper) = self.upper {
            return Err(LockConflict {
                held: LockSide::Upper,
                level: upper,
            });
        }
        self.under = Some(level);
        Ok(())
    }

    pub fn clear_under(&mut self) {
        self.under = None;
    }

    pub fn upper(&self) -> Option<usize> {
        self.upper
    }

    pub fn under(&self) -> Option<usize> {
        self.under
    }

    /// Clamps a candidate step into `[under ∨ 0, upper ∨ max_step]`.
    pub fn clamp(&self, step: usize, max_step: usize) -> usize {
        step.min(self.upper.unwrap_or(max_step))
            .max(self.under.unwrap_or(0))
    }
}
