use crate::mods::settings::SettingsError;
use thiserror::Error;

pub type KmcResult<T> = Result<T, KmcError>;

#[derive(Debug, Error)]
pub enum KmcError {
    /// User supplied value out of range, caller may correct and retry.
    #[error("invalid value for '{key}': {reason}")]
    InvalidInput { key: String, reason: String },

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("unknown {kind} id {id}")]
    UnknownId { kind: &'static str, id: usize },

    #[error("cannot deactivate unique jump {unique}: stack {stack} would have no active jump")]
    Deactivation { unique: usize, stack: usize },

    #[error("unique jump {unique} needs a code table of {size} entries, mark coordinates additive or ignored")]
    CodeTableTooLarge { unique: usize, size: usize },

    #[error("structure inconsistency: {0}")]
    Structure(String),

    #[error("no backjump for jump {jump} of stack {stack}")]
    MissingBackjump { stack: usize, jump: usize },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("checkpoint format error at line {line}: {reason}")]
    Checkpoint { line: usize, reason: String },

    #[error("checkpoint does not match the compiled network: {0}")]
    CheckpointMismatch(String),

    #[error("illegal engine transition from {from} to {to}")]
    IllegalTransition { from: &'static str, to: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KmcError {
    pub fn invalid<K: Into<String>, R: Into<String>>(key: K, reason: R) -> Self {
        Self::InvalidInput {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn checkpoint<R: Into<String>>(line: usize, reason: R) -> Self {
        Self::Checkpoint {
            line,
            reason: reason.into(),
        }
    }

    /// Non-critical errors leave every component in its pre-call state.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            Self::InvalidInput { .. }
                | Self::Settings(_)
                | Self::UnknownId { .. }
                | Self::Deactivation { .. }
                | Self::CodeTableTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_recoverability() {
        assert!(!KmcError::invalid("T", "must be > 0").is_critical());
        assert!(!KmcError::Deactivation { unique: 0, stack: 1 }.is_critical());
        assert!(KmcError::Structure("empty shell".into()).is_critical());
        assert!(KmcError::checkpoint(3, "bad tag").is_critical());
        assert!(KmcError::CheckpointMismatch("size".into()).is_critical());
    }

    #[test]
    fn display_names_the_offender() {
        let e = KmcError::MissingBackjump { stack: 2, jump: 5 };
        assert_eq!(e.to_string(), "no backjump for jump 5 of stack 2");
    }
}
