use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of an environment. `TornDown` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvState {
    #[default]
    Uninitialized,
    Ready,
    TornDown,
}

impl fmt::Display for EnvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::TornDown => "torn_down",
        };
        f.write_str(s)
    }
}

pub fn validate_transition(from: EnvState, to: EnvState) -> Result<(), RuntimeError> {
    let valid = matches!(
        (from, to),
        (EnvState::Uninitialized, EnvState::Ready)
            | (EnvState::Uninitialized | EnvState::Ready, EnvState::TornDown)
    );

    if valid {
        Ok(())
    } else {
        Err(RuntimeError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Shared state gate used by every backend's `setup()`.
///
/// `Ok(false)` means the environment is already ready and setup has nothing
/// to do. Setup after teardown is refused.
pub(crate) fn begin_setup(state: EnvState) -> Result<bool, RuntimeError> {
    match state {
        EnvState::Ready => Ok(false),
        EnvState::TornDown => Err(RuntimeError::Setup(
            "environment was already torn down".to_owned(),
        )),
        EnvState::Uninitialized => {
            validate_transition(state, EnvState::Ready)?;
            Ok(true)
        }
    }
}

pub(crate) fn require_ready(state: EnvState, what: &str) -> Result<(), RuntimeError> {
    if state == EnvState::Ready {
        Ok(())
    } else {
        Err(RuntimeError::Execution(format!(
            "cannot {what}: environment is {state}"
        )))
    }
}

pub(crate) fn require_ready_for_transfer(state: EnvState) -> Result<(), RuntimeError> {
    if state == EnvState::Ready {
        Ok(())
    } else {
        Err(RuntimeError::Transfer(format!("environment is {state}")))
    }
}
