use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::channel::{ChannelConfig, State};

#[derive(Clone, Debug, Error)]
pub enum AppLogicError {
    #[error("failed to encode application state: {0}")]
    Encode(String),
    #[error("failed to decode application state: {0}")]
    Decode(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl AppLogicError {
    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        AppLogicError::InvalidTransition(msg.into())
    }
}

/// The pluggable application-logic hook for a channel.
///
/// `encode`/`decode` are required: they translate between the typed application
/// state and the opaque `data` bytes carried in a [`State`]. Everything else has
/// a default:
/// - transitions are accepted unless [`validate_transition`](Self::validate_transition) says otherwise;
/// - no state is ever final unless [`is_final`](Self::is_final) is overridden, so a channel
///   without a finality predicate can only close by mutual agreement;
/// - allocation totals may never shrink unless [`authorizes_withdrawal`](Self::authorizes_withdrawal) permits it;
/// - dispute proofs default to the last two states preceding the candidate, which
///   is what turn-based applications need to prove a legal turn.
pub trait AppLogic: Send + Sync {
    type AppState;

    fn encode(&self, state: &Self::AppState) -> Result<Vec<u8>, AppLogicError>;

    fn decode(&self, data: &[u8]) -> Result<Self::AppState, AppLogicError>;

    fn validate_transition(
        &self,
        _config: &ChannelConfig,
        _prev: &Self::AppState,
        _next: &Self::AppState,
    ) -> Result<(), AppLogicError> {
        Ok(())
    }

    fn is_final(&self, _state: &Self::AppState) -> bool {
        false
    }

    fn authorizes_withdrawal(&self, _prev: &Self::AppState, _next: &Self::AppState) -> bool {
        false
    }

    /// The prior states to submit alongside a candidate as dispute evidence.
    /// `history` includes the candidate as its last element.
    fn proof_states(&self, history: &[State]) -> Vec<State> {
        let n = history.len();
        if n < 2 {
            return Vec::new();
        }
        let start = n.saturating_sub(3);
        history[start..n - 1].to_vec()
    }
}

/// Registry of application-logic implementations keyed by adjudicator type.
///
/// The key matches the adjudicator-variant key in
/// [`crate::chain::ChainConfig`]; `"base"` is the conventional default.
#[derive(Default)]
pub struct AppRegistry {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A>(&mut self, kind: impl Into<String>, logic: Arc<A>)
    where
        A: AppLogic + 'static,
    {
        self.entries.insert(kind.into(), logic);
    }

    pub fn get<A>(&self, kind: &str) -> Option<Arc<A>>
    where
        A: AppLogic + 'static,
    {
        self.entries.get(kind).and_then(|entry| entry.clone().downcast::<A>().ok())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::{Allocation, Role};
    use crate::types::Address;
    use std::time::Duration;

    /// A minimal turn counter: data is the turn index, a transition must advance
    /// the turn by one, and the game is final at turn 10.
    pub struct TurnCounter;

    impl AppLogic for TurnCounter {
        type AppState = u64;

        fn encode(&self, state: &u64) -> Result<Vec<u8>, AppLogicError> {
            Ok(state.to_le_bytes().to_vec())
        }

        fn decode(&self, data: &[u8]) -> Result<u64, AppLogicError> {
            let bytes: [u8; 8] =
                data.try_into().map_err(|_| AppLogicError::Decode("expected 8 bytes".into()))?;
            Ok(u64::from_le_bytes(bytes))
        }

        fn validate_transition(&self, _config: &ChannelConfig, prev: &u64, next: &u64) -> Result<(), AppLogicError> {
            if *next == prev + 1 {
                Ok(())
            } else {
                Err(AppLogicError::invalid_transition(format!("turn {next} does not follow {prev}")))
            }
        }

        fn is_final(&self, state: &u64) -> bool {
            *state >= 10
        }
    }

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address::new(bytes)
    }

    fn dummy_state(turn: u64) -> State {
        State::new(turn.to_le_bytes().to_vec(), vec![Allocation::new(addr(1), Address::zero(), 1.into())])
    }

    #[test]
    fn default_hooks() {
        struct Passthrough;
        impl AppLogic for Passthrough {
            type AppState = Vec<u8>;
            fn encode(&self, s: &Vec<u8>) -> Result<Vec<u8>, AppLogicError> {
                Ok(s.clone())
            }
            fn decode(&self, d: &[u8]) -> Result<Vec<u8>, AppLogicError> {
                Ok(d.to_vec())
            }
        }

        let logic = Passthrough;
        let config = ChannelConfig::new([addr(1), addr(2)], addr(9), Duration::from_secs(60), 1);
        assert!(logic.validate_transition(&config, &vec![1], &vec![2]).is_ok());
        assert!(!logic.is_final(&vec![1]));
        assert!(!logic.authorizes_withdrawal(&vec![1], &vec![2]));
        assert_eq!(Role::Host.index(), 0);
    }

    #[test]
    fn default_proofs_are_last_two_prior_states() {
        let logic = TurnCounter;
        let history: Vec<State> = (0..5).map(dummy_state).collect();
        let proofs = logic.proof_states(&history);
        assert_eq!(proofs.len(), 2);
        assert_eq!(proofs[0], history[2]);
        assert_eq!(proofs[1], history[3]);

        assert!(logic.proof_states(&history[..1]).is_empty());
        assert_eq!(logic.proof_states(&history[..2]).len(), 1);
    }

    #[test]
    fn turn_counter_transitions() {
        let logic = TurnCounter;
        let config = ChannelConfig::new([addr(1), addr(2)], addr(9), Duration::from_secs(60), 1);
        assert!(logic.validate_transition(&config, &3, &4).is_ok());
        assert!(logic.validate_transition(&config, &3, &5).is_err());
        assert!(!logic.is_final(&9));
        assert!(logic.is_final(&10));
    }

    #[test]
    fn registry_lookup_by_adjudicator_kind() {
        let mut registry = AppRegistry::new();
        registry.register("base", Arc::new(TurnCounter));
        assert!(registry.contains("base"));
        assert!(!registry.contains("snake"));
        let logic: Arc<TurnCounter> = registry.get("base").unwrap();
        assert!(logic.is_final(&11));
        assert!(registry.get::<TurnCounter>("snake").is_none());
    }
}
