//! The per-channel session manager: the single writer of one channel's
//! append-only state history, and the component that decides what evidence is
//! submitted on-chain when the channel closes or is disputed.

pub mod error;

use log::*;
use std::sync::Arc;

use crate::amount::TokenAmount;
use crate::app_logic::{AppLogic, AppLogicError};
use crate::chain::{ChainClient, ChainOperations, TxReceipt};
use crate::channel::{Allocation, ChannelConfig, ChannelId, Role, State};
use crate::session::error::SessionError;
use crate::signing::{MessageSigner, SignatureVerifier};
use crate::types::Address;

/// One channel's causal history of states and its four protocol actions
/// (close, challenge, checkpoint, reclaim).
///
/// A `ChannelSession` is the exclusive owner of its history: exactly one logical
/// actor advances it, applying either locally produced states
/// ([`append_app_state`](Self::append_app_state)) or counterparty-received ones
/// ([`process_received_state`](Self::process_received_state)). A new session is
/// always a fresh instance with a fresh history.
pub struct ChannelSession<A, C> {
    config: ChannelConfig,
    channel_id: ChannelId,
    role: Role,
    history: Vec<State>,
    app: Arc<A>,
    ops: Arc<ChainOperations<C>>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl<A, C> ChannelSession<A, C>
where
    A: AppLogic,
    C: ChainClient,
{
    /// Create a session for the local participant identified by `local_address`.
    /// Fails when the address is not one of the channel's participants.
    pub fn new(
        config: ChannelConfig,
        local_address: Address,
        app: Arc<A>,
        ops: Arc<ChainOperations<C>>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self, SessionError> {
        let role = Role::from_address(&config, local_address).ok_or_else(|| {
            SessionError::invalid_parameter(format!("{local_address} is not a participant of this channel"))
        })?;
        let channel_id = config.channel_id();
        Ok(ChannelSession { config, channel_id, role, history: Vec::new(), app, ops, verifier })
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_state(&self) -> Option<&State> {
        self.history.last()
    }

    pub fn history(&self) -> &[State] {
        &self.history
    }

    /// Decoded application state of the current snapshot.
    pub fn current_app_state(&self) -> Result<A::AppState, SessionError> {
        let state = self.current_state().ok_or(SessionError::NoCurrentState)?;
        Ok(self.app.decode(&state.data)?)
    }

    /// Build the initial state, fund allocations in participant order, and create
    /// the channel on-chain. The initial state becomes history\[0\].
    pub async fn open(
        &mut self,
        initial_app_state: &A::AppState,
        token: Address,
        amounts: &[TokenAmount],
        sigs: Vec<crate::signing::Signature>,
    ) -> Result<ChannelId, SessionError> {
        let participants = self.config.participants();
        if amounts.len() != participants.len() {
            return Err(SessionError::invalid_parameter(format!(
                "{} amounts for {} participants",
                amounts.len(),
                participants.len()
            )));
        }
        if !self.history.is_empty() {
            return Err(SessionError::invalid_parameter("the channel is already open"));
        }
        let allocations = participants
            .iter()
            .zip(amounts)
            .map(|(p, amount)| Allocation::new(*p, token, *amount))
            .collect::<Vec<_>>();
        let data = self.app.encode(initial_app_state)?;
        let mut state = State::new(data, allocations);
        state.sigs = sigs;
        info!("Opening channel {} as {}", self.channel_id, self.role);
        self.ops.create_channel(&self.config, &state).await?;
        self.history.push(state);
        Ok(self.channel_id)
    }

    /// Append a locally produced state, carrying allocations over unchanged from
    /// the previous state. The application's transition validator is the only
    /// admission check.
    pub fn append_app_state(&mut self, next_app_state: &A::AppState) -> Result<&State, SessionError> {
        let allocations = self.current_state().ok_or(SessionError::NoCurrentState)?.allocations.clone();
        self.append_with(next_app_state, allocations, false)
    }

    /// Append a locally produced state with explicitly rewritten allocations.
    ///
    /// The per-token total may never shrink versus the previous state unless the
    /// application logic authorizes a withdrawal-style transition, and may never
    /// grow, since allocations must always sum to the funds locked on-chain.
    pub fn append_app_state_with_allocations(
        &mut self,
        next_app_state: &A::AppState,
        allocations: Vec<Allocation>,
    ) -> Result<&State, SessionError> {
        self.append_with(next_app_state, allocations, true)
    }

    fn append_with(
        &mut self,
        next_app_state: &A::AppState,
        allocations: Vec<Allocation>,
        check_totals: bool,
    ) -> Result<&State, SessionError> {
        let prev = self.current_state().ok_or(SessionError::NoCurrentState)?;
        let prev_app_state = self.app.decode(&prev.data)?;
        self.app
            .validate_transition(&self.config, &prev_app_state, next_app_state)
            .map_err(|e| match e {
                AppLogicError::InvalidTransition(msg) => SessionError::InvalidTransition(msg),
                other => SessionError::AppLogic(other),
            })?;

        let data = self.app.encode(next_app_state)?;
        let next = State::new(data, allocations);
        if check_totals {
            self.check_conservation(prev, &next, &prev_app_state, next_app_state)?;
        }
        trace!("Appending state {} to channel {}", self.history.len(), self.channel_id);
        self.history.push(next);
        Ok(self.history.last().expect("state was just pushed"))
    }

    fn check_conservation(
        &self,
        prev: &State,
        next: &State,
        prev_app: &A::AppState,
        next_app: &A::AppState,
    ) -> Result<(), SessionError> {
        let prev_totals = prev
            .token_totals()
            .ok_or_else(|| SessionError::invalid_transition("allocation total in the previous state overflows"))?;
        let next_totals = next
            .token_totals()
            .ok_or_else(|| SessionError::invalid_transition("per-token allocation total overflows"))?;
        for (token, prev_total) in &prev_totals {
            let next_total = next_totals.get(token).copied().unwrap_or_else(TokenAmount::zero);
            if next_total > *prev_total {
                return Err(SessionError::invalid_transition(format!(
                    "allocation total for {token} grew from {prev_total} to {next_total} without a deposit"
                )));
            }
            if next_total < *prev_total && !self.app.authorizes_withdrawal(prev_app, next_app) {
                return Err(SessionError::invalid_transition(format!(
                    "allocation total for {token} shrank from {prev_total} to {next_total} without authorization"
                )));
            }
        }
        for token in next_totals.keys() {
            if !prev_totals.contains_key(token) {
                return Err(SessionError::invalid_transition(format!(
                    "allocation introduces unfunded token {token}"
                )));
            }
        }
        Ok(())
    }

    /// Apply a state received from the counterparty: it must carry the
    /// counterparty's valid signature over the state hash and pass the same
    /// transition validation as a local append.
    pub fn process_received_state(&mut self, state: State) -> Result<&State, SessionError> {
        let counterparty = self.config.participants()[self.role.counterparty().index()];
        if !state.is_signed_by(&self.channel_id, self.verifier.as_ref(), counterparty) {
            return Err(SessionError::MissingCounterpartySignature);
        }
        let prev = self.current_state().ok_or(SessionError::NoCurrentState)?;
        let prev_app_state = self.app.decode(&prev.data)?;
        let next_app_state = self.app.decode(&state.data)?;
        self.app
            .validate_transition(&self.config, &prev_app_state, &next_app_state)
            .map_err(|e| match e {
                AppLogicError::InvalidTransition(msg) => SessionError::InvalidTransition(msg),
                other => SessionError::AppLogic(other),
            })?;
        self.check_conservation(prev, &state, &prev_app_state, &next_app_state)?;
        debug!("Accepted counterparty state {} for channel {}", self.history.len(), self.channel_id);
        self.history.push(state);
        Ok(self.history.last().expect("state was just pushed"))
    }

    /// Add the local participant's signature to the current state.
    pub fn sign_current(&mut self, signer: &dyn MessageSigner) -> Result<(), SessionError> {
        let channel_id = self.channel_id;
        let state = self.history.last_mut().ok_or(SessionError::NoCurrentState)?;
        let digest = state.hash(&channel_id);
        let sig = signer.sign(&digest).map_err(|e| SessionError::invalid_parameter(e.to_string()))?;
        if !state.sigs.contains(&sig) {
            state.sigs.push(sig);
        }
        Ok(())
    }

    /// True only when the application's finality predicate accepts the current
    /// app state. An application that never overrides `is_final` can only close
    /// by mutual agreement, never through this path.
    pub fn is_final(&self) -> bool {
        match self.current_app_state() {
            Ok(app_state) => self.app.is_final(&app_state),
            Err(_) => false,
        }
    }

    /// Close the channel on-chain with the current state and the application's
    /// dispute proofs. Requires [`is_final`](Self::is_final).
    pub async fn close(&self) -> Result<TxReceipt, SessionError> {
        if !self.is_final() {
            return Err(SessionError::NoFinalState);
        }
        let (candidate, proofs) = self.candidate_and_proofs()?;
        info!("Closing channel {} with {} proof state(s)", self.channel_id, proofs.len());
        Ok(self.ops.close_channel(self.channel_id, candidate, &proofs).await?)
    }

    /// Start the on-chain dispute timer with the current state as candidate.
    /// Used when the counterparty is unresponsive.
    pub async fn challenge(&self) -> Result<TxReceipt, SessionError> {
        let (candidate, proofs) = self.candidate_and_proofs()?;
        warn!("Challenging channel {} with {} proof state(s)", self.channel_id, proofs.len());
        Ok(self.ops.challenge_channel(self.channel_id, candidate, &proofs).await?)
    }

    /// Anchor the current state on-chain without closing.
    pub async fn checkpoint(&self) -> Result<TxReceipt, SessionError> {
        let (candidate, proofs) = self.candidate_and_proofs()?;
        info!("Checkpointing channel {} at state {}", self.channel_id, self.history.len() - 1);
        Ok(self.ops.checkpoint_channel(self.channel_id, candidate, &proofs).await?)
    }

    /// Claim funds after the challenge period elapsed with no rebuttal: the
    /// challenged state is re-submitted as a close candidate, no further proofs
    /// needed since the adjudicator already validated it.
    pub async fn reclaim(&self) -> Result<TxReceipt, SessionError> {
        let candidate = self.current_state().ok_or(SessionError::NoCurrentState)?;
        info!("Reclaiming channel {} after challenge period", self.channel_id);
        Ok(self.ops.close_channel(self.channel_id, candidate, &[]).await?)
    }

    fn candidate_and_proofs(&self) -> Result<(&State, Vec<State>), SessionError> {
        let candidate = self.current_state().ok_or(SessionError::NoCurrentState)?;
        let proofs = self.app.proof_states(&self.history);
        Ok((candidate, proofs))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::app_logic::AppLogicError;
    use crate::chain::operations::test_support::ScriptedChain;
    use crate::chain::ChainConfig;
    use crate::signing::stub::{StubSigner, StubVerifier};
    use crate::signing::Signature;
    use std::time::Duration;

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address::new(bytes)
    }

    /// Turn-based test app: state is a turn counter, final at turn 3, and a
    /// withdrawal is authorized when the next turn is even.
    struct Turns;

    impl AppLogic for Turns {
        type AppState = u64;

        fn encode(&self, state: &u64) -> Result<Vec<u8>, AppLogicError> {
            Ok(state.to_le_bytes().to_vec())
        }

        fn decode(&self, data: &[u8]) -> Result<u64, AppLogicError> {
            let bytes: [u8; 8] = data.try_into().map_err(|_| AppLogicError::Decode("expected 8 bytes".into()))?;
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
            *state >= 3
        }

        fn authorizes_withdrawal(&self, _prev: &u64, next: &u64) -> bool {
            next % 2 == 0
        }
    }

    struct Fixture {
        chain: Arc<ScriptedChain>,
        session: ChannelSession<Turns, ScriptedChain>,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(ScriptedChain::default());
        let chain_config = ChainConfig::new(137, addr(100)).with_adjudicator("base", addr(101));
        let signer: Arc<dyn MessageSigner> = Arc::new(StubSigner::new(addr(1)));
        let ops = Arc::new(ChainOperations::new(chain.clone(), chain_config, Some(signer)));
        let config = ChannelConfig::new([addr(1), addr(2)], addr(101), Duration::from_secs(3600), 1);
        let verifier: Arc<dyn SignatureVerifier> = Arc::new(StubVerifier { known: vec![addr(1), addr(2)] });
        let session = ChannelSession::new(config, addr(1), Arc::new(Turns), ops, verifier).unwrap();
        Fixture { chain, session }
    }

    async fn opened() -> Fixture {
        let mut f = fixture();
        f.session
            .open(&0, Address::zero(), &[100.into(), 0.into()], Vec::new())
            .await
            .unwrap();
        f
    }

    #[test]
    fn non_participant_cannot_create_a_session() {
        let chain = Arc::new(ScriptedChain::default());
        let ops = Arc::new(ChainOperations::new(chain, ChainConfig::new(1, addr(100)), None));
        let config = ChannelConfig::new([addr(1), addr(2)], addr(101), Duration::from_secs(60), 1);
        let verifier: Arc<dyn SignatureVerifier> = Arc::new(StubVerifier { known: vec![] });
        let result = ChannelSession::new(config, addr(7), Arc::new(Turns), ops, verifier);
        assert!(matches!(result, Err(SessionError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn open_rejects_mismatched_amounts() {
        let mut f = fixture();
        let err = f.session.open(&0, Address::zero(), &[100.into()], Vec::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidParameter(_)));
        assert!(f.chain.submitted_functions().is_empty());
    }

    #[tokio::test]
    async fn open_builds_allocations_in_participant_order() {
        let f = opened().await;
        let state = f.session.current_state().unwrap();
        assert_eq!(state.allocations[0].destination, addr(1));
        assert_eq!(state.allocations[0].amount, TokenAmount::from_u64(100));
        assert_eq!(state.allocations[1].destination, addr(2));
        assert_eq!(state.allocations[1].amount, TokenAmount::zero());
        assert_eq!(f.chain.submitted_functions(), vec!["create".to_string()]);
        assert_eq!(f.session.current_app_state().unwrap(), 0);
    }

    #[tokio::test]
    async fn append_validates_transitions() {
        let mut f = opened().await;
        f.session.append_app_state(&1).unwrap();
        assert_eq!(f.session.current_app_state().unwrap(), 1);

        let err = f.session.append_app_state(&5).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition(_)));
        // The failed append left no trace
        assert_eq!(f.session.history().len(), 2);
    }

    #[tokio::test]
    async fn append_carries_allocations_over() {
        let mut f = opened().await;
        f.session.append_app_state(&1).unwrap();
        let state = f.session.current_state().unwrap();
        assert_eq!(state.allocations[0].amount, TokenAmount::from_u64(100));
        assert!(state.sigs.is_empty());
    }

    #[tokio::test]
    async fn rewritten_allocations_must_conserve_totals() {
        let mut f = opened().await;
        // Same total, different split: fine (turn 1 is odd, no withdrawal needed)
        let rebalanced = vec![
            Allocation::new(addr(1), Address::zero(), 60.into()),
            Allocation::new(addr(2), Address::zero(), 40.into()),
        ];
        f.session.append_app_state_with_allocations(&1, rebalanced).unwrap();
        f.session.append_app_state(&2).unwrap();

        // Shrinking the total at turn 3 (odd, no withdrawal authorization) fails
        let shrunk = vec![
            Allocation::new(addr(1), Address::zero(), 10.into()),
            Allocation::new(addr(2), Address::zero(), 40.into()),
        ];
        let err = f.session.append_app_state_with_allocations(&3, shrunk).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition(_)));

        // Growing the total always fails
        let grown = vec![
            Allocation::new(addr(1), Address::zero(), 100.into()),
            Allocation::new(addr(2), Address::zero(), 40.into()),
        ];
        let err = f.session.append_app_state_with_allocations(&3, grown).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition(_)));
        // The failed appends left no trace
        assert_eq!(f.session.history().len(), 3);
    }

    #[tokio::test]
    async fn overflowing_allocation_totals_are_rejected() {
        let mut f = opened().await;
        // 100 + U256::MAX wraps to 99; the unchecked "total" would match the
        // previous total even though the true sum vastly exceeds locked funds.
        let overflowing = vec![
            Allocation::new(addr(1), Address::zero(), 100.into()),
            Allocation::new(addr(2), Address::zero(), TokenAmount::from_big_endian(&[0xff; 32])),
        ];
        let err =
            f.session.append_app_state_with_allocations(&1, overflowing.clone()).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition(_)));
        assert_eq!(f.session.history().len(), 1);

        // The same state signed by the counterparty is rejected too
        let channel_id = f.session.channel_id();
        let mut next = State::new(1u64.to_le_bytes().to_vec(), overflowing);
        let digest = next.hash(&channel_id);
        next.sigs.push(StubSigner::new(addr(2)).sign(&digest).unwrap());
        let err = f.session.process_received_state(next).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition(_)));
        assert_eq!(f.session.history().len(), 1);
    }

    #[tokio::test]
    async fn authorized_withdrawal_may_shrink_totals() {
        let mut f = opened().await;
        f.session.append_app_state(&1).unwrap();
        // Turn 2 is even, so Turns authorizes a withdrawal
        let shrunk = vec![
            Allocation::new(addr(1), Address::zero(), 40.into()),
            Allocation::new(addr(2), Address::zero(), 0.into()),
        ];
        f.session.append_app_state_with_allocations(&2, shrunk).unwrap();
        assert_eq!(f.session.current_state().unwrap().total_for(Address::zero()), Some(TokenAmount::from_u64(40)));
    }

    #[tokio::test]
    async fn received_state_requires_counterparty_signature() {
        let mut f = opened().await;
        let channel_id = f.session.channel_id();
        let prev = f.session.current_state().unwrap().clone();

        let mut next = State::new(1u64.to_le_bytes().to_vec(), prev.allocations.clone());
        // Unsigned: rejected
        let err = f.session.process_received_state(next.clone()).unwrap_err();
        assert!(matches!(err, SessionError::MissingCounterpartySignature));

        // Signed by ourselves (host), not the guest: still rejected
        let digest = next.hash(&channel_id);
        next.sigs.push(StubSigner::new(addr(1)).sign(&digest).unwrap());
        let err = f.session.process_received_state(next.clone()).unwrap_err();
        assert!(matches!(err, SessionError::MissingCounterpartySignature));

        // Signed by the guest: accepted
        next.sigs.push(StubSigner::new(addr(2)).sign(&digest).unwrap());
        f.session.process_received_state(next).unwrap();
        assert_eq!(f.session.current_app_state().unwrap(), 1);
    }

    #[tokio::test]
    async fn received_state_still_validates_the_transition() {
        let mut f = opened().await;
        let channel_id = f.session.channel_id();
        let prev = f.session.current_state().unwrap().clone();
        let mut skipped = State::new(7u64.to_le_bytes().to_vec(), prev.allocations);
        let digest = skipped.hash(&channel_id);
        skipped.sigs.push(StubSigner::new(addr(2)).sign(&digest).unwrap());
        let err = f.session.process_received_state(skipped).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn close_requires_finality() {
        let mut f = opened().await;
        f.session.append_app_state(&1).unwrap();
        let err = f.session.close().await.unwrap_err();
        assert!(matches!(err, SessionError::NoFinalState));
        assert!(!f.session.is_final());
    }

    #[tokio::test]
    async fn close_submits_latest_state_and_app_proofs() {
        let mut f = opened().await;
        f.session.append_app_state(&1).unwrap();
        f.session.append_app_state(&2).unwrap();
        f.session.append_app_state(&3).unwrap();
        assert!(f.session.is_final());
        f.session.close().await.unwrap();

        let submitted = f.chain.submitted.lock().unwrap();
        let close = submitted.iter().find(|c| c.function == "close").unwrap();
        // Candidate is the final (turn 3) state
        let candidate: State = serde_json::from_value(close.params["candidate"].clone()).unwrap();
        assert_eq!(candidate.data, 3u64.to_le_bytes().to_vec());
        // Default proofs: the two states preceding the candidate (turns 1 and 2)
        let proofs: Vec<State> = serde_json::from_value(close.params["proofs"].clone()).unwrap();
        assert_eq!(proofs.len(), 2);
        assert_eq!(proofs[0].data, 1u64.to_le_bytes().to_vec());
        assert_eq!(proofs[1].data, 2u64.to_le_bytes().to_vec());
    }

    #[tokio::test]
    async fn challenge_and_checkpoint_use_the_same_proof_logic() {
        let mut f = opened().await;
        f.session.append_app_state(&1).unwrap();
        f.session.challenge().await.unwrap();
        f.session.checkpoint().await.unwrap();
        assert_eq!(
            f.chain.submitted_functions(),
            vec!["create".to_string(), "challenge".to_string(), "checkpoint".to_string()]
        );
    }

    #[tokio::test]
    async fn reclaim_resubmits_the_candidate_without_proofs() {
        let mut f = opened().await;
        f.session.append_app_state(&1).unwrap();
        f.session.reclaim().await.unwrap();
        let submitted = f.chain.submitted.lock().unwrap();
        let close = submitted.iter().find(|c| c.function == "close").unwrap();
        assert!(close.params["proofs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sign_current_is_idempotent() {
        let mut f = opened().await;
        let signer = StubSigner::new(addr(1));
        f.session.sign_current(&signer).unwrap();
        f.session.sign_current(&signer).unwrap();
        assert_eq!(f.session.current_state().unwrap().sigs.len(), 1);
        let sigs: &Vec<Signature> = &f.session.current_state().unwrap().sigs;
        let digest = f.session.current_state().unwrap().hash(&f.session.channel_id());
        let verifier = StubVerifier { known: vec![addr(1)] };
        assert!(verifier.verify(&digest, &sigs[0], addr(1)));
    }
}
