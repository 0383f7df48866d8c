use tracing::{debug, info};

use crate::{
    dao::models::TurnStateEntity, error::ServiceError, state::SharedState,
    state::turn_machine::TurnAdvance,
};

/// Outcome of a conditional turn advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The guard matched and the new turn was written.
    Applied,
    /// Another participant advanced first; nothing was written. Not an error.
    LostRace,
}

/// Create the turn row unless one already exists. Returns whether this call created it.
pub async fn ensure_turn_initialized(
    state: &SharedState,
    proposal: TurnStateEntity,
) -> Result<bool, ServiceError> {
    let store = state.require_store().await?;
    let session_id = proposal.session_id;
    let first_player = proposal.current_player.clone();
    let created = store.init_turn_state(proposal).await?;
    if created {
        info!(%session_id, %first_player, "turn play initialized");
    } else {
        debug!(%session_id, "turn row already present; initialization skipped");
    }
    Ok(created)
}

/// Apply `advance` only if the stored turn still matches its guard.
///
/// Zero affected rows means another participant already advanced this turn and is reported
/// as [`AdvanceOutcome::LostRace`]; callers must not retry it.
pub async fn advance_turn(
    state: &SharedState,
    advance: &TurnAdvance,
) -> Result<AdvanceOutcome, ServiceError> {
    let store = state.require_store().await?;
    let affected = store
        .compare_and_swap_turn(advance.guard.clone(), advance.next.clone())
        .await?;

    let session_id = advance.next.session_id;
    if affected == 0 {
        debug!(
            %session_id,
            turn_index = advance.guard.turn_index,
            expected_player = %advance.guard.current_player,
            "turn advance lost the race"
        );
        return Ok(AdvanceOutcome::LostRace);
    }

    info!(
        %session_id,
        turn_index = advance.next.turn_index,
        current_player = %advance.next.current_player,
        "turn advanced"
    );
    Ok(AdvanceOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use uuid::Uuid;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::models::TurnStatus,
        services::test_support::state_with,
        state::turn_machine::{initial_turn, plan_advance},
    };

    const TURN: Duration = Duration::from_secs(30);

    fn roster(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn concurrent_initializers_leave_one_deterministic_row() {
        let state = state_with(AppConfig::default()).await;
        let session_id = Uuid::new_v4();
        let members = roster(&["alice", "bob"]);
        let first = initial_turn(session_id, &members, at(10), TURN).unwrap();
        let second = initial_turn(session_id, &members, at(11), TURN).unwrap();

        let (left, right) = tokio::join!(
            ensure_turn_initialized(&state, first),
            ensure_turn_initialized(&state, second)
        );
        assert_eq!(
            [left.unwrap(), right.unwrap()]
                .iter()
                .filter(|created| **created)
                .count(),
            1
        );

        let store = state.require_store().await.unwrap();
        let turn = store.find_turn_state(session_id).await.unwrap().unwrap();
        assert_eq!(turn.turn_index, 0);
        assert_eq!(turn.current_player, "alice");
    }

    #[tokio::test]
    async fn simultaneous_advances_apply_exactly_once() {
        let state = state_with(AppConfig::default()).await;
        let session_id = Uuid::new_v4();
        let members = roster(&["alice", "bob", "carol"]);
        let turn = initial_turn(session_id, &members, at(0), TURN).unwrap();
        ensure_turn_initialized(&state, turn.clone()).await.unwrap();

        let left = plan_advance(&turn, &members, at(30), TURN).unwrap();
        let right = plan_advance(&turn, &members, at(31), TURN).unwrap();
        let (left, right) = tokio::join!(advance_turn(&state, &left), advance_turn(&state, &right));
        let mut outcomes = vec![left.unwrap(), right.unwrap()];
        outcomes.sort_by_key(|outcome| *outcome == AdvanceOutcome::LostRace);
        assert_eq!(
            outcomes,
            vec![AdvanceOutcome::Applied, AdvanceOutcome::LostRace]
        );

        let store = state.require_store().await.unwrap();
        let stored = store.find_turn_state(session_id).await.unwrap().unwrap();
        assert_eq!(stored.turn_index, 1);
        assert_eq!(stored.current_player, "bob");
    }

    #[tokio::test]
    async fn timeout_advance_then_stale_attempt_is_a_no_op() {
        let state = state_with(AppConfig::default()).await;
        let store = state.require_store().await.unwrap();
        let session_id = Uuid::new_v4();
        let members = roster(&["alice", "bob"]);
        let deadline = at(1_000);
        let turn = TurnStateEntity {
            session_id,
            current_player: "alice".into(),
            turn_index: 4,
            deadline,
            status: TurnStatus::Active,
        };
        store.init_turn_state(turn.clone()).await.unwrap();

        let epsilon = Duration::from_millis(20);
        let advance = plan_advance(&turn, &members, deadline + epsilon, TURN).unwrap();
        assert_eq!(
            advance_turn(&state, &advance).await.unwrap(),
            AdvanceOutcome::Applied
        );

        let stale = plan_advance(&turn, &members, deadline + epsilon * 2, TURN).unwrap();
        assert_eq!(
            advance_turn(&state, &stale).await.unwrap(),
            AdvanceOutcome::LostRace
        );

        let stored = store.find_turn_state(session_id).await.unwrap().unwrap();
        assert_eq!(stored.current_player, "bob");
        assert_eq!(stored.turn_index, 5);
        assert_eq!(stored.deadline, deadline + epsilon + TURN);
    }

    #[tokio::test]
    async fn turn_index_grows_by_one_per_applied_advance() {
        let state = state_with(AppConfig::default()).await;
        let store = state.require_store().await.unwrap();
        let session_id = Uuid::new_v4();
        let members = roster(&["alice", "bob", "carol"]);
        ensure_turn_initialized(
            &state,
            initial_turn(session_id, &members, at(0), TURN).unwrap(),
        )
        .await
        .unwrap();

        let mut players = Vec::new();
        for step in 1..=6 {
            let current = store.find_turn_state(session_id).await.unwrap().unwrap();
            let advance = plan_advance(&current, &members, at(step * 30), TURN).unwrap();
            assert_eq!(
                advance_turn(&state, &advance).await.unwrap(),
                AdvanceOutcome::Applied
            );
            let stored = store.find_turn_state(session_id).await.unwrap().unwrap();
            assert_eq!(stored.turn_index, step);
            players.push(stored.current_player);
        }
        assert_eq!(players, vec!["bob", "carol", "alice", "bob", "carol", "alice"]);
    }
}
