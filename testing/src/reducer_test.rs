//! Given-When-Then harness for reducers.

#![allow(clippy::module_name_repetitions)] // ReducerTest is the natural name

use gatekeeper_core::{effect::Effect, reducer::Reducer};

/// Type alias for state assertion functions
type StateAssertion<S> = Box<dyn FnOnce(&S)>;

/// Type alias for effect assertion functions
type EffectAssertion<A> = Box<dyn FnOnce(&[Effect<A>])>;

/// Fluent API for testing reducers
///
/// `given_actions` replays a history onto the initial state first (their
/// effects are discarded), so a test can reach a phase the way production
/// does instead of hand-building it.
///
/// # Example
///
/// ```ignore
/// ReducerTest::new(IntakeReducer)
///     .with_env(env)
///     .given_state(IntakeState::new("evt-001".into(), "staff-1".into()))
///     .given_actions([IntakeAction::Start, first_scan])
///     .when_action(second_scan)
///     .then_state(|state| assert!(state.phase.is_processing()))
///     .then_effects(|effects| assertions::assert_effects_count(effects, 1))
///     .run();
/// ```
pub struct ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    reducer: R,
    environment: Option<E>,
    initial_state: Option<S>,
    history: Vec<A>,
    action: Option<A>,
    state_assertions: Vec<StateAssertion<S>>,
    effect_assertions: Vec<EffectAssertion<A>>,
}

impl<R, S, A, E> ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    /// Create a new reducer test with the given reducer
    #[must_use]
    pub const fn new(reducer: R) -> Self {
        Self {
            reducer,
            environment: None,
            initial_state: None,
            history: Vec::new(),
            action: None,
            state_assertions: Vec::new(),
            effect_assertions: Vec::new(),
        }
    }

    /// Set the environment for the test
    #[must_use]
    pub fn with_env(mut self, env: E) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set the initial state (Given)
    #[must_use]
    pub fn given_state(mut self, state: S) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Replay actions onto the initial state before the action under test (Given)
    #[must_use]
    pub fn given_actions(mut self, actions: impl IntoIterator<Item = A>) -> Self {
        self.history.extend(actions);
        self
    }

    /// Set the action to test (When)
    #[must_use]
    pub fn when_action(mut self, action: A) -> Self {
        self.action = Some(action);
        self
    }

    /// Add an assertion about the resulting state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&S) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the effects of the action under test (Then)
    #[must_use]
    pub fn then_effects<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[Effect<A>]) + 'static,
    {
        self.effect_assertions.push(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if initial state, action, or environment is not set,
    /// or if any assertion fails.
    #[allow(clippy::expect_used)] // Test harness reports misuse loudly
    pub fn run(self) {
        let mut state = self
            .initial_state
            .expect("Initial state must be set with given_state()");
        let action = self.action.expect("Action must be set with when_action()");
        let env = self
            .environment
            .expect("Environment must be set with with_env()");

        for past in self.history {
            let _ = self.reducer.reduce(&mut state, past, &env);
        }

        let effects = self.reducer.reduce(&mut state, action, &env);

        for assertion in self.state_assertions {
            assertion(&state);
        }

        for assertion in self.effect_assertions {
            assertion(&effects);
        }
    }
}

/// Helper assertions for effects
pub mod assertions {
    use gatekeeper_core::effect::Effect;

    /// Assert that there are no effects
    ///
    /// # Panics
    ///
    /// Panics if any effect other than `Effect::None` is present.
    pub fn assert_no_effects<A: std::fmt::Debug>(effects: &[Effect<A>]) {
        assert!(
            effects.iter().all(|e| matches!(e, Effect::None)),
            "Expected no effects, but found {}: {:?}",
            effects.len(),
            effects
        );
    }

    /// Assert the number of effects
    ///
    /// # Panics
    ///
    /// Panics if the number of effects doesn't match expected.
    pub fn assert_effects_count<A>(effects: &[Effect<A>], expected: usize) {
        assert_eq!(
            effects.len(),
            expected,
            "Expected {} effects, but found {}",
            expected,
            effects.len()
        );
    }

    /// Assert that effects contain at least one Future effect
    ///
    /// # Panics
    ///
    /// Panics if no Future effect is found.
    pub fn assert_has_future_effect<A>(effects: &[Effect<A>]) {
        assert!(
            effects.iter().any(Effect::is_future),
            "Expected at least one Future effect, but none found"
        );
    }

    /// Assert that effects contain a Delay of exactly `duration`
    ///
    /// # Panics
    ///
    /// Panics if no matching Delay effect is found.
    pub fn assert_has_delay_effect<A>(effects: &[Effect<A>], duration: std::time::Duration) {
        assert!(
            effects
                .iter()
                .any(|e| matches!(e, Effect::Delay { duration: d, .. } if *d == duration)),
            "Expected a Delay effect of {duration:?}, but none found"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_core::{Effects, smallvec};
    use std::time::Duration;

    #[derive(Clone, Debug)]
    struct TurnstileState {
        admitted: u32,
        locked: bool,
    }

    #[derive(Clone, Debug)]
    enum TurnstileAction {
        Push,
        Lock,
        Relock,
    }

    struct TurnstileReducer;

    impl Reducer for TurnstileReducer {
        type State = TurnstileState;
        type Action = TurnstileAction;
        type Environment = ();

        fn reduce(
            &self,
            state: &mut TurnstileState,
            action: TurnstileAction,
            _env: &(),
        ) -> Effects<TurnstileAction> {
            match action {
                TurnstileAction::Push if state.locked => Effects::new(),
                TurnstileAction::Push => {
                    state.admitted += 1;
                    state.locked = true;
                    smallvec![Effect::delay(
                        Duration::from_millis(500),
                        TurnstileAction::Relock
                    )]
                },
                TurnstileAction::Lock => {
                    state.locked = true;
                    Effects::new()
                },
                TurnstileAction::Relock => {
                    state.locked = false;
                    Effects::new()
                },
            }
        }
    }

    fn open() -> TurnstileState {
        TurnstileState {
            admitted: 0,
            locked: false,
        }
    }

    #[test]
    fn push_admits_and_schedules_release() {
        ReducerTest::new(TurnstileReducer)
            .with_env(())
            .given_state(open())
            .when_action(TurnstileAction::Push)
            .then_state(|state| {
                assert_eq!(state.admitted, 1);
                assert!(state.locked);
            })
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assertions::assert_has_delay_effect(effects, Duration::from_millis(500));
            })
            .run();
    }

    #[test]
    fn history_is_replayed_before_the_action() {
        ReducerTest::new(TurnstileReducer)
            .with_env(())
            .given_state(open())
            .given_actions([TurnstileAction::Push])
            .when_action(TurnstileAction::Push)
            .then_state(|state| assert_eq!(state.admitted, 1))
            .then_effects(|effects| assertions::assert_no_effects(effects))
            .run();
    }

    #[test]
    fn relock_after_lock_opens_again() {
        ReducerTest::new(TurnstileReducer)
            .with_env(())
            .given_state(open())
            .given_actions([TurnstileAction::Lock])
            .when_action(TurnstileAction::Relock)
            .then_state(|state| assert!(!state.locked))
            .run();
    }
}
