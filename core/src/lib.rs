//! # Gatekeeper Core
//!
//! Functional-core abstractions shared by the check-in engine.
//!
//! State machines in Gatekeeper are written as reducers: a pure function
//! `(State, Action, Environment) → (State, Effects)`. The reducer never
//! performs I/O itself. It returns [`effect::Effect`] descriptions, and the
//! runtime executes them and feeds the resulting actions back in.
//!
//! ## Core Concepts
//!
//! - **State**: owned, cloneable domain state for one feature
//! - **Action**: every input a reducer can observe (commands and results)
//! - **Reducer**: the transition function
//! - **Effect**: a side effect description, executed by the runtime
//! - **Environment**: injected dependencies (stores, clocks, settings)
//!
//! ## Example
//!
//! ```ignore
//! use gatekeeper_core::{effect::Effect, reducer::Reducer, Effects};
//!
//! impl Reducer for GateReducer {
//!     type State = GateState;
//!     type Action = GateAction;
//!     type Environment = GateEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut GateState,
//!         action: GateAction,
//!         env: &GateEnvironment,
//!     ) -> Effects<GateAction> {
//!         match action {
//!             GateAction::Open => {
//!                 state.open = true;
//!                 Effects::new()
//!             }
//!         }
//!     }
//! }
//! ```

pub use chrono::{DateTime, Utc};
pub use smallvec::{SmallVec, smallvec};

/// Effects returned from a single reducer call.
///
/// Most transitions produce zero to two effects, so the list lives inline.
pub type Effects<Action> = SmallVec<[effect::Effect<Action>; 4]>;

/// Reducer module - the transition function trait
pub mod reducer {
    use super::Effects;

    /// The Reducer trait - core abstraction for state machine logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The state this reducer transitions
    /// - `Action`: The inputs this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// Must be deterministic for a given state, action and environment,
        /// and must not block: anything slow belongs in a returned effect.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> Effects<Self::Action>;
    }
}

/// Effect module - side effect descriptions
pub mod effect {
    use futures::future::BoxFuture;
    use std::time::Duration;

    /// Effect type - describes a side effect to be executed
    ///
    /// Effects are values. The runtime decides when and where they run; a
    /// reducer only states what should happen.
    ///
    /// # Type Parameters
    ///
    /// - `Action`: The action type effects feed back into the reducer
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects concurrently
        Parallel(Vec<Effect<Action>>),

        /// Run effects one after another
        Sequential(Vec<Effect<Action>>),

        /// Dispatch an action after a delay (timers, cooldowns)
        Delay {
            /// How long to wait
            duration: Duration,
            /// Action to dispatch after the delay
            action: Box<Action>,
        },

        /// Arbitrary async computation
        ///
        /// If the future resolves to `Some(action)`, that action is fed back
        /// into the reducer.
        Future(BoxFuture<'static, Option<Action>>),
    }

    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action>
    where
        Action: Send + 'static,
    {
        /// Wrap an async computation whose output is fed back as an action.
        #[must_use]
        pub fn future<F>(fut: F) -> Self
        where
            F: std::future::Future<Output = Option<Action>> + Send + 'static,
        {
            Effect::Future(Box::pin(fut))
        }

        /// Feed an action back through the runtime without doing any work.
        ///
        /// Used for notifications that observers of the store should see,
        /// such as a request being discarded.
        #[must_use]
        pub fn emit(action: Action) -> Self {
            Effect::Future(Box::pin(futures::future::ready(Some(action))))
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Dispatch `action` once `duration` has elapsed
        #[must_use]
        pub fn delay(duration: std::time::Duration, action: Action) -> Effect<Action> {
            Effect::Delay {
                duration,
                action: Box::new(action),
            }
        }

        /// Whether this effect is a `Delay`
        #[must_use]
        pub const fn is_delay(&self) -> bool {
            matches!(self, Effect::Delay { .. })
        }

        /// Whether this effect is a `Future`
        #[must_use]
        pub const fn is_future(&self) -> bool {
            matches!(self, Effect::Future(_))
        }
    }
}

/// Environment module - dependency injection traits
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time for testability
    ///
    /// Ledger timestamps always come from the injected clock, never from
    /// `Utc::now()` directly.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::effect::Effect;
    use super::environment::{Clock, SystemClock};
    use std::time::Duration;

    #[test]
    fn delay_helper_builds_delay_variant() {
        let effect = Effect::delay(Duration::from_millis(10), 7_u32);
        assert!(effect.is_delay());
        assert!(!effect.is_future());
    }

    #[tokio::test]
    async fn emit_resolves_to_the_action() {
        let Effect::Future(fut) = Effect::emit(42_u32) else {
            unreachable!("emit always builds a future");
        };
        assert_eq!(fut.await, Some(42));
    }

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
