//! # Gatekeeper Runtime
//!
//! The Store runtime that owns reducer state and executes effects.
//!
//! ## Core Components
//!
//! - **Store**: holds state behind a lock, runs the reducer, executes effects
//! - **Feedback loop**: actions produced by effects are reduced, then broadcast
//!   to observers
//!
//! ## Example
//!
//! ```ignore
//! use gatekeeper_runtime::Store;
//!
//! let store = Store::new(initial_state, my_reducer, environment);
//!
//! store.send(Action::DoSomething).await?;
//!
//! let value = store.state(|s| s.some_field).await;
//! ```

use gatekeeper_core::{effect::Effect, reducer::Reducer};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Error types for the Store runtime
pub mod error {
    use thiserror::Error;

    /// Errors that can occur during Store operations
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum StoreError {
        /// Store is shutting down and not accepting new actions
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out waiting for effects to complete
        #[error("Shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),

        /// Timeout waiting for a terminal action
        ///
        /// Returned by `send_and_wait_for` when the timeout expires before
        /// a matching action is observed.
        #[error("Timeout waiting for action")]
        Timeout,

        /// Action broadcast channel closed
        #[error("Action broadcast channel closed")]
        ChannelClosed,
    }
}

pub use error::StoreError;

/// Configuration for Store behavior
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Capacity of the action broadcast channel
    pub broadcast_capacity: usize,
    /// How often `shutdown` and `wait_for_idle` poll the pending effect count
    pub poll_interval: Duration,
}

impl StoreConfig {
    /// Set the broadcast channel capacity
    #[must_use]
    pub const fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Set the pending-effect poll interval
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 64,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Decrements the pending effect counter when dropped, even if the effect
/// task panics.
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Store module - the runtime coordinator
pub mod store {
    use super::{
        Arc, AtomicBool, AtomicUsize, Duration, Effect, Ordering, PendingGuard, Reducer, RwLock,
        StoreConfig, StoreError,
    };
    use futures::future::BoxFuture;
    use tokio::sync::broadcast;

    struct Inner<S, A, E, R> {
        state: RwLock<S>,
        reducer: R,
        environment: E,
        config: StoreConfig,
        shutdown: AtomicBool,
        pending_effects: Arc<AtomicUsize>,
        action_broadcast: broadcast::Sender<A>,
    }

    /// The Store - runtime coordinator for a reducer
    ///
    /// The Store manages:
    /// 1. State (behind `RwLock`, the reducer runs under the write lock)
    /// 2. Reducer (transition logic)
    /// 3. Environment (injected dependencies)
    /// 4. Effect execution (spawned tasks, results fed back as actions)
    ///
    /// Cloning a Store is cheap and yields a handle to the same state.
    ///
    /// # Ordering
    ///
    /// An action produced by an effect is reduced *before* it is broadcast,
    /// so an observer woken by a broadcast always reads state that already
    /// reflects that action.
    pub struct Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        inner: Arc<Inner<S, A, E, R>>,
    }

    impl<S, A, E, R> Clone for Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }

    impl<S, A, E, R> Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
        A: Send + Clone + std::fmt::Debug + 'static,
        S: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        /// Create a new store with default configuration
        #[must_use]
        pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
            Self::with_config(initial_state, reducer, environment, StoreConfig::default())
        }

        /// Create a new store with custom configuration
        #[must_use]
        pub fn with_config(initial_state: S, reducer: R, environment: E, config: StoreConfig) -> Self {
            let (action_broadcast, _) = broadcast::channel(config.broadcast_capacity.max(1));

            Self {
                inner: Arc::new(Inner {
                    state: RwLock::new(initial_state),
                    reducer,
                    environment,
                    config,
                    shutdown: AtomicBool::new(false),
                    pending_effects: Arc::new(AtomicUsize::new(0)),
                    action_broadcast,
                }),
            }
        }

        /// Access the injected environment
        #[must_use]
        pub fn environment(&self) -> &E {
            &self.inner.environment
        }

        /// Number of effects currently running
        #[must_use]
        pub fn pending_effects(&self) -> usize {
            self.inner.pending_effects.load(Ordering::Acquire)
        }

        /// Whether `shutdown` has been initiated
        #[must_use]
        pub fn is_shutting_down(&self) -> bool {
            self.inner.shutdown.load(Ordering::Acquire)
        }

        /// Send an action to the store
        ///
        /// 1. Acquires the write lock on state
        /// 2. Calls the reducer with (state, action, environment)
        /// 3. Releases the lock, then spawns the returned effects
        ///
        /// Returns once effects are started, not once they complete.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
        #[tracing::instrument(skip(self, action), name = "store_send")]
        pub async fn send(&self, action: A) -> Result<(), StoreError> {
            if self.is_shutting_down() {
                tracing::warn!("Rejected action: store is shutting down");
                metrics::counter!("store_rejected_actions_total").increment(1);
                return Err(StoreError::ShutdownInProgress);
            }

            tracing::trace!(?action, "Processing action");
            metrics::counter!("store_actions_total").increment(1);

            let effects = {
                let mut state = self.inner.state.write().await;
                let start = std::time::Instant::now();
                let effects = self
                    .inner
                    .reducer
                    .reduce(&mut state, action, &self.inner.environment);
                metrics::histogram!("store_reducer_duration_seconds")
                    .record(start.elapsed().as_secs_f64());
                effects
            };

            for effect in effects {
                self.execute_effect(effect);
            }

            Ok(())
        }

        /// Send an action and wait for a matching action produced by effects
        ///
        /// Subscribes to the action broadcast *before* sending, then returns
        /// the first broadcast action matching `predicate`. Concurrent callers
        /// should match on a correlation id.
        ///
        /// # Errors
        ///
        /// - [`StoreError::ShutdownInProgress`]: the store is shutting down
        /// - [`StoreError::Timeout`]: no matching action within `timeout`
        /// - [`StoreError::ChannelClosed`]: the broadcast channel closed
        pub async fn send_and_wait_for<F>(
            &self,
            action: A,
            predicate: F,
            timeout: Duration,
        ) -> Result<A, StoreError>
        where
            F: Fn(&A) -> bool,
        {
            let mut rx = self.inner.action_broadcast.subscribe();

            self.send(action).await?;

            tokio::time::timeout(timeout, async {
                loop {
                    match rx.recv().await {
                        Ok(action) if predicate(&action) => return Ok(action),
                        Ok(_) => {},
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Action observer lagged");
                        },
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(StoreError::ChannelClosed);
                        },
                    }
                }
            })
            .await
            .map_err(|_| StoreError::Timeout)?
        }

        /// Subscribe to every action produced by effects
        ///
        /// Initial actions passed to `send` are not broadcast.
        #[must_use]
        pub fn subscribe_actions(&self) -> broadcast::Receiver<A> {
            self.inner.action_broadcast.subscribe()
        }

        /// Read current state via a closure
        ///
        /// ```ignore
        /// let phase = store.state(|s| s.phase.clone()).await;
        /// ```
        pub async fn state<F, T>(&self, f: F) -> T
        where
            F: FnOnce(&S) -> T,
        {
            let state = self.inner.state.read().await;
            f(&state)
        }

        /// Wait until no effects are running
        ///
        /// Pending `Delay` effects count as running.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::Timeout`] if effects are still running after `timeout`.
        pub async fn wait_for_idle(&self, timeout: Duration) -> Result<(), StoreError> {
            let start = tokio::time::Instant::now();
            loop {
                if self.pending_effects() == 0 {
                    return Ok(());
                }
                if start.elapsed() >= timeout {
                    return Err(StoreError::Timeout);
                }
                tokio::time::sleep(self.inner.config.poll_interval).await;
            }
        }

        /// Initiate graceful shutdown of the store
        ///
        /// Rejects new actions, then waits for running effects. Actions fed
        /// back by effects after this point are dropped.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownTimeout`] if effects are still running
        /// when `timeout` expires.
        pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
            tracing::info!("Initiating graceful shutdown");
            self.inner.shutdown.store(true, Ordering::Release);

            match self.wait_for_idle(timeout).await {
                Ok(()) => {
                    tracing::info!("All effects completed, shutdown successful");
                    Ok(())
                },
                Err(_) => {
                    let pending = self.pending_effects();
                    tracing::error!(pending_effects = pending, "Shutdown timeout");
                    Err(StoreError::ShutdownTimeout(pending))
                },
            }
        }

        /// Spawn an effect, tracking it in the pending counter
        fn execute_effect(&self, effect: Effect<A>) {
            if matches!(effect, Effect::None) {
                metrics::counter!("store_effects_executed_total", "type" => "none").increment(1);
                return;
            }

            self.inner.pending_effects.fetch_add(1, Ordering::AcqRel);
            let guard = PendingGuard(Arc::clone(&self.inner.pending_effects));
            let store = self.clone();

            tokio::spawn(async move {
                let _guard = guard;
                store.run_effect(effect).await;
            });
        }

        /// Run an effect to completion, feeding produced actions back
        fn run_effect(&self, effect: Effect<A>) -> BoxFuture<'static, ()> {
            let store = self.clone();
            Box::pin(async move {
                match effect {
                    Effect::None => {
                        metrics::counter!("store_effects_executed_total", "type" => "none")
                            .increment(1);
                    },
                    Effect::Future(fut) => {
                        metrics::counter!("store_effects_executed_total", "type" => "future")
                            .increment(1);
                        if let Some(action) = fut.await {
                            store.feed_back(action).await;
                        }
                    },
                    Effect::Delay { duration, action } => {
                        metrics::counter!("store_effects_executed_total", "type" => "delay")
                            .increment(1);
                        tokio::time::sleep(duration).await;
                        store.feed_back(*action).await;
                    },
                    Effect::Parallel(effects) => {
                        metrics::counter!("store_effects_executed_total", "type" => "parallel")
                            .increment(1);
                        let runs = effects.into_iter().map(|effect| store.run_effect(effect));
                        futures::future::join_all(runs).await;
                    },
                    Effect::Sequential(effects) => {
                        metrics::counter!("store_effects_executed_total", "type" => "sequential")
                            .increment(1);
                        for effect in effects {
                            store.run_effect(effect).await;
                        }
                    },
                }
            })
        }

        /// Reduce an effect-produced action, then broadcast it
        async fn feed_back(&self, action: A) {
            match self.send(action.clone()).await {
                Ok(()) => {
                    // No receivers is fine: nobody is observing right now.
                    let _ = self.inner.action_broadcast.send(action);
                },
                Err(error) => {
                    tracing::warn!(%error, ?action, "Dropped effect-produced action");
                },
            }
        }
    }
}

pub use store::Store;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use gatekeeper_core::{Effects, smallvec};

    #[derive(Debug, Clone, Default)]
    struct CounterState {
        value: i32,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum CounterAction {
        Increment,
        IncrementLater,
        IncrementTwiceInParallel,
        IncrementInSequence,
        Report { value: i32 },
        AskForReport,
    }

    #[derive(Debug, Clone)]
    struct CounterReducer;

    impl Reducer for CounterReducer {
        type State = CounterState;
        type Action = CounterAction;
        type Environment = ();

        fn reduce(
            &self,
            state: &mut CounterState,
            action: CounterAction,
            _env: &(),
        ) -> Effects<CounterAction> {
            match action {
                CounterAction::Increment => {
                    state.value += 1;
                    Effects::new()
                },
                CounterAction::IncrementLater => smallvec![Effect::delay(
                    Duration::from_millis(50),
                    CounterAction::Increment
                )],
                CounterAction::IncrementTwiceInParallel => smallvec![Effect::merge(vec![
                    Effect::emit(CounterAction::Increment),
                    Effect::emit(CounterAction::Increment),
                ])],
                CounterAction::IncrementInSequence => smallvec![Effect::chain(vec![
                    Effect::emit(CounterAction::Increment),
                    Effect::delay(Duration::from_millis(5), CounterAction::Increment),
                    Effect::emit(CounterAction::Increment),
                ])],
                CounterAction::AskForReport => {
                    let value = state.value;
                    smallvec![Effect::emit(CounterAction::Report { value })]
                },
                CounterAction::Report { .. } => Effects::new(),
            }
        }
    }

    fn counter_store() -> Store<CounterState, CounterAction, (), CounterReducer> {
        Store::new(CounterState::default(), CounterReducer, ())
    }

    #[tokio::test]
    async fn send_applies_reducer_synchronously() {
        let store = counter_store();
        store.send(CounterAction::Increment).await.unwrap();
        store.send(CounterAction::Increment).await.unwrap();
        assert_eq!(store.state(|s| s.value).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_action_is_fed_back_after_duration() {
        let store = counter_store();
        store.send(CounterAction::IncrementLater).await.unwrap();
        assert_eq!(store.state(|s| s.value).await, 0);
        assert_eq!(store.pending_effects(), 1);

        store.wait_for_idle(Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.state(|s| s.value).await, 1);
    }

    #[tokio::test]
    async fn parallel_and_sequential_effects_all_feed_back() {
        let store = counter_store();
        store
            .send(CounterAction::IncrementTwiceInParallel)
            .await
            .unwrap();
        store.send(CounterAction::IncrementInSequence).await.unwrap();
        store.wait_for_idle(Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.state(|s| s.value).await, 5);
    }

    #[tokio::test]
    async fn send_and_wait_for_returns_matching_action() {
        let store = counter_store();
        store.send(CounterAction::Increment).await.unwrap();

        let reply = store
            .send_and_wait_for(
                CounterAction::AskForReport,
                |a| matches!(a, CounterAction::Report { .. }),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(reply, CounterAction::Report { value: 1 });
    }

    #[tokio::test]
    async fn broadcast_happens_after_reduction() {
        let store = counter_store();
        let mut rx = store.subscribe_actions();
        store
            .send(CounterAction::IncrementTwiceInParallel)
            .await
            .unwrap();

        rx.recv().await.unwrap();
        assert!(store.state(|s| s.value).await >= 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_actions() {
        let store = counter_store();
        store.shutdown(Duration::from_secs(1)).await.unwrap();
        let result = store.send(CounterAction::Increment).await;
        assert_eq!(result, Err(StoreError::ShutdownInProgress));
    }

    #[tokio::test(start_paused = true)]
    async fn send_and_wait_for_times_out_without_match() {
        let store = counter_store();
        let result = store
            .send_and_wait_for(
                CounterAction::Increment,
                |a| matches!(a, CounterAction::Report { .. }),
                Duration::from_millis(100),
            )
            .await;
        assert_eq!(result, Err(StoreError::Timeout));
    }
}
