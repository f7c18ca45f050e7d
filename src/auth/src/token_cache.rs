// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::Result;
use crate::clock::{Clock, SystemClock};
use crate::credentials::ChangeListener;
use crate::token::{AccessToken, TokenProvider};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Tokens are refreshed this long before they expire.
pub(crate) const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

type RefreshFuture = Shared<BoxFuture<'static, Result<AccessToken>>>;

#[derive(Default)]
struct State {
    // The last token successfully fetched. A failed refresh never clears it.
    token: Option<AccessToken>,
    // The refresh in progress, if any. Late callers await a clone of it.
    in_flight: Option<RefreshFuture>,
}

/// Caches the token returned by a [TokenProvider].
///
/// At most one refresh runs at a time. Callers that find the token stale
/// while a refresh is in progress share the result of that refresh.
pub(crate) struct TokenCache<T>
where
    T: TokenProvider,
{
    // The token provider. This thing does the refreshing.
    inner: Arc<T>,
    state: Arc<Mutex<State>>,
    listeners: Arc<Mutex<Vec<ChangeListener>>>,
    clock: Arc<dyn Clock>,
}

// We manually implement the `Clone` trait because the Rust compiler will
// squawk if `T` is not `Clone`, even though we only hold an `Arc<T>`. :shrug:
impl<T: TokenProvider> Clone for TokenCache<T> {
    fn clone(&self) -> TokenCache<T> {
        TokenCache {
            inner: self.inner.clone(),
            state: self.state.clone(),
            listeners: self.listeners.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<T: TokenProvider> std::fmt::Debug for TokenCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("inner", &self.inner)
            .field("clock", &self.clock)
            .finish()
    }
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    // The guarded values are always left in a consistent state, a panic in
    // another thread does not invalidate them.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: TokenProvider + 'static> TokenCache<T> {
    pub(crate) fn new(inner: T) -> TokenCache<T> {
        TokenCache {
            inner: Arc::new(inner),
            state: Arc::new(Mutex::new(State::default())),
            listeners: Arc::new(Mutex::new(Vec::new())),
            clock: Arc::new(SystemClock),
        }
    }

    /// Decides freshness with `clock` instead of the wall clock.
    pub(crate) fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn is_fresh(&self, token: &AccessToken) -> bool {
        !token.expires_within(self.clock.now(), DEFAULT_REFRESH_MARGIN)
    }

    /// Returns the cached token if it is fresh, without any I/O.
    pub(crate) fn cached(&self) -> Option<AccessToken> {
        let state = lock(&self.state);
        state.token.clone().filter(|t| self.is_fresh(t))
    }

    /// Returns a fresh token, refreshing it first if needed.
    pub(crate) async fn token(&self) -> Result<AccessToken> {
        let refresh = {
            let mut state = lock(&self.state);
            if let Some(token) = state.token.as_ref().filter(|t| self.is_fresh(t)) {
                return Ok(token.clone());
            }
            self.join_or_start_refresh(&mut state)
        };
        refresh.await
    }

    /// Refreshes the token regardless of its freshness.
    ///
    /// If a refresh is already in progress its result is returned instead.
    pub(crate) async fn refresh(&self) -> Result<AccessToken> {
        let refresh = {
            let mut state = lock(&self.state);
            self.join_or_start_refresh(&mut state)
        };
        refresh.await
    }

    pub(crate) fn add_change_listener(&self, listener: ChangeListener) {
        lock(&self.listeners).push(listener);
    }

    // Must be called with the state lock held, this closes the window between
    // checking for a refresh and starting a new one.
    fn join_or_start_refresh(&self, state: &mut State) -> RefreshFuture {
        if let Some(refresh) = &state.in_flight {
            return refresh.clone();
        }
        let inner = self.inner.clone();
        let shared_state = self.state.clone();
        let listeners = self.listeners.clone();
        let refresh = async move {
            tracing::debug!("refreshing access token");
            let result = inner.token().await;
            let notify = {
                let mut state = lock(&shared_state);
                state.in_flight = None;
                match &result {
                    Ok(token) => {
                        state.token = Some(token.clone());
                        lock(&listeners).clone()
                    }
                    Err(e) => {
                        tracing::debug!("access token refresh failed: {e}");
                        Vec::new()
                    }
                }
            };
            if let Ok(token) = &result {
                for listener in notify {
                    listener(token);
                }
            }
            result
        }
        .boxed()
        .shared();
        state.in_flight = Some(refresh.clone());
        refresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::FakeClock;
    use crate::errors::CredentialsError;
    use crate::token::tests::MockTokenProvider;
    use std::time::SystemTime;

    static TOKEN_VALID_DURATION: Duration = Duration::from_secs(3600);

    fn test_token<S: Into<String>>(token: S, expires_at: SystemTime) -> AccessToken {
        AccessToken::new(token).with_expires_at(expires_at)
    }

    #[tokio::test]
    async fn initial_token_success() {
        let expected = AccessToken::new("test-token");
        let expected_clone = expected.clone();

        let mut mock = MockTokenProvider::new();
        mock.expect_token()
            .times(1)
            .return_once(|| Ok(expected_clone));

        let cache = TokenCache::new(mock);
        let actual = cache.token().await.unwrap();
        assert_eq!(actual, expected);

        // Verify that we use the cached token instead of making a new request
        // to the mock token provider.
        let actual = cache.token().await.unwrap();
        assert_eq!(actual, expected);
        assert_eq!(cache.cached(), Some(expected));
    }

    #[tokio::test]
    async fn initial_token_failure() {
        let mut mock = MockTokenProvider::new();
        mock.expect_token()
            .times(2)
            .returning(|| Err(CredentialsError::from_msg(false, "fail")));

        let cache = TokenCache::new(mock);
        assert!(cache.token().await.is_err());
        assert!(cache.cached().is_none());

        // Verify that a new request is made to the mock token provider when we
        // don't have a valid token.
        assert!(cache.token().await.is_err());
    }

    #[tokio::test]
    async fn stale_token_is_refreshed_before_expiration() {
        let now = SystemTime::now();
        let clock = FakeClock::new(now);

        let initial = test_token("initial-token", now + TOKEN_VALID_DURATION);
        let initial_clone = initial.clone();
        let refresh = test_token("refresh-token", now + 2 * TOKEN_VALID_DURATION);
        let refresh_clone = refresh.clone();

        let mut seq = mockall::Sequence::new();
        let mut mock = MockTokenProvider::new();
        mock.expect_token()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|| Ok(initial_clone));
        mock.expect_token()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|| Ok(refresh_clone));

        let cache = TokenCache::new(mock).with_clock(Arc::new(clock.clone()));
        assert_eq!(cache.token().await.unwrap(), initial);

        // Still outside the refresh margin.
        clock.advance(TOKEN_VALID_DURATION - DEFAULT_REFRESH_MARGIN - Duration::from_secs(1));
        assert_eq!(cache.token().await.unwrap(), initial);

        // Inside the refresh margin, the token is stale even if not expired.
        clock.advance(Duration::from_secs(2));
        assert!(cache.cached().is_none());
        assert_eq!(cache.token().await.unwrap(), refresh);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_last_token() {
        let now = SystemTime::now();
        let clock = FakeClock::new(now);

        let initial = test_token("initial-token", now + TOKEN_VALID_DURATION);
        let initial_clone = initial.clone();

        let mut seq = mockall::Sequence::new();
        let mut mock = MockTokenProvider::new();
        mock.expect_token()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|| Ok(initial_clone));
        mock.expect_token()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|| Err(CredentialsError::from_msg(true, "fail")));

        let cache = TokenCache::new(mock).with_clock(Arc::new(clock.clone()));
        assert_eq!(cache.token().await.unwrap(), initial);

        clock.advance(TOKEN_VALID_DURATION);

        // make sure we return the error, not the expired token
        let err = cache.token().await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");

        // ... and that the last known-good token is still stored.
        let stored = lock(&cache.state).token.clone();
        assert_eq!(stored, Some(initial));
    }

    #[tokio::test]
    async fn forced_refresh_ignores_freshness() {
        let first = AccessToken::new("first");
        let second = AccessToken::new("second");
        let (first_clone, second_clone) = (first.clone(), second.clone());

        let mut seq = mockall::Sequence::new();
        let mut mock = MockTokenProvider::new();
        mock.expect_token()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|| Ok(first_clone));
        mock.expect_token()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|| Ok(second_clone));

        let cache = TokenCache::new(mock);
        assert_eq!(cache.token().await.unwrap(), first);
        assert_eq!(cache.refresh().await.unwrap(), second);
        assert_eq!(cache.token().await.unwrap(), second);
    }

    #[tokio::test]
    async fn listeners_notified_in_order_once_per_refresh() {
        let mut mock = MockTokenProvider::new();
        mock.expect_token()
            .times(2)
            .returning(|| Ok(AccessToken::new("new-token")));

        let cache = TokenCache::new(mock);
        let calls = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let calls = calls.clone();
            cache.add_change_listener(Arc::new(move |t: &AccessToken| {
                calls.lock().unwrap().push(format!("{name}:{}", t.token));
            }));
        }

        cache.token().await.unwrap();
        // The listeners run before the refreshing call returns.
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["a:new-token", "b:new-token", "c:new-token"]
        );

        // A cache hit does not notify.
        cache.token().await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 3);

        cache.refresh().await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn listeners_not_notified_on_failure() {
        let mut mock = MockTokenProvider::new();
        mock.expect_token()
            .times(1)
            .returning(|| Err(CredentialsError::from_msg(false, "fail")));

        let cache = TokenCache::new(mock);
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        cache.add_change_listener(Arc::new(move |_: &AccessToken| {
            *counter.lock().unwrap() += 1;
        }));

        assert!(cache.token().await.is_err());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[derive(Clone, Debug)]
    struct FakeTokenProvider {
        result: Result<AccessToken>,
        calls: Arc<std::sync::Mutex<i32>>,
    }

    impl FakeTokenProvider {
        pub fn new(result: Result<AccessToken>) -> Self {
            FakeTokenProvider {
                result,
                calls: Arc::new(Mutex::new(0)),
            }
        }

        pub fn calls(&self) -> i32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl TokenProvider for FakeTokenProvider {
        async fn token(&self) -> Result<AccessToken> {
            // Release a token periodically. We give enough time for the
            // waiters in a thundering herd to pile up.
            tokio::time::sleep(Duration::from_millis(50)).await;

            // Track how many calls were made to the inner token provider.
            *self.calls.lock().unwrap() += 1;

            // Return the result.
            self.result.clone()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn initial_token_thundering_herd_success() {
        let token = test_token("initial-token", SystemTime::now() + TOKEN_VALID_DURATION);

        let tp = FakeTokenProvider::new(Ok(token.clone()));

        let cache = TokenCache::new(tp.clone());

        // Spawn N tasks, all asking for a token at once.
        let tasks = (0..100)
            .map(|_| {
                let cache_clone = cache.clone();
                tokio::spawn(async move { cache_clone.token().await })
            })
            .collect::<Vec<_>>();

        // Wait for the N token requests to complete, verifying the returned token.
        for task in tasks {
            let actual = task.await.unwrap();
            assert!(actual.is_ok(), "{}", actual.err().unwrap());
            assert_eq!(actual.unwrap(), token);
        }

        // Callers either join the single refresh or find the fresh token it
        // stored.
        assert_eq!(tp.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn initial_token_thundering_herd_failure_shares_error() {
        let err = Err(CredentialsError::from_msg(false, "epic fail"));

        let tp = FakeTokenProvider::new(err);

        let cache = TokenCache::new(tp.clone());

        // Spawn N tasks, all asking for a token at once.
        let tasks = (0..100)
            .map(|_| {
                let cache_clone = cache.clone();
                tokio::spawn(async move { cache_clone.token().await })
            })
            .collect::<Vec<_>>();

        // Wait for the N token requests to complete, verifying the returned error.
        for task in tasks {
            let actual = task.await.unwrap();
            assert!(actual.is_err(), "{:?}", actual.unwrap());
            let e = format!("{}", actual.err().unwrap());
            assert!(e.contains("epic fail"), "{e}");
        }

        // Given the N requests to the token cache, we expect that not all N
        // requests were passed along to the inner token provider. The
        // expectation is loose, to avoid races between spawning the tasks and
        // executing the first line of code in the task. In most cases, there
        // should be 1 call to the inner token provider.
        let calls = tp.calls();
        assert!(calls < 100, "{calls}");
    }

    #[tokio::test(start_paused = true)]
    async fn forced_refresh_joins_refresh_in_progress() {
        let tp = FakeTokenProvider::new(Ok(AccessToken::new("token")));
        let cache = TokenCache::new(tp.clone());

        let (a, b) = tokio::join!(cache.token(), cache.refresh());
        assert_eq!(a.unwrap(), AccessToken::new("token"));
        assert_eq!(b.unwrap(), AccessToken::new("token"));
        assert_eq!(tp.calls(), 1);
    }
}
