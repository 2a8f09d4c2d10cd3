//! Profile resolution and caching.
//!
//! [`ProfileResolver`] keeps fetched [`UserProfile`]s keyed by username and
//! remembers which username currently fills the local and opponent roles.
//! Coin balances shown in the UI are optimistic: round results apply a
//! delta locally, and the next fetch of the same profile overwrites it with
//! the server's balance.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::BackendApi;
use crate::error::MatchError;
use crate::session::ProfileRole;

/// A player profile as served by `GET /users/{username}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(rename = "_id", default)]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub coins: i64,
    #[serde(default)]
    pub tickets: i64,
    /// Match history entries, passed through untouched.
    #[serde(default)]
    pub matches: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(rename = "__v", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// Outcome of a background profile fetch.
#[derive(Debug)]
pub struct ProfileFetch {
    pub username: String,
    pub role: ProfileRole,
    pub result: Result<Option<UserProfile>, MatchError>,
}

/// Fetch `username` through `backend`, tagging the result with its role.
///
/// Suitable for `tokio::spawn`; the caller feeds the result back through
/// [`ProfileResolver::complete`].
pub async fn fetch_profile<A: BackendApi>(
    backend: Arc<A>,
    username: String,
    role: ProfileRole,
) -> ProfileFetch {
    let result = backend.fetch_profile(&username).await;
    ProfileFetch {
        username,
        role,
        result,
    }
}

/// Cache of profiles plus the current user and opponent assignment.
pub struct ProfileResolver<A> {
    backend: Arc<A>,
    cache: HashMap<String, UserProfile>,
    user: Option<String>,
    opponent: Option<String>,
}

impl<A: BackendApi> ProfileResolver<A> {
    pub fn new(backend: Arc<A>) -> Self {
        Self {
            backend,
            cache: HashMap::new(),
            user: None,
            opponent: None,
        }
    }

    /// Shared handle to the backend, for spawning fetches.
    pub fn backend(&self) -> Arc<A> {
        Arc::clone(&self.backend)
    }

    /// Cached profile of the local player, if known.
    pub fn user(&self) -> Option<&UserProfile> {
        self.user.as_ref().and_then(|name| self.cache.get(name))
    }

    /// Cached profile of the current opponent, if known.
    pub fn opponent(&self) -> Option<&UserProfile> {
        self.opponent.as_ref().and_then(|name| self.cache.get(name))
    }

    pub fn cached(&self, username: &str) -> Option<&UserProfile> {
        self.cache.get(username)
    }

    /// Point `role` at `username`. Called when a fetch is requested so that a
    /// late answer for a previous opponent never fills the current slot.
    pub fn assign(&mut self, username: &str, role: ProfileRole) {
        let slot = match role {
            ProfileRole::User => &mut self.user,
            ProfileRole::Opponent => &mut self.opponent,
        };
        *slot = Some(username.to_string());
    }

    /// Store the result of a background fetch. Returns `true` if the cache changed.
    ///
    /// A fresh profile replaces any optimistic balance held for the same user.
    pub fn complete(&mut self, fetch: ProfileFetch) -> bool {
        match fetch.result {
            Ok(Some(profile)) => {
                debug!(username = %fetch.username, role = ?fetch.role, coins = profile.coins, "profile resolved");
                self.cache.insert(fetch.username, profile);
                true
            }
            Ok(None) => {
                debug!(username = %fetch.username, "no profile on server");
                self.cache.remove(&fetch.username).is_some()
            }
            Err(e) => {
                warn!(username = %fetch.username, "profile fetch failed: {e}");
                false
            }
        }
    }

    /// Fetch `username` now and cache it under `role`.
    ///
    /// # Errors
    ///
    /// Propagates the backend error; the cache is left untouched.
    pub async fn resolve(
        &mut self,
        username: &str,
        role: ProfileRole,
    ) -> Result<Option<&UserProfile>, MatchError> {
        self.assign(username, role);
        let result = self.backend.fetch_profile(username).await?;
        self.complete(ProfileFetch {
            username: username.to_string(),
            role,
            result: Ok(result),
        });
        Ok(self.cache.get(username))
    }

    /// Apply an optimistic coin delta to the local player's cached profile.
    ///
    /// Returns the new balance, or `None` if no local profile is cached.
    /// Balances never go below zero.
    pub fn apply_coin_delta(&mut self, delta: i64) -> Option<i64> {
        let name = self.user.as_ref()?;
        let profile = self.cache.get_mut(name)?;
        profile.coins = profile.coins.saturating_add(delta).max(0);
        Some(profile.coins)
    }

    /// Forget the opponent assignment (the cached profile stays).
    pub fn clear_opponent(&mut self) {
        self.opponent = None;
    }
}

impl<A> std::fmt::Debug for ProfileResolver<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileResolver")
            .field("cached", &self.cache.len())
            .field("user", &self.user)
            .field("opponent", &self.opponent)
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::backend::ScoreSubmission;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubBackend {
        profiles: Mutex<HashMap<String, UserProfile>>,
        lookups: Mutex<Vec<String>>,
    }

    impl StubBackend {
        fn with(profiles: &[(&str, i64)]) -> Arc<Self> {
            let backend = Self::default();
            for (name, coins) in profiles {
                backend.profiles.lock().unwrap().insert(
                    (*name).to_string(),
                    UserProfile {
                        username: (*name).to_string(),
                        coins: *coins,
                        ..UserProfile::default()
                    },
                );
            }
            Arc::new(backend)
        }
    }

    #[async_trait]
    impl BackendApi for StubBackend {
        async fn fetch_profile(&self, username: &str) -> Result<Option<UserProfile>, MatchError> {
            self.lookups.lock().unwrap().push(username.to_string());
            Ok(self.profiles.lock().unwrap().get(username).cloned())
        }

        async fn submit_score(&self, _submission: &ScoreSubmission) -> Result<(), MatchError> {
            Ok(())
        }
    }

    #[test]
    fn profile_decodes_server_document() {
        let json = r#"{
            "_id": "665f1c",
            "username": "alice",
            "tickets": 3,
            "coins": 120,
            "createdAt": "2024-05-01T00:00:00Z",
            "updatedAt": "2024-05-02T00:00:00Z",
            "__v": 0,
            "matches": [{"opponent": "bob", "result": "win"}]
        }"#;
        let profile: UserProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.id, "665f1c");
        assert_eq!(profile.coins, 120);
        assert_eq!(profile.tickets, 3);
        assert_eq!(profile.version, Some(0));
        assert_eq!(profile.matches.len(), 1);
        assert_eq!(profile.matches[0]["opponent"], "bob");
    }

    #[tokio::test]
    async fn resolve_caches_by_role() {
        let backend = StubBackend::with(&[("alice", 100), ("bob", 50)]);
        let mut resolver = ProfileResolver::new(Arc::clone(&backend));

        resolver.resolve("alice", ProfileRole::User).await.unwrap();
        resolver.resolve("bob", ProfileRole::Opponent).await.unwrap();

        assert_eq!(resolver.user().unwrap().coins, 100);
        assert_eq!(resolver.opponent().unwrap().username, "bob");
        assert_eq!(backend.lookups.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn coin_delta_is_optimistic_until_refetched() {
        let backend = StubBackend::with(&[("alice", 100)]);
        let mut resolver = ProfileResolver::new(Arc::clone(&backend));
        resolver.resolve("alice", ProfileRole::User).await.unwrap();

        assert_eq!(resolver.apply_coin_delta(10), Some(110));
        assert_eq!(resolver.apply_coin_delta(-500), Some(0));

        // The server's balance wins on the next fetch.
        let fetch = fetch_profile(resolver.backend(), "alice".into(), ProfileRole::User).await;
        assert!(resolver.complete(fetch));
        assert_eq!(resolver.user().unwrap().coins, 100);
    }

    #[test]
    fn coin_delta_without_profile_is_none() {
        let mut resolver = ProfileResolver::new(StubBackend::with(&[]));
        assert_eq!(resolver.apply_coin_delta(10), None);
    }

    #[tokio::test]
    async fn late_fetch_does_not_replace_current_opponent() {
        let backend = StubBackend::with(&[("bob", 1), ("carol", 2)]);
        let mut resolver = ProfileResolver::new(Arc::clone(&backend));

        resolver.assign("bob", ProfileRole::Opponent);
        let bob = fetch_profile(resolver.backend(), "bob".into(), ProfileRole::Opponent);
        resolver.assign("carol", ProfileRole::Opponent);
        let carol = fetch_profile(resolver.backend(), "carol".into(), ProfileRole::Opponent).await;
        resolver.complete(carol);
        resolver.complete(bob.await);

        assert_eq!(resolver.opponent().unwrap().username, "carol");
        assert!(resolver.cached("bob").is_some());
    }

    #[tokio::test]
    async fn failed_fetch_keeps_cache() {
        let mut resolver = ProfileResolver::new(StubBackend::with(&[("alice", 7)]));
        resolver.resolve("alice", ProfileRole::User).await.unwrap();

        let changed = resolver.complete(ProfileFetch {
            username: "alice".into(),
            role: ProfileRole::User,
            result: Err(MatchError::Http("503".into())),
        });
        assert!(!changed);
        assert_eq!(resolver.user().unwrap().coins, 7);
    }
}
