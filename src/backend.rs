//! HTTP collaborator seam: profile lookup and best-effort score submission.
//!
//! [`BackendApi`] is what the profile resolver and the driver consume.
//! [`HttpBackend`] (feature `http-backend`) talks to the match server's
//! REST endpoints:
//!
//! - `GET  {base}/users/{username}` returns a [`UserProfile`]
//! - `POST {base}/bot/score` takes a [`ScoreSubmission`]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MatchError;
use crate::profile::UserProfile;

/// Body of a score submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSubmission {
    /// Platform message the score is attached to, when launched from one.
    pub client_inline_message_id: Option<String>,
    pub user_id: i64,
    pub score: u32,
}

/// Remote profile and score storage.
#[async_trait]
pub trait BackendApi: Send + Sync + 'static {
    /// Fetch a profile by username. `Ok(None)` when the user does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::Http`] on network or decoding failure.
    async fn fetch_profile(&self, username: &str) -> Result<Option<UserProfile>, MatchError>;

    /// Persist a final score.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::Http`] on network failure or a non-success status.
    async fn submit_score(&self, submission: &ScoreSubmission) -> Result<(), MatchError>;
}

#[cfg(feature = "http-backend")]
pub use http::HttpBackend;

#[cfg(feature = "http-backend")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use tracing::debug;
    use url::Url;

    use super::{BackendApi, ScoreSubmission};
    use crate::error::MatchError;
    use crate::profile::UserProfile;

    const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// [`BackendApi`] over HTTP using `reqwest`.
    #[derive(Debug, Clone)]
    pub struct HttpBackend {
        base: Url,
        client: reqwest::Client,
    }

    impl HttpBackend {
        /// Create a backend rooted at `base_url` (for example `https://api.example.com/`).
        ///
        /// # Errors
        ///
        /// Returns [`MatchError::InvalidUrl`] if `base_url` does not parse or
        /// cannot be a base, and [`MatchError::Http`] if the client cannot be built.
        pub fn new(base_url: &str) -> Result<Self, MatchError> {
            Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
        }

        /// Like [`new`](Self::new) with a custom per-request timeout.
        ///
        /// # Errors
        ///
        /// See [`new`](Self::new).
        pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, MatchError> {
            let mut base =
                Url::parse(base_url).map_err(|e| MatchError::InvalidUrl(format!("{base_url}: {e}")))?;
            if base.cannot_be_a_base() {
                return Err(MatchError::InvalidUrl(format!("{base_url}: not a base url")));
            }
            // Ensure joins append instead of replacing the last segment.
            if !base.path().ends_with('/') {
                let path = format!("{}/", base.path());
                base.set_path(&path);
            }
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| MatchError::Http(e.to_string()))?;
            Ok(Self { base, client })
        }

        /// Derive the REST base from a WebSocket server URL
        /// (`ws://host/ws` becomes `http://host/`).
        ///
        /// # Errors
        ///
        /// See [`new`](Self::new).
        pub fn from_server_url(server_url: &str) -> Result<Self, MatchError> {
            let mut url = Url::parse(server_url)
                .map_err(|e| MatchError::InvalidUrl(format!("{server_url}: {e}")))?;
            let scheme = match url.scheme() {
                "ws" => "http",
                "wss" => "https",
                other => other,
            }
            .to_string();
            url.set_scheme(&scheme)
                .map_err(|()| MatchError::InvalidUrl(format!("{server_url}: bad scheme")))?;
            url.set_path("/");
            url.set_query(None);
            url.set_fragment(None);
            Self::new(url.as_str())
        }

        pub fn base_url(&self) -> &Url {
            &self.base
        }

        fn profile_url(&self, username: &str) -> Result<Url, MatchError> {
            let mut url = self.base.clone();
            url.path_segments_mut()
                .map_err(|()| MatchError::InvalidUrl(self.base.to_string()))?
                .pop_if_empty()
                .extend(["users", username]);
            Ok(url)
        }

        fn score_url(&self) -> Result<Url, MatchError> {
            self.base
                .join("bot/score")
                .map_err(|e| MatchError::InvalidUrl(e.to_string()))
        }
    }

    #[async_trait]
    impl BackendApi for HttpBackend {
        async fn fetch_profile(&self, username: &str) -> Result<Option<UserProfile>, MatchError> {
            let url = self.profile_url(username)?;
            debug!(%url, "fetching profile");
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| MatchError::Http(e.to_string()))?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let response = response
                .error_for_status()
                .map_err(|e| MatchError::Http(e.to_string()))?;

            // The server answers `null` for unknown users on some deployments.
            response
                .json::<Option<UserProfile>>()
                .await
                .map_err(|e| MatchError::Http(e.to_string()))
        }

        async fn submit_score(&self, submission: &ScoreSubmission) -> Result<(), MatchError> {
            let url = self.score_url()?;
            debug!(%url, user_id = submission.user_id, score = submission.score, "submitting score");
            self.client
                .post(url)
                .json(submission)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| MatchError::Http(e.to_string()))?;
            Ok(())
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    mod tests {
        use super::*;

        #[test]
        fn profile_url_escapes_username() {
            let backend = HttpBackend::new("http://localhost:3000").unwrap();
            let url = backend.profile_url("bob smith").unwrap();
            assert_eq!(url.as_str(), "http://localhost:3000/users/bob%20smith");
        }

        #[test]
        fn score_url_appends_to_base_path() {
            let backend = HttpBackend::new("https://api.example.com/v1").unwrap();
            assert_eq!(
                backend.score_url().unwrap().as_str(),
                "https://api.example.com/v1/bot/score"
            );
        }

        #[test]
        fn server_url_maps_to_http_base() {
            let backend = HttpBackend::from_server_url("wss://rps.example.com/ws?x=1").unwrap();
            assert_eq!(backend.base_url().as_str(), "https://rps.example.com/");
        }

        #[test]
        fn invalid_base_is_rejected() {
            let err = HttpBackend::new("not a url").unwrap_err();
            assert!(matches!(err, MatchError::InvalidUrl(_)));
        }

        #[tokio::test]
        async fn unreachable_server_is_http_error() {
            let backend =
                HttpBackend::with_timeout("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
            let err = backend.fetch_profile("alice").await.unwrap_err();
            assert!(matches!(err, MatchError::Http(_)));
        }
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

    #[test]
    fn score_submission_uses_camel_case() {
        let body = ScoreSubmission {
            client_inline_message_id: Some("inline-7".into()),
            user_id: 42,
            score: 3,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["clientInlineMessageId"], "inline-7");
        assert_eq!(value["userId"], 42);
        assert_eq!(value["score"], 3);
    }
}
