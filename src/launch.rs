//! Launch-context identity.
//!
//! When the client is opened from the messaging platform, the location
//! fragment carries `tgWebAppData=<form-encoded>`, whose `user` field is a
//! JSON object describing the player. That identity takes precedence over a
//! typed username.

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::error::MatchError;
use crate::session::StartParams;

const LAUNCH_DATA_KEY: &str = "tgWebAppData";
const USER_KEY: &str = "user";

/// The player described by the launch context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchUser {
    pub id: i64,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}

impl LaunchUser {
    /// Decode the user from a location fragment (with or without the leading `#`).
    ///
    /// Returns `Ok(None)` when the fragment carries no launch data or no user.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::LaunchContext`] if the `user` field is present
    /// but is not valid JSON of the expected shape.
    pub fn from_fragment(fragment: &str) -> Result<Option<Self>, MatchError> {
        let fragment = fragment.strip_prefix('#').unwrap_or(fragment);
        let Some(data) = form_value(fragment.as_bytes(), LAUNCH_DATA_KEY) else {
            return Ok(None);
        };
        let Some(user) = form_value(data.as_bytes(), USER_KEY) else {
            return Ok(None);
        };
        serde_json::from_str(&user)
            .map(Some)
            .map_err(|e| MatchError::LaunchContext(format!("user field: {e}")))
    }

    /// Platform username, if set and not blank.
    pub fn handle(&self) -> Option<&str> {
        self.username
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// `first_name last_name`, for display.
    pub fn display_name(&self) -> String {
        match &self.last_name {
            Some(last) if !last.is_empty() => format!("{} {last}", self.first_name),
            _ => self.first_name.clone(),
        }
    }
}

fn form_value(input: &[u8], key: &str) -> Option<String> {
    form_urlencoded::parse(input)
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Pick the username to play under.
///
/// The launch username wins over a typed one. Blank results are rejected.
pub fn resolve_username(launch: Option<&LaunchUser>, typed: &str) -> Option<String> {
    launch
        .and_then(LaunchUser::handle)
        .or_else(|| Some(typed.trim()).filter(|name| !name.is_empty()))
        .map(str::to_string)
}

/// Build [`StartParams`] from the launch user and a typed fallback.
///
/// Returns `None` when no usable username is available.
pub fn start_params(launch: Option<&LaunchUser>, typed: &str) -> Option<StartParams> {
    let username = resolve_username(launch, typed)?;
    let params = StartParams::new(username);
    Some(match launch {
        Some(user) => params.with_user_id(user.id),
        None => params,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn fragment_for(user_json: &str) -> String {
        let inner: String = form_urlencoded::Serializer::new(String::new())
            .append_pair("query_id", "AAH")
            .append_pair("user", user_json)
            .append_pair("auth_date", "1717000000")
            .finish();
        let outer: String = form_urlencoded::Serializer::new(String::new())
            .append_pair("tgWebAppData", &inner)
            .append_pair("tgWebAppVersion", "6.2")
            .finish();
        format!("#{outer}")
    }

    #[test]
    fn decodes_user_from_fragment() {
        let fragment = fragment_for(
            r#"{"id":212307244,"first_name":"Ada","last_name":"L","username":"ada","language_code":"en"}"#,
        );
        let user = LaunchUser::from_fragment(&fragment).unwrap().unwrap();
        assert_eq!(user.id, 212_307_244);
        assert_eq!(user.handle(), Some("ada"));
        assert_eq!(user.display_name(), "Ada L");
        assert_eq!(user.language_code.as_deref(), Some("en"));
    }

    #[test]
    fn missing_launch_data_is_none() {
        assert!(LaunchUser::from_fragment("").unwrap().is_none());
        assert!(LaunchUser::from_fragment("#tgWebAppVersion=6.2")
            .unwrap()
            .is_none());
    }

    #[test]
    fn malformed_user_is_an_error() {
        let fragment = fragment_for("{not json");
        let err = LaunchUser::from_fragment(&fragment).unwrap_err();
        assert!(matches!(err, MatchError::LaunchContext(_)));
    }

    #[test]
    fn launch_username_wins_over_typed() {
        let user = LaunchUser {
            id: 7,
            first_name: "Ada".into(),
            last_name: None,
            username: Some("ada".into()),
            language_code: None,
        };
        assert_eq!(resolve_username(Some(&user), "bob").as_deref(), Some("ada"));
        assert_eq!(resolve_username(None, "  bob ").as_deref(), Some("bob"));
        assert_eq!(resolve_username(None, "   "), None);

        let params = start_params(Some(&user), "").unwrap();
        assert_eq!(params.username, "ada");
        assert_eq!(params.user_id, Some(7));
    }

    #[test]
    fn launch_user_without_handle_falls_back_to_typed() {
        let user = LaunchUser {
            id: 7,
            first_name: "Ada".into(),
            last_name: None,
            username: Some(" ".into()),
            language_code: None,
        };
        let params = start_params(Some(&user), "typed").unwrap();
        assert_eq!(params.username, "typed");
        assert_eq!(params.user_id, Some(7));
    }
}
