use serde_json::{Value, json};
use thiserror::Error;

use crate::config::Config;
use crate::http::{HttpError, RetryPolicy, post_json_with_retries};

#[derive(Debug, Error)]
pub(crate) enum TrackerError {
    #[error("tracking is disabled or no tracker token is configured")]
    Disabled,
    #[error("tracker rejected the access token")]
    Unauthorized,
    #[error("tracker request failed: {0}")]
    Http(#[from] HttpError),
    #[error("tracker API error: {0}")]
    Api(String),
    #[error("unexpected tracker response: {0}")]
    Decode(String),
}

/// Remote list-tracking service.
pub(crate) trait RemoteTracker: Send + Sync {
    fn is_enabled(&self) -> bool;

    fn update_progress(&self, media_ref: i64, episode: u32, fraction: f64)
    -> Result<(), TrackerError>;

    /// Episodes the service reports as watched for `media_ref`, if listed.
    fn remote_progress(&self, media_ref: i64) -> Result<Option<u32>, TrackerError>;
}

const SAVE_PROGRESS_MUTATION: &str = "mutation ($mediaId: Int, $progress: Int, $status: MediaListStatus) { SaveMediaListEntry(mediaId: $mediaId, progress: $progress, status: $status) { id progress status } }";
const LIST_ENTRY_QUERY: &str =
    "query ($mediaId: Int) { Media(id: $mediaId, type: ANIME) { id mediaListEntry { progress status } } }";

pub(crate) struct AniListTracker {
    endpoint: String,
    token: Option<String>,
    enabled: bool,
    sync_threshold: f64,
    policy: RetryPolicy,
}

impl AniListTracker {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            endpoint: config.tracker_endpoint.clone(),
            token: config
                .tracker_token
                .as_deref()
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string),
            enabled: config.tracking_enabled,
            sync_threshold: config.sync_threshold,
            policy: RetryPolicy::default(),
        }
    }

    #[cfg(test)]
    fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn post(&self, query: &str, variables: Value) -> Result<Value, TrackerError> {
        let token = self.token.as_deref().filter(|_| self.enabled);
        let Some(token) = token else {
            return Err(TrackerError::Disabled);
        };
        let body = json!({ "query": query, "variables": variables });
        let raw = post_json_with_retries(&self.endpoint, Some(token), &body, &self.policy)
            .map_err(|err| match err.status() {
                Some(401) => TrackerError::Unauthorized,
                _ => TrackerError::Http(err),
            })?;
        parse_graphql_response(&raw)
    }
}

/// Progress value written for a unit: the unit itself once it counts as
/// watched, otherwise the one before it.
pub(crate) fn progress_for_fraction(episode: u32, fraction: f64, threshold: f64) -> u32 {
    if fraction >= threshold {
        episode
    } else {
        episode.saturating_sub(1)
    }
}

pub(crate) fn parse_graphql_response(raw: &str) -> Result<Value, TrackerError> {
    let parsed: Value =
        serde_json::from_str(raw).map_err(|err| TrackerError::Decode(err.to_string()))?;
    if let Some(errors) = parsed.get("errors").and_then(Value::as_array)
        && !errors.is_empty()
    {
        let message = errors
            .iter()
            .filter_map(|error| error.get("message").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(TrackerError::Api(if message.is_empty() {
            "unknown error".to_string()
        } else {
            message
        }));
    }
    parsed
        .get("data")
        .cloned()
        .ok_or_else(|| TrackerError::Decode("missing data field".to_string()))
}

impl RemoteTracker for AniListTracker {
    fn is_enabled(&self) -> bool {
        self.enabled && self.token.is_some()
    }

    fn update_progress(
        &self,
        media_ref: i64,
        episode: u32,
        fraction: f64,
    ) -> Result<(), TrackerError> {
        let progress = progress_for_fraction(episode, fraction, self.sync_threshold);
        // A replayed partial item must not move the list entry backwards.
        if let Some(remote) = self.remote_progress(media_ref)?
            && remote >= progress
        {
            log::debug!(
                "tracker progress for media {media_ref} already at {remote}; not writing {progress}"
            );
            return Ok(());
        }
        let data = self.post(
            SAVE_PROGRESS_MUTATION,
            json!({ "mediaId": media_ref, "progress": progress, "status": "CURRENT" }),
        )?;
        if data.pointer("/SaveMediaListEntry/id").is_none() {
            return Err(TrackerError::Decode(
                "SaveMediaListEntry returned no entry".to_string(),
            ));
        }
        log::info!("tracker progress for media {media_ref} set to {progress}");
        Ok(())
    }

    fn remote_progress(&self, media_ref: i64) -> Result<Option<u32>, TrackerError> {
        let data = self.post(LIST_ENTRY_QUERY, json!({ "mediaId": media_ref }))?;
        Ok(data
            .pointer("/Media/mediaListEntry/progress")
            .and_then(Value::as_u64)
            .and_then(|progress| u32::try_from(progress).ok()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::sync::{SyncDecision, SyncQueue};
    use super::*;
    use crate::db::Database;
    use crate::http::test_server::{Behavior, TestServer};

    fn tracker(base_url: &str, token: Option<&str>) -> AniListTracker {
        let config = Config {
            tracker_endpoint: base_url.to_string(),
            tracker_token: token.map(str::to_string),
            ..Config::default()
        };
        AniListTracker::from_config(&config).with_policy(RetryPolicy {
            connect_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_millis(200),
            attempts: 1,
            retry_delay: Duration::from_millis(1),
        })
    }

    fn list_entry(media_ref: i64, progress: Option<u32>) -> String {
        let entry = match progress {
            Some(progress) => json!({ "progress": progress, "status": "CURRENT" }),
            None => Value::Null,
        };
        json!({ "data": { "Media": { "id": media_ref, "mediaListEntry": entry } } }).to_string()
    }

    fn saved_entry(progress: u32) -> String {
        json!({ "data": { "SaveMediaListEntry": { "id": 9, "progress": progress, "status": "CURRENT" } } })
            .to_string()
    }

    fn written_progress(bodies: &[String]) -> Vec<u64> {
        bodies
            .iter()
            .map(|body| serde_json::from_str::<Value>(body).expect("json"))
            .filter(|body| {
                body["query"]
                    .as_str()
                    .is_some_and(|query| query.contains("SaveMediaListEntry"))
            })
            .filter_map(|body| body.pointer("/variables/progress").and_then(Value::as_u64))
            .collect()
    }

    #[test]
    fn progress_stays_one_behind_until_threshold() {
        assert_eq!(progress_for_fraction(5, 0.95, 0.85), 5);
        assert_eq!(progress_for_fraction(5, 0.85, 0.85), 5);
        assert_eq!(progress_for_fraction(5, 0.6, 0.85), 4);
        assert_eq!(progress_for_fraction(0, 0.1, 0.85), 0);
    }

    #[test]
    fn graphql_errors_become_api_errors() {
        let err = parse_graphql_response(r#"{"errors":[{"message":"Invalid token"}],"data":null}"#)
            .expect_err("errors should fail");
        assert!(matches!(err, TrackerError::Api(ref msg) if msg == "Invalid token"));
    }

    #[test]
    fn missing_token_disables_tracker_without_network() {
        let server = TestServer::spawn(Vec::new());
        let tracker = tracker(&server.base_url, None);
        assert!(!tracker.is_enabled());
        assert!(matches!(
            tracker.update_progress(1, 1, 1.0),
            Err(TrackerError::Disabled)
        ));
        assert_eq!(server.request_count(), 0);
    }

    #[test]
    fn update_progress_posts_mutation() {
        let server = TestServer::spawn(vec![
            Behavior::Respond(200, list_entry(21, Some(3))),
            Behavior::Respond(200, saved_entry(4)),
        ]);
        let tracker = tracker(&server.base_url, Some("tok"));

        tracker.update_progress(21, 5, 0.6).expect("update");

        let bodies = server.bodies();
        assert_eq!(bodies.len(), 2);
        let sent: Value = serde_json::from_str(&bodies[1]).expect("json");
        assert_eq!(sent.pointer("/variables/mediaId"), Some(&json!(21)));
        assert_eq!(sent.pointer("/variables/progress"), Some(&json!(4)));
    }

    #[test]
    fn update_never_lowers_remote_progress() {
        let server = TestServer::spawn(vec![Behavior::Respond(200, list_entry(21, Some(5)))]);
        let tracker = tracker(&server.base_url, Some("tok"));

        tracker.update_progress(21, 5, 0.6).expect("update");

        assert_eq!(server.request_count(), 1);
        assert!(written_progress(&server.bodies()).is_empty());
    }

    #[test]
    fn stale_queued_progress_does_not_roll_back_completed_episode() {
        let server = TestServer::spawn(vec![
            Behavior::Respond(200, list_entry(42, Some(4))),
            Behavior::Respond(200, saved_entry(5)),
            Behavior::Respond(200, list_entry(42, Some(5))),
        ]);
        let tracker = tracker(&server.base_url, Some("tok"));
        let db = Database::open_in_memory().expect("db");
        let queue = SyncQueue::new(&db, &tracker, 0.85, 100);

        assert_eq!(queue.sync_or_queue(42, 5, 0.60).expect("queue"), SyncDecision::Queued);
        assert_eq!(queue.sync_or_queue(42, 5, 1.0).expect("sync"), SyncDecision::Synced);
        let report = queue.drain(|| false).expect("drain");

        assert_eq!(report.synced, 1);
        assert_eq!(written_progress(&server.bodies()), vec![5]);
        assert!(db.unsynced_items(100).expect("pending").is_empty());
    }

    #[test]
    fn unauthorized_status_is_reported_distinctly() {
        let server = TestServer::spawn(vec![Behavior::Respond(401, "{}".to_string())]);
        let tracker = tracker(&server.base_url, Some("expired"));
        assert!(matches!(
            tracker.update_progress(21, 5, 1.0),
            Err(TrackerError::Unauthorized)
        ));
    }

    #[test]
    fn remote_progress_reads_list_entry() {
        let server = TestServer::spawn(vec![
            Behavior::Respond(
                200,
                r#"{"data":{"Media":{"id":21,"mediaListEntry":{"progress":7,"status":"CURRENT"}}}}"#
                    .to_string(),
            ),
            Behavior::Respond(200, r#"{"data":{"Media":{"id":22,"mediaListEntry":null}}}"#.to_string()),
        ]);
        let tracker = tracker(&server.base_url, Some("tok"));
        assert_eq!(tracker.remote_progress(21).expect("progress"), Some(7));
        assert_eq!(tracker.remote_progress(22).expect("progress"), None);
    }
}
