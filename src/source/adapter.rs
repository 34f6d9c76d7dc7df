// Adapter - authenticated fetch with a single reconnect-and-retry
//
// Policy for one request:
// 1. use the session token, connecting first if there is none
// 2. on auth-expired, refresh the session once and retry the same request once
// 3. a failed reconnect or a second auth-expired fails with AuthenticationFailed
//    and clears the token it was given, unless another task already replaced it
// 4. any other failure is SourceUnavailable; the caller skips this connection

use serde_json::Value;
use tracing::{debug, warn};

use super::{Connection, FetchOutcome, SourceRequest};
use crate::metrics::CollectError;

/// Fetches one request through the connection's session.
///
/// # Returns
/// * `Ok(Value)` - Parsed response body, unmodified
/// * `Err(CollectError)` - Authentication, availability or parse failure
pub async fn fetch(connection: &Connection, request: &SourceRequest) -> Result<Value, CollectError> {
    let source = connection.source();
    let session = connection.session();

    let token = session
        .current_or_connect(source)
        .await
        .ok_or_else(|| auth_failed(connection))?;

    match source.fetch(request, &token).await {
        FetchOutcome::AuthExpired => {
            warn!(
                "Token expired for host {} on {}, re-authenticating",
                connection.host(),
                request.path
            );

            let fresh = session
                .refresh_after_expiry(source, &token)
                .await
                .ok_or_else(|| auth_failed(connection))?;

            match source.fetch(request, &fresh).await {
                FetchOutcome::AuthExpired => {
                    session.invalidate_if(&fresh).await;
                    Err(auth_failed(connection))
                }
                outcome => resolve(connection, request, outcome),
            }
        }
        outcome => resolve(connection, request, outcome),
    }
}

fn resolve(
    connection: &Connection,
    request: &SourceRequest,
    outcome: FetchOutcome,
) -> Result<Value, CollectError> {
    match outcome {
        FetchOutcome::Data(value) => {
            debug!("{} on host {} returned data", request.path, connection.host());
            Ok(value)
        }
        FetchOutcome::Failed(reason) => Err(CollectError::SourceUnavailable {
            host: connection.host().to_string(),
            reason: format!("{}: {}", request.path, reason),
        }),
        FetchOutcome::Malformed(reason) => Err(CollectError::MalformedResponse(format!(
            "{} on host {}: {}",
            request.path,
            connection.host(),
            reason
        ))),
        FetchOutcome::AuthExpired => Err(auth_failed(connection)),
    }
}

fn auth_failed(connection: &Connection) -> CollectError {
    CollectError::AuthenticationFailed {
        host: connection.host().to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::source::MetricSource;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Source that replays scripted login and fetch outcomes
    pub(crate) struct ScriptedSource {
        logins: Mutex<VecDeque<Option<String>>>,
        outcomes: Mutex<VecDeque<FetchOutcome>>,
        pub login_calls: AtomicUsize,
        pub fetch_calls: AtomicUsize,
        pub tokens_seen: Mutex<Vec<String>>,
    }

    impl ScriptedSource {
        pub(crate) fn new(logins: Vec<Option<&str>>, outcomes: Vec<FetchOutcome>) -> Self {
            ScriptedSource {
                logins: Mutex::new(logins.into_iter().map(|t| t.map(str::to_string)).collect()),
                outcomes: Mutex::new(outcomes.into()),
                login_calls: AtomicUsize::new(0),
                fetch_calls: AtomicUsize::new(0),
                tokens_seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MetricSource for ScriptedSource {
        async fn authenticate(&self) -> Option<String> {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            self.logins.lock().unwrap().pop_front().flatten()
        }

        async fn fetch(&self, _request: &SourceRequest, token: &str) -> FetchOutcome {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.tokens_seen.lock().unwrap().push(token.to_string());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| FetchOutcome::Failed("script exhausted".to_string()))
        }
    }

    pub(crate) fn connection_with(source: Arc<ScriptedSource>) -> Connection {
        Connection::new(ConnectionSettings::for_host("ecs1.example.com"), source)
    }

    #[tokio::test]
    async fn test_returns_data_after_initial_connect() {
        let source = Arc::new(ScriptedSource::new(
            vec![Some("t1")],
            vec![FetchOutcome::Data(json!({"a": 1}))],
        ));
        let connection = connection_with(source.clone());

        let value = fetch(&connection, &SourceRequest::new("/x")).await.unwrap();

        assert_eq!(value, json!({"a": 1}));
        assert_eq!(source.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_expired_reconnects_and_retries_once() {
        let source = Arc::new(ScriptedSource::new(
            vec![Some("t1"), Some("t2")],
            vec![FetchOutcome::AuthExpired, FetchOutcome::Data(json!({"ok": true}))],
        ));
        let connection = connection_with(source.clone());

        let value = fetch(&connection, &SourceRequest::new("/x")).await.unwrap();

        assert_eq!(value, json!({"ok": true}));
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 2);
        assert_eq!(*source.tokens_seen.lock().unwrap(), vec!["t1", "t2"]);
        assert_eq!(connection.session().token().await.as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn test_failed_reconnect_is_authentication_failure() {
        let source = Arc::new(ScriptedSource::new(
            vec![Some("t1"), None],
            vec![FetchOutcome::AuthExpired],
        ));
        let connection = connection_with(source.clone());

        let result = fetch(&connection, &SourceRequest::new("/x")).await;

        assert!(matches!(result, Err(CollectError::AuthenticationFailed { .. })));
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(connection.session().token().await, None);
    }

    #[tokio::test]
    async fn test_second_expiry_does_not_loop() {
        let source = Arc::new(ScriptedSource::new(
            vec![Some("t1"), Some("t2"), Some("t3")],
            vec![FetchOutcome::AuthExpired, FetchOutcome::AuthExpired, FetchOutcome::Data(json!({}))],
        ));
        let connection = connection_with(source.clone());

        let result = fetch(&connection, &SourceRequest::new("/x")).await;

        assert!(matches!(result, Err(CollectError::AuthenticationFailed { .. })));
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 2);
        assert_eq!(source.login_calls.load(Ordering::SeqCst), 2);
        assert_eq!(connection.session().token().await, None);
    }

    /// Expires `/slow` on every token after a delay and `/fast` on all but `t3`
    struct InterleavedSource {
        logins: AtomicUsize,
    }

    #[async_trait]
    impl MetricSource for InterleavedSource {
        async fn authenticate(&self) -> Option<String> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Some(format!("t{}", n))
        }

        async fn fetch(&self, request: &SourceRequest, token: &str) -> FetchOutcome {
            match (request.path.as_str(), token) {
                ("/slow", "t2") => {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    FetchOutcome::AuthExpired
                }
                ("/fast", "t3") => FetchOutcome::Data(json!({"ok": true})),
                _ => FetchOutcome::AuthExpired,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_second_expiry_keeps_token_refreshed_by_other_task() {
        let source = Arc::new(InterleavedSource {
            logins: AtomicUsize::new(0),
        });
        let connection =
            Connection::new(ConnectionSettings::for_host("ecs1.example.com"), source.clone());
        connection.session().connect(source.as_ref()).await;

        let slow_request = SourceRequest::new("/slow");
        let slow = fetch(&connection, &slow_request);
        let fast = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            fetch(&connection, &SourceRequest::new("/fast")).await
        };
        let (slow, fast) = tokio::join!(slow, fast);

        assert!(matches!(slow, Err(CollectError::AuthenticationFailed { .. })));
        assert_eq!(fast.unwrap(), json!({"ok": true}));
        assert_eq!(connection.session().token().await.as_deref(), Some("t3"));
        assert_eq!(source.logins.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_failure_is_source_unavailable() {
        let source = Arc::new(ScriptedSource::new(
            vec![Some("t1")],
            vec![FetchOutcome::Failed("status 500".to_string())],
        ));
        let connection = connection_with(source.clone());

        let result = fetch(&connection, &SourceRequest::new("/x")).await;

        match result {
            Err(CollectError::SourceUnavailable { host, reason }) => {
                assert_eq!(host, "ecs1.example.com");
                assert!(reason.contains("status 500"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_initial_login_failure_skips_request() {
        let source = Arc::new(ScriptedSource::new(vec![None], vec![]));
        let connection = connection_with(source.clone());

        let result = fetch(&connection, &SourceRequest::new("/x")).await;

        assert!(matches!(result, Err(CollectError::AuthenticationFailed { .. })));
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 0);
    }
}
