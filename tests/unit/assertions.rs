//! Convergence assertions against a scripted observer
//!
//! All tests run on a paused tokio clock, so the 5s intervals and multi-minute
//! budgets below complete instantly and elapsed times are exact.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crdb_e2e::{
    ClusterState, Error, PollPolicy, require_failed_state, require_image_pull_backoff,
    require_ready_eventually,
};

use crate::fakes::{Reading, ScriptedObserver, failed, image_pull_backoff, ready, starting};

fn policy(interval_secs: u64, timeout_secs: u64) -> PollPolicy {
    PollPolicy::new(
        Duration::from_secs(interval_secs),
        Duration::from_secs(timeout_secs),
    )
}

#[tokio::test(start_paused = true)]
async fn test_ready_succeeds_on_the_poll_that_sees_it() {
    let observer = ScriptedObserver::new(vec![starting(3, 0), starting(3, 2), ready(3)]);
    let start = Instant::now();

    let cancel = CancellationToken::new();
    let snapshot = require_ready_eventually(&observer, "crdb", policy(5, 500), &cancel)
        .await
        .unwrap();

    assert!(snapshot.is_ready());
    assert_eq!(observer.calls(), 3);
    assert_eq!(start.elapsed(), Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_ready_times_out_with_last_snapshot() {
    let observer = ScriptedObserver::new(vec![starting(3, 1)]);
    let start = Instant::now();

    let err = require_ready_eventually(&observer, "crdb", policy(5, 20), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(start.elapsed() <= Duration::from_secs(25));
    let Error::Timeout(timeout) = err else {
        panic!("expected timeout, got {:?}", err);
    };
    // 0s, 5s, 10s, 15s and the deadline
    assert_eq!(timeout.polls, 5);
    assert_eq!(timeout.cluster, "crdb");
    assert_eq!(timeout.last_observed.as_ref().unwrap().ready_pods(), 1);
    assert!(timeout.last_error.is_none());
    assert_eq!(timeout.history.len(), 1);
    assert_eq!(timeout.history[0].to, ClusterState::Initializing);
    assert!(timeout.to_string().contains("pods_ready=1/3"));
}

#[tokio::test(start_paused = true)]
async fn test_hung_read_stops_one_interval_past_deadline() {
    let observer = ScriptedObserver::new(vec![starting(3, 1), Reading::Hang]);
    let start = Instant::now();

    let err = require_ready_eventually(&observer, "crdb", policy(5, 20), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(start.elapsed(), Duration::from_secs(25));
    let Error::Timeout(timeout) = err else {
        panic!("expected timeout, got {:?}", err);
    };
    // The read at 5s never returns and is abandoned at the hard deadline
    assert_eq!(timeout.polls, 2);
    assert_eq!(timeout.elapsed, Duration::from_secs(25));
    assert_eq!(timeout.last_observed.as_ref().unwrap().ready_pods(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_count_as_not_yet() {
    let observer = ScriptedObserver::new(vec![
        Reading::Error("connection refused"),
        Reading::Error("connection refused"),
        ready(3),
    ]);

    let result =
        require_ready_eventually(&observer, "crdb", policy(1, 60), &CancellationToken::new()).await;

    assert!(result.is_ok());
    assert_eq!(observer.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_errors_reported_at_deadline() {
    let observer = ScriptedObserver::new(vec![starting(3, 0), Reading::Error("apiserver gone")]);

    let err = require_ready_eventually(&observer, "crdb", policy(1, 3), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(err.last_observed().is_some());
    let Error::Timeout(timeout) = err else {
        unreachable!()
    };
    assert!(timeout.last_error.unwrap().contains("apiserver gone"));
}

#[tokio::test(start_paused = true)]
async fn test_zero_budget_still_polls_once() {
    let observer = ScriptedObserver::new(vec![ready(1)]);

    let result =
        require_ready_eventually(&observer, "crdb", policy(5, 0), &CancellationToken::new()).await;

    assert!(result.is_ok());
    assert_eq!(observer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_then_failed_agree() {
    let observer = ScriptedObserver::new(vec![
        starting(3, 0),
        image_pull_backoff(3),
        image_pull_backoff(3),
        failed(3),
    ]);
    let cancel = CancellationToken::new();

    let backoff = require_image_pull_backoff(&observer, "crdb", policy(5, 500), &cancel)
        .await
        .unwrap();
    assert_eq!(backoff.state(), ClusterState::ImagePullBackoff);

    let failed = require_failed_state(&observer, "crdb", policy(5, 500), &cancel)
        .await
        .unwrap();
    assert_eq!(failed.state(), ClusterState::Failed);

    let path: Vec<ClusterState> = observer.states();
    assert_eq!(
        path,
        vec![
            ClusterState::Initializing,
            ClusterState::ImagePullBackoff,
            ClusterState::Failed
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_backoff_alone_is_not_failed() {
    let observer = ScriptedObserver::new(vec![image_pull_backoff(3)]);

    let err = require_failed_state(&observer, "crdb", policy(1, 2), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(
        err.last_observed().unwrap().state(),
        ClusterState::ImagePullBackoff
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_wait_reports_cancelled() {
    let observer = ScriptedObserver::new(vec![starting(3, 0)]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        trigger.cancel();
    });

    let err = require_ready_eventually(&observer, "crdb", policy(5, 500), &cancel)
        .await
        .unwrap_err();

    match err {
        Error::Cancelled { condition, polls } => {
            assert_eq!(condition, "ready");
            assert_eq!(polls, 3);
        }
        other => panic!("expected cancellation, got {:?}", other),
    }
}
