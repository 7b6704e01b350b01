//! Step runner ordering, fail-fast and short mode

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crdb_e2e::{Error, RunConfig, Step, Steps};

type Log = Arc<Mutex<Vec<&'static str>>>;

fn recording(log: &Log, name: &'static str, pass: bool) -> Step<'static> {
    let log = log.clone();
    Step::new(name, move || async move {
        log.lock().unwrap().push(name);
        if pass {
            Ok(())
        } else {
            Err(Error::Sandbox(format!("{} failed", name)))
        }
    })
}

#[tokio::test]
async fn test_runs_in_declared_order() {
    let log = Log::default();

    let report = Steps::new()
        .step(recording(&log, "a", true))
        .step(recording(&log, "b", true))
        .step(recording(&log, "c", true))
        .run(&RunConfig::default())
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(report.executed, vec!["a", "b", "c"]);
    assert!(!report.skipped);
}

#[tokio::test]
async fn test_fail_fast_stops_after_failing_step() {
    let log = Log::default();

    let failure = Steps::new()
        .step(recording(&log, "A", true))
        .step(recording(&log, "B", false))
        .step(recording(&log, "C", true))
        .run(&RunConfig::default())
        .await
        .unwrap_err();

    assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
    assert_eq!(failure.step, "B");
    assert_eq!(failure.index, 1);
    assert!(failure.to_string().contains("B failed"));
}

#[tokio::test]
async fn test_short_mode_skips_everything() {
    let log = Log::default();
    let config = RunConfig {
        short: true,
        ..RunConfig::default()
    };

    let report = Steps::new()
        .step(recording(&log, "a", true))
        .step(recording(&log, "b", false))
        .run(&config)
        .await
        .unwrap();

    assert!(report.skipped);
    assert!(report.executed.is_empty());
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_parallel_steps_run_concurrently() {
    let log = Log::default();
    let slow = |log: &Log, name: &'static str, secs: u64| {
        let log = log.clone();
        Step::new(name, move || async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            log.lock().unwrap().push(name);
            Ok(())
        })
        .parallel()
    };

    let start = tokio::time::Instant::now();
    let report = Steps::new()
        .step(recording(&log, "setup", true))
        .step(slow(&log, "slow", 10))
        .step(slow(&log, "fast", 1))
        .step(recording(&log, "after", true))
        .run(&RunConfig::default())
        .await
        .unwrap();

    // Both parallel steps overlapped, so the group took as long as the slowest
    assert_eq!(start.elapsed(), Duration::from_secs(10));
    assert_eq!(*log.lock().unwrap(), vec!["setup", "fast", "slow", "after"]);
    // The report keeps declared order
    assert_eq!(report.executed, vec!["setup", "slow", "fast", "after"]);
}

#[tokio::test]
async fn test_parallel_group_reports_first_failure_in_declared_order() {
    let log = Log::default();

    let failure = Steps::new()
        .step(recording(&log, "ok", true).parallel())
        .step(recording(&log, "first-bad", false).parallel())
        .step(recording(&log, "second-bad", false).parallel())
        .step(recording(&log, "never", true))
        .run(&RunConfig::default())
        .await
        .unwrap_err();

    assert_eq!(failure.step, "first-bad");
    assert_eq!(failure.index, 1);
    assert!(!log.lock().unwrap().contains(&"never"));
}

#[tokio::test]
async fn test_steps_can_borrow_from_the_caller() {
    let counter = Mutex::new(0);
    let counter_ref = &counter;

    Steps::new()
        .step(Step::new("increment", move || async move {
            *counter_ref.lock().unwrap() += 1;
            Ok(())
        }))
        .run(&RunConfig::default())
        .await
        .unwrap();

    assert_eq!(*counter.lock().unwrap(), 1);
}
