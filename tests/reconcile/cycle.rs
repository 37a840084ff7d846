use std::{fs, time::Duration};

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use staged::{
    git::testing::GitCall,
    intent::{DeployMode, IntentPolicy},
    queue::CoalescingQueue,
    reconciler::{Convergence, ReconcileError, Reconciler, ReconcilerSettings},
    stream::{RecordOutcome, StreamConsumer, StreamSettings},
};

use crate::{BAR_URL, FOO_URL, Fixture, intent};

fn policy() -> IntentPolicy {
    IntentPolicy {
        mode: DeployMode::Staging,
        trusted_source_prefix: "https://gitbox.apache.org/repos/asf/".to_string(),
        org_domain: "apache.org".to_string(),
        protected_targets: vec!["www.apache.org".to_string()],
        default_branch: "asf-site".to_string(),
        default_pusher: "root".to_string(),
    }
}

#[tokio::test]
async fn only_latest_of_coalesced_intents_is_applied() {
    let mut fixture = Fixture::new();
    fixture.queue.put(intent("foo", FOO_URL, "one"));
    fixture.queue.put(intent("foo", BAR_URL, "two"));
    fixture.queue.put(intent("foo", FOO_URL, "three"));

    let report = fixture.reconciler.run_cycle().await;

    assert_eq!(report.targets.len(), 1);
    assert_eq!(
        fixture.backend.calls(),
        vec![GitCall::Clone {
            url: FOO_URL.to_string(),
            branch: "three".to_string(),
            destination: fixture.path("foo"),
        }]
    );
}

#[tokio::test]
async fn one_failing_target_does_not_abort_the_cycle() {
    let mut fixture = Fixture::new();
    // A file where a directory is expected makes inspecting the target fail.
    fs::write(fixture.path("blocker"), "not a directory").expect("blocker file");
    fixture.queue.put(intent("blocker/site", FOO_URL, "main"));
    fixture.queue.put(intent("foo", FOO_URL, "main"));

    let report = fixture.reconciler.run_cycle().await;

    assert!(matches!(
        report.targets.get("blocker/site"),
        Some(Err(ReconcileError::Inspect { .. }))
    ));
    assert!(matches!(
        report.targets.get("foo"),
        Some(Ok(target)) if target.convergence == Convergence::Cloned
    ));
    assert_eq!(report.converged(), 1);
}

#[tokio::test]
async fn intent_queued_after_drain_lands_in_next_cycle() {
    let mut fixture = Fixture::new();
    fixture.queue.put(intent("foo", FOO_URL, "main"));
    let first = fixture.reconciler.run_cycle().await;
    assert_eq!(first.targets.len(), 1);

    fixture.queue.put(intent("bar", BAR_URL, "main"));
    let second = fixture.reconciler.run_cycle().await;
    assert_eq!(second.cycle_id, first.cycle_id + 1);
    assert_eq!(
        second.targets.keys().cloned().collect::<Vec<_>>(),
        vec!["bar".to_string()]
    );
}

#[tokio::test]
async fn failed_clone_is_not_retried_without_new_intent() {
    let mut fixture = Fixture::new();
    fixture.backend.fail_clones_of(FOO_URL);
    fixture.queue.put(intent("foo", FOO_URL, "main"));

    fixture.reconciler.run_cycle().await;
    fixture.backend.clear_calls();
    let report = fixture.reconciler.run_cycle().await;

    assert!(report.targets.is_empty());
    assert!(fixture.backend.calls().is_empty());
}

#[tokio::test]
async fn rejected_stream_records_never_reach_git() {
    let mut fixture = Fixture::new();
    let consumer = StreamConsumer::new(
        StreamSettings {
            url: "http://127.0.0.1:9/".to_string(),
            connect_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(1),
        },
        policy(),
        fixture.queue.clone(),
    )
    .expect("consumer should build");

    let hostile = [
        r#"{"staging": {"project": "..", "source": "https://gitbox.apache.org/repos/asf/x.git"}}"#,
        r#"{"staging": {"project": "foo", "subdir": "../../etc", "source": "https://gitbox.apache.org/repos/asf/x.git"}}"#,
        r#"{"staging": {"project": "foo", "source": "https://github.com/evil/x.git"}}"#,
        r#"{"staging": {"project": "www.apache.org", "source": "https://gitbox.apache.org/repos/asf/www.git"}}"#,
        r#"{"staging": {"project": "FOO", "source": "https://gitbox.apache.org/repos/asf/x.git"}}"#,
    ];
    for record in hostile {
        assert!(
            matches!(consumer.handle_record(record), RecordOutcome::Rejected(_)),
            "{record} should be rejected",
        );
    }

    let report = fixture.reconciler.run_cycle().await;
    assert!(report.targets.is_empty());
    assert!(fixture.backend.calls().is_empty());
}

#[tokio::test]
async fn run_loop_applies_queue_until_cancelled() {
    let fixture = Fixture::new();
    let queue = CoalescingQueue::new();
    let reconciler = Reconciler::new(
        ReconcilerSettings {
            root_dir: fixture.root.clone(),
            interval: Duration::from_millis(10),
        },
        fixture.backend.clone(),
        queue.clone(),
    );

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(reconciler.run(shutdown.clone()));
    queue.put(intent("foo", FOO_URL, "main"));

    timeout(Duration::from_secs(5), async {
        while fixture.backend.actions().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queued intent should be applied by a tick");

    shutdown.cancel();
    timeout(Duration::from_secs(5), task)
        .await
        .expect("reconciler should stop after cancellation")
        .expect("reconciler task should not panic");

    assert!(queue.is_empty());
    assert!(fixture.path("foo").is_dir());
}
