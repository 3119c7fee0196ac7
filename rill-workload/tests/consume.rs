//! Consumption oracle and verification against the simulated broker and
//! against a client whose consumers never attach.

mod common;

use std::sync::Arc;
use std::time::Duration;

use rill_client::{BatchSetting, ClientError, SharedClient, Subscription};
use rill_sim::{SimBroker, SimConfig};
use rill_workload::{
    verify, verify_disjoint, AckPolicy, ConsumerSpec, Discipline, ExpectedModel, Guarantee,
    KeyAssignment, Oracle, PayloadShape, StopCondition, Workload, WorkloadError,
};

use common::{Stall, StalledClient};

const ACK_TIMEOUT: Duration = Duration::from_secs(30);

async fn setup() -> (SimBroker, SharedClient) {
    let broker = SimBroker::start(SimConfig::new().dispatch_tick(Duration::from_millis(10))).unwrap();
    let client = broker.client(0).unwrap();
    client.create_stream("s").await.unwrap();
    client
        .create_subscription(&Subscription::new("sub", "s", ACK_TIMEOUT))
        .await
        .unwrap();
    (broker, client)
}

async fn produce(client: &SharedClient, workload: Workload) -> ExpectedModel {
    workload.produce(client.clone(), "s").await.unwrap()
}

fn batched(count: usize, batch: u32, size: usize) -> Workload {
    let setting = BatchSetting::builder().record_count_limit(batch).build().unwrap();
    Workload::builder()
        .count(count)
        .discipline(Discipline::Batched(setting))
        .shape(PayloadShape::Raw { size })
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_always_ack_observes_in_order() {
    let (_broker, client) = setup().await;
    let expected = produce(&client, Workload::builder().count(100).build().unwrap()).await;

    let report = Oracle::new(client)
        .consume(ConsumerSpec::new("sub", "c1"), StopCondition::Count(100))
        .await
        .unwrap();
    let observed = report.require_complete().unwrap();

    for guarantee in [Guarantee::InOrder, Guarantee::ExactIds, Guarantee::PerKeyMonotonic] {
        let verdict = verify(&expected, &observed, guarantee);
        assert!(verdict.is_pass(), "{verdict}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nack_policy_is_exactly_once() {
    let (_broker, client) = setup().await;
    let expected = produce(&client, batched(300, 30, 64)).await;

    let spec = ConsumerSpec::new("sub", "c1").policy(AckPolicy::Nack {
        probability: 0.3,
        max_redeliveries: 3,
    });
    let report = Oracle::new(client)
        .seed(3)
        .consume(spec, StopCondition::Count(300))
        .await
        .unwrap();

    assert!(report.members["c1"].nacks > 0);
    let observed = report.require_complete().unwrap();
    assert!(observed.max_attempt() > 1);
    let verdict = verify(&expected, &observed, Guarantee::ExactIds);
    assert!(verdict.is_pass(), "{verdict}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_withheld_deliveries_are_drained_by_group() {
    let (_broker, client) = setup().await;
    let oracle = Oracle::new(client.clone())
        .seed(11)
        .release_interval(Duration::from_millis(5));
    let specs = vec![
        ConsumerSpec::new("sub", "c1").policy(AckPolicy::Withhold {
            probability: 0.5,
            max_pending: 50,
        }),
        ConsumerSpec::new("sub", "c2").policy(AckPolicy::DrainShuffled { probability: 0.5 }),
    ];
    let handle = oracle.spawn_group(specs, StopCondition::Count(1000));

    // Both members are attached before any key gets an owner.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let setting = BatchSetting::builder().record_count_limit(10).build().unwrap();
    let workload = Workload::builder()
        .count(1000)
        .discipline(Discipline::Batched(setting))
        .shape(PayloadShape::Raw { size: 128 })
        .keys(KeyAssignment::uniform(16))
        .build()
        .unwrap();
    let expected = produce(&client, workload).await;

    let report = handle.wait().await.unwrap();
    assert!(oracle.pool().is_empty());
    assert!(report.members["c1"].withheld > 0);
    assert!(report.members["c2"].acks > 0);

    let observed = report.require_complete().unwrap();
    let verdict = verify(&expected, &observed, Guarantee::ExactMultiset);
    assert!(verdict.is_pass(), "{verdict}");
    assert!(verify(&expected, &observed, Guarantee::ExactIds).is_pass());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_group_members_split_keys() {
    let (_broker, client) = setup().await;
    let setting = BatchSetting::builder().record_count_limit(50).build().unwrap();
    let workload = Workload::builder()
        .count(3500)
        .discipline(Discipline::Batched(setting))
        .shape(PayloadShape::Raw { size: 100 })
        .keys(KeyAssignment::uniform(8))
        .build()
        .unwrap();
    let expected = produce(&client, workload).await;

    let specs = ["c1", "c2", "c3"]
        .into_iter()
        .map(|name| ConsumerSpec::new("sub", name))
        .collect();
    let report = Oracle::new(client)
        .consume_group(specs, StopCondition::Count(3500))
        .await
        .unwrap();
    let observed = report.require_complete().unwrap();

    let total: usize = observed.member_counts().values().sum();
    assert_eq!(total, 3500);
    for guarantee in [Guarantee::SameSize, Guarantee::ExactIds, Guarantee::KeyExclusive] {
        let verdict = verify(&expected, &observed, guarantee);
        assert!(verdict.is_pass(), "{verdict}");
    }

    let members = observed.by_member();
    let sets: Vec<_> = members.values().collect();
    for (i, left) in sets.iter().enumerate() {
        for right in &sets[i + 1..] {
            assert!(left.is_disjoint(right));
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_separate_runs_are_disjoint() {
    let (_broker, client) = setup().await;
    let oracle = Oracle::new(client.clone());

    produce(&client, Workload::builder().count(20).seed(1).build().unwrap()).await;
    let first = oracle
        .consume(ConsumerSpec::new("sub", "c1"), StopCondition::Count(20))
        .await
        .unwrap()
        .require_complete()
        .unwrap();

    produce(&client, Workload::builder().count(20).seed(2).build().unwrap()).await;
    let second = oracle
        .consume(ConsumerSpec::new("sub", "c1"), StopCondition::Count(20))
        .await
        .unwrap()
        .require_complete()
        .unwrap();

    let verdict = verify_disjoint(&first, &second);
    assert!(verdict.is_pass(), "{verdict}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_spawned_consumer_stops_on_request() {
    let (_broker, client) = setup().await;
    produce(&client, Workload::builder().count(10).build().unwrap()).await;

    let handle = Oracle::new(client).spawn(ConsumerSpec::new("sub", "c1"), StopCondition::Never);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished());

    let report = handle.stop().await.unwrap();
    assert!(!report.timed_out);
    assert_eq!(report.observed.len(), 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_is_reported_not_raised() {
    let (_broker, client) = setup().await;
    produce(&client, Workload::builder().count(2).build().unwrap()).await;

    let report = Oracle::new(client)
        .timeout(Duration::from_millis(300))
        .consume(ConsumerSpec::new("sub", "c1"), StopCondition::Count(5))
        .await
        .unwrap();
    assert!(report.timed_out);
    assert_eq!(report.observed.len(), 2);
    assert!(report.require_complete().unwrap_err().is_timeout());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stalled_attach_times_out() {
    let client: SharedClient = Arc::new(StalledClient::new(Stall::Subscribe));
    let oracle = Oracle::new(client).timeout(Duration::from_millis(200));

    let specs = vec![ConsumerSpec::new("sub", "c1"), ConsumerSpec::new("sub", "c2")];
    let report = tokio::time::timeout(
        Duration::from_secs(5),
        oracle.consume_group(specs, StopCondition::Count(1)),
    )
    .await
    .expect("consumers outlived the oracle timeout")
    .unwrap();
    assert!(report.timed_out);
    assert!(report.observed.is_empty());
    assert!(report.require_complete().unwrap_err().is_timeout());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_interrupts_stalled_attach() {
    let client: SharedClient = Arc::new(StalledClient::new(Stall::Subscribe));
    let handle = Oracle::new(client).spawn(ConsumerSpec::new("sub", "c1"), StopCondition::Never);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = tokio::time::timeout(Duration::from_secs(5), handle.stop())
        .await
        .expect("stop did not interrupt the attach")
        .unwrap();
    assert!(!report.timed_out);
    assert!(report.observed.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_attach_failure_is_an_error() {
    let (_broker, client) = setup().await;
    let oracle = Oracle::new(client);

    let err = oracle
        .consume(ConsumerSpec::new("missing", "c1"), StopCondition::Count(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkloadError::Client {
            source: ClientError::NotFound { .. },
            ..
        }
    ));

    let specs = vec![ConsumerSpec::new("sub", "c1"), ConsumerSpec::new("sub", "c1")];
    let err = oracle
        .consume_group(specs, StopCondition::Never)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkloadError::Client {
            source: ClientError::AlreadyExists { .. },
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_consume_through_another_node() {
    let (broker, client) = setup().await;
    let writer = broker.client(1).unwrap();
    let reader = broker.client(2).unwrap();
    let expected = Workload::builder()
        .count(64)
        .build()
        .unwrap()
        .produce(writer, "s")
        .await
        .unwrap();

    let spec = ConsumerSpec::new("sub", "c1").via(reader);
    let observed = Oracle::new(client)
        .consume(spec, StopCondition::Count(64))
        .await
        .unwrap()
        .require_complete()
        .unwrap();
    assert!(verify(&expected, &observed, Guarantee::ExactIds).is_pass());
}
