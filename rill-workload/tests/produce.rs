//! Workload production against the simulated broker and against clients
//! that stall or misorder.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rill_client::{BatchSetting, ClientError, SharedClient};
use rill_sim::{SimBroker, SimConfig};
use rill_workload::{
    verify, Discipline, Guarantee, KeyAssignment, ObservedModel, PayloadShape, Workload,
    WorkloadError,
};

use common::{CountdownClient, Stall, StalledClient};

async fn setup() -> (SimBroker, SharedClient) {
    let broker = SimBroker::start(SimConfig::new()).unwrap();
    let client = broker.client(0).unwrap();
    client.create_stream("s").await.unwrap();
    (broker, client)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_direct_ids_increase_in_write_order() {
    let (_broker, client) = setup().await;
    let workload = Workload::builder().count(50).seed(1).build().unwrap();

    let production = workload.run(client, "s").await.unwrap();
    assert!(production.failures.is_empty());
    assert_eq!(production.stats.writes_ok, 50);
    assert_eq!(production.stats.writes_failed, 0);

    let ids: Vec<_> = production.expected.entries().iter().map(|e| e.id).collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    let verdict = verify(&production.expected, &ObservedModel::new(), Guarantee::PerKeyMonotonic);
    assert!(verdict.is_pass(), "{verdict}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batched_flushes_by_count_and_close() {
    let (_broker, client) = setup().await;
    let setting = BatchSetting::builder().record_count_limit(10).build().unwrap();
    let workload = Workload::builder()
        .count(35)
        .discipline(Discipline::Batched(setting))
        .build()
        .unwrap();

    let expected = workload.produce(client, "s").await.unwrap();
    assert_eq!(expected.len(), 35);

    // Three count-triggered appends and one for the remainder at close.
    let batches: BTreeSet<u64> = expected.ids().iter().map(|id| id.batch_id).collect();
    assert_eq!(batches.len(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_writers_all_resolve() {
    let (_broker, client) = setup().await;
    let setting = BatchSetting::builder()
        .record_count_limit(10)
        .age_limit(Duration::from_millis(10))
        .build()
        .unwrap();
    let workload = Workload::builder()
        .count(200)
        .discipline(Discipline::Concurrent { tasks: 4, setting })
        .keys(KeyAssignment::uniform(4))
        .build()
        .unwrap();

    let expected = workload.produce(client, "s").await.unwrap();
    assert_eq!(expected.len(), 200);
    assert_eq!(expected.ids().len(), 200);

    let writers: BTreeSet<usize> = expected.entries().iter().map(|e| e.writer).collect();
    assert_eq!(writers, (0..4).collect());
    for writer in writers {
        let ids: Vec<_> = expected
            .entries()
            .iter()
            .filter(|e| e.writer == writer)
            .map(|e| e.id)
            .collect();
        assert_eq!(ids.len(), 50);
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }
    let verdict = verify(&expected, &ObservedModel::new(), Guarantee::PerKeyMonotonic);
    assert!(verdict.is_pass(), "{verdict}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stalled_broker_fails_every_discipline_within_bound() {
    let client: SharedClient = Arc::new(StalledClient::new(Stall::Append));
    let setting = BatchSetting::builder().record_count_limit(2).build().unwrap();
    let disciplines = [
        Discipline::Direct,
        Discipline::Batched(setting),
        Discipline::Concurrent { tasks: 2, setting },
        Discipline::Mixed { burst: 2 },
    ];
    for discipline in disciplines {
        let workload = Workload::builder()
            .count(4)
            .discipline(discipline.clone())
            .write_timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        let produced =
            tokio::time::timeout(Duration::from_secs(5), workload.produce(client.clone(), "s"))
                .await
                .unwrap_or_else(|_| panic!("{discipline:?} outlived its write timeout"));
        let err = produced.unwrap_err();
        assert!(err.is_timeout(), "{discipline:?}: {err}");

        let production =
            tokio::time::timeout(Duration::from_secs(5), workload.run(client.clone(), "s"))
                .await
                .unwrap_or_else(|_| panic!("{discipline:?} outlived its write timeout"))
                .unwrap();
        assert!(production.expected.is_empty());
        assert_eq!(production.failures.len(), 4);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_written_order_is_checked_per_writer() {
    let client: SharedClient = Arc::new(CountdownClient::new(1000));
    let setting = BatchSetting::builder().record_count_limit(1).build().unwrap();
    for discipline in [
        Discipline::Batched(setting),
        Discipline::Concurrent { tasks: 1, setting },
    ] {
        let workload = Workload::builder()
            .count(10)
            .discipline(discipline.clone())
            .keys(KeyAssignment::Single("k".to_string()))
            .build()
            .unwrap();

        let expected = workload.produce(client.clone(), "s").await.unwrap();
        assert_eq!(expected.len(), 10);
        let verdict = verify(&expected, &ObservedModel::new(), Guarantee::PerKeyMonotonic);
        assert!(!verdict.is_pass(), "{discipline:?}: {verdict}");
        assert!(verdict.to_string().contains("written identifiers of key k"), "{verdict}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mixed_preserves_issue_order() {
    let (_broker, client) = setup().await;
    let workload = Workload::builder()
        .count(120)
        .discipline(Discipline::Mixed { burst: 10 })
        .shape(PayloadShape::Mixed { size: 64 })
        .seed(5)
        .build()
        .unwrap();

    let expected = workload.produce(client, "s").await.unwrap();
    let planned: Vec<String> = workload
        .records()
        .iter()
        .map(|r| r.payload.fingerprint())
        .collect();
    assert_eq!(expected.fingerprints(), planned);

    let ids: Vec<_> = expected.entries().iter().map(|e| e.id).collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_record_fails_with_size_limit() {
    let (broker, client) = setup().await;
    let workload = Workload::builder()
        .count(1)
        .shape(PayloadShape::Raw {
            size: broker.limits().max_record_bytes + 20,
        })
        .build()
        .unwrap();

    let production = workload.run(client.clone(), "s").await.unwrap();
    assert!(production.expected.is_empty());
    assert_eq!(production.stats.writes_failed, 1);

    let err = workload.produce(client, "s").await.unwrap_err();
    assert!(
        matches!(err, WorkloadError::Client { ref source, .. } if source.is_size_limit()),
        "{err}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_record_at_size_limit_is_accepted() {
    let (broker, client) = setup().await;
    let workload = Workload::builder()
        .count(2)
        .shape(PayloadShape::Raw {
            size: broker.limits().max_record_bytes,
        })
        .build()
        .unwrap();

    let expected = workload.produce(client, "s").await.unwrap();
    assert_eq!(expected.total_bytes(), 2 * broker.limits().max_record_bytes);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_to_missing_stream_fails() {
    let (_broker, client) = setup().await;
    let setting = BatchSetting::builder().record_count_limit(5).build().unwrap();
    for discipline in [Discipline::Direct, Discipline::Batched(setting)] {
        let workload = Workload::builder()
            .count(10)
            .discipline(discipline)
            .build()
            .unwrap();
        let production = workload.run(client.clone(), "missing").await.unwrap();
        assert_eq!(production.failures.len(), 10);
        for failure in &production.failures {
            assert!(matches!(
                failure.error,
                WorkloadError::Client {
                    source: ClientError::NotFound { .. },
                    ..
                }
            ));
        }
    }
}
