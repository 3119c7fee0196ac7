//! Producer scenarios: payload shapes, batching triggers, size limits.

use std::time::Duration;

use bytes::Bytes;
use rill_client::{BatchSetting, BufferedProducer, ClientError, Record, RecordId};
use rill_workload::{
    verify, Checks, ConsumerSpec, Discipline, Guarantee, KeyAssignment, PayloadShape,
    StopCondition, Workload,
};
use serde_json::json;
use tokio::time::timeout;

use crate::environment::Environment;
use crate::error::{CaseError, Result};
use crate::harness::{run_case, Case};

const ACK_TIMEOUT: Duration = Duration::from_secs(60);
const RESOLVE_BOUND: Duration = Duration::from_secs(5);
const BACKPRESSURE_BOUND: Duration = Duration::from_secs(3);

/// Produces `workload` to a fresh stream and verifies it reads back under
/// `guarantees`.
async fn round_trip(case: &Case, workload: &Workload, guarantees: &[Guarantee]) -> Result<()> {
    let stream = case.create_stream().await?;
    let sub = case.create_subscription(&stream, ACK_TIMEOUT).await?;
    let expected = workload.produce(case.client(), &stream).await?;

    let observed = case
        .oracle()
        .consume(ConsumerSpec::new(&sub, "c1"), StopCondition::Count(expected.len()))
        .await?
        .require_complete()?;

    let mut checks = Checks::new();
    for guarantee in guarantees {
        checks.verdict(&verify(&expected, &observed, *guarantee));
    }
    Ok(checks.finish()?)
}

fn buffered(case: &Case, stream: &str, setting: BatchSetting) -> Result<BufferedProducer> {
    BufferedProducer::new(case.client(), stream, setting)
        .map_err(|e| CaseError::contract(format!("open buffered producer on {stream}"), &e))
}

async fn resolved(what: &str, handle: rill_client::WriteHandle) -> Result<RecordId> {
    timeout(RESOLVE_BOUND, handle)
        .await
        .map_err(|_| CaseError::Timeout {
            what: what.to_string(),
            waited: RESOLVE_BOUND,
        })?
        .map_err(|e| CaseError::contract(what, &e))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_producer_raw_records_read_back_in_order() {
    run_case("producer_raw", Environment::simulated(), |case| async move {
        let workload = Workload::builder().count(200).seed(1).build()?;
        round_trip(&case, &workload, &[Guarantee::InOrder, Guarantee::ExactMultiset]).await
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_producer_structured_records_read_back_intact() {
    run_case("producer_structured", Environment::simulated(), |case| async move {
        let workload = Workload::builder()
            .count(100)
            .shape(PayloadShape::Structured)
            .seed(2)
            .build()?;
        round_trip(&case, &workload, &[Guarantee::InOrder, Guarantee::ExactMultiset]).await
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_producer_mixed_shapes_and_discipline() {
    run_case("producer_mixed", Environment::simulated(), |case| async move {
        let workload = Workload::builder()
            .count(300)
            .shape(PayloadShape::Mixed { size: 64 })
            .discipline(Discipline::Mixed { burst: 16 })
            .seed(3)
            .build()?;
        round_trip(&case, &workload, &[Guarantee::InOrder, Guarantee::ExactMultiset]).await
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_producer_fixed_payload_counts_duplicates() {
    run_case("producer_fixed_payload", Environment::simulated(), |case| async move {
        let workload = Workload::builder()
            .count(20)
            .shape(PayloadShape::Fixed(Bytes::from_static(b"same payload")))
            .build()?;
        round_trip(&case, &workload, &[Guarantee::ExactMultiset, Guarantee::ExactIds]).await
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_producer_concurrent_writers_one_batcher() {
    run_case("producer_concurrent_writers", Environment::simulated(), |case| async move {
        let setting = BatchSetting::builder()
            .record_count_limit(25)
            .age_limit(Duration::from_millis(20))
            .build()
            .map_err(|e| CaseError::contract("build batch setting", &e))?;
        let workload = Workload::builder()
            .count(1000)
            .discipline(Discipline::Concurrent { tasks: 8, setting })
            .keys(KeyAssignment::uniform(8))
            .seed(4)
            .build()?;
        round_trip(&case, &workload, &[Guarantee::ExactIds, Guarantee::PerKeyMonotonic]).await
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_producer_count_limit_flushes_exactly_once() {
    run_case("producer_count_trigger", Environment::simulated(), |case| async move {
        const LIMIT: u32 = 16;
        let stream = case.create_stream().await?;
        let setting = BatchSetting::builder()
            .record_count_limit(LIMIT)
            .build()
            .map_err(|e| CaseError::contract("build batch setting", &e))?;
        let producer = buffered(&case, &stream, setting)?;

        let handles: Vec<_> = (0..LIMIT)
            .map(|_| producer.write(Record::raw(vec![7u8; 32])))
            .collect();
        let mut ids = Vec::with_capacity(handles.len());
        for (i, handle) in handles.into_iter().enumerate() {
            ids.push(resolved(&format!("write {i} of a full batch"), handle).await?);
        }

        let mut checks = Checks::new();
        checks.expect("one flush for a full batch", producer.stats().flushes == 1);
        checks.expect(
            "a full batch shares one append",
            ids.iter().all(|id| id.batch_id == ids[0].batch_id),
        );

        let mut extra = producer.write(Record::raw(vec![7u8; 32]));
        tokio::time::sleep(Duration::from_millis(300)).await;
        checks.expect("the extra write waits for a trigger", extra.try_result().is_none());

        producer.close().await;
        let last = resolved("extra write after close", extra).await?;
        checks.expect("the extra write lands after the batch", last > ids[ids.len() - 1]);
        checks.expect("close flushed once more", producer.stats().flushes == 2);
        Ok(checks.finish()?)
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_producer_bytes_limit_backpressure() {
    run_case("producer_bytes_trigger", Environment::simulated(), |case| async move {
        let stream = case.create_stream().await?;
        let setting = BatchSetting::builder()
            .bytes_limit(4096)
            .build()
            .map_err(|e| CaseError::contract("build batch setting", &e))?;
        let producer = buffered(&case, &stream, setting)?;

        let mut handles: Vec<_> = (0..42)
            .map(|_| producer.write(Record::raw(vec![1u8; 100])))
            .collect();
        let mut held = handles.pop().ok_or_else(|| CaseError::Infrastructure {
            message: "no write handles".to_string(),
        })?;

        // 41 records of 100 bytes cross 4096 bytes; the 42nd starts a new batch.
        for (i, handle) in handles.into_iter().enumerate() {
            resolved(&format!("write {i} before the byte limit"), handle).await?;
        }

        let mut checks = Checks::new();
        checks.expect(
            "the write past the byte limit stays unresolved",
            timeout(BACKPRESSURE_BOUND, &mut held).await.is_err(),
        );
        producer.close().await;
        resolved("held write after close", held).await?;
        checks.expect("two appends in total", producer.stats().flushes == 2);
        Ok(checks.finish()?)
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_producer_age_limit_flushes_without_close() {
    run_case("producer_age_trigger", Environment::simulated(), |case| async move {
        let stream = case.create_stream().await?;
        let setting = BatchSetting::builder()
            .age_limit(Duration::from_millis(100))
            .build()
            .map_err(|e| CaseError::contract("build batch setting", &e))?;
        let producer = buffered(&case, &stream, setting)?;

        let handles: Vec<_> = (0u8..10)
            .map(|i| producer.write(Record::raw(vec![i; 8])))
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            resolved(&format!("write {i} flushed by age"), handle).await?;
        }
        let mut checks = Checks::new();
        checks.expect("no manual flush needed", producer.stats().flushes >= 1);
        producer.close().await;
        Ok(checks.finish()?)
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_producer_explicit_flush() {
    run_case("producer_flush", Environment::simulated(), |case| async move {
        let stream = case.create_stream().await?;
        let producer = buffered(&case, &stream, BatchSetting::disabled())?;

        let mut handle = producer.write(Record::structured(
            json!({"id": 1, "name": "flush"}).as_object().cloned().unwrap_or_default(),
        ));
        let mut checks = Checks::new();
        checks.expect("disabled triggers hold the write", handle.try_result().is_none());
        checks.expect_ok("flush", producer.flush().await);
        checks.expect(
            "flush resolves the write",
            matches!(handle.try_result(), Some(Ok(_))),
        );
        producer.close().await;
        checks.expect_err(
            "write after close",
            producer.write(Record::raw(vec![1u8])).await,
            |e| matches!(e, ClientError::ProducerClosed),
        );
        Ok(checks.finish()?)
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_producer_record_size_limit() {
    run_case("producer_size_limit", Environment::simulated(), |case| async move {
        let stream = case.create_stream().await?;
        let max = case.limits().max_record_bytes;
        let producer = rill_client::Producer::new(case.client(), &stream);

        let mut checks = Checks::new();
        checks.expect_err(
            &format!("write {} byte record", max + 20),
            producer.write(Record::raw(vec![0u8; max + 20])).await,
            ClientError::is_size_limit,
        );

        // An oversized record fails its whole batch.
        let batched = buffered(&case, &stream, BatchSetting::disabled())?;
        let small = batched.write(Record::raw(vec![0u8; 16]));
        let large = batched.write(Record::raw(vec![0u8; max + 1]));
        batched.close().await;
        checks.expect_err(
            "small record batched with oversized",
            small.await,
            ClientError::is_size_limit,
        );
        checks.expect_err(
            "oversized record in batch",
            large.await,
            ClientError::is_size_limit,
        );
        checks.finish()?;

        let workload = Workload::builder()
            .count(3)
            .shape(PayloadShape::Raw { size: max })
            .build()?;
        round_trip(&case, &workload, &[Guarantee::InOrder, Guarantee::ExactMultiset]).await
    })
    .await
    .unwrap();
}
