use etlflow_core::{ErrorLinkable, ErrorRecord, Linkable, Node, Target};
use etlflow_io::{MemoryDestination, MemorySource, Source};
use etlflow_tx::{CrossJoin, Multicast, RowBatchTransformation, RowTransformation};
use tokio_util::sync::CancellationToken;

fn doubler() -> RowTransformation<i32, i32> {
    RowTransformation::new("double", |x: i32| Ok(x * 2))
}

#[tokio::test]
async fn one_to_ten_doubled_in_batches_of_four() {
    let source = MemorySource::new("source", 1..=10);
    let batch = RowBatchTransformation::new("double", 4, |rows: Vec<i32>| {
        Ok(Some(rows.into_iter().map(|x| x * 2).collect()))
    });
    let dest = MemoryDestination::new("dest");
    source.link_to(&batch).link_to(&dest);

    source.execute();
    dest.wait().await.unwrap();
    assert_eq!(dest.data(), vec![2, 4, 6, 8, 10, 12, 14, 16, 18, 20]);
    assert_eq!(batch.core().processed(), 10);
}

#[tokio::test]
async fn order_survives_bounded_buffers() {
    let source = MemorySource::new("source", 0..2_000);
    let first = RowTransformation::new("first", |x: i32| Ok(x + 1)).with_bounded_capacity(2);
    let second = doubler().with_bounded_capacity(3);
    let dest = MemoryDestination::new("dest").with_bounded_capacity(1);
    source.link_to(&first).link_to(&second).link_to(&dest);

    source.execute();
    dest.wait().await.unwrap();
    assert_eq!(dest.data(), (0..2_000).map(|x| (x + 1) * 2).collect::<Vec<_>>());
}

#[tokio::test]
async fn multicast_completes_every_branch() {
    let rows = 250;
    let source = MemorySource::new("source", 0..rows);
    let multicast = Multicast::new("fan-out");
    let left = MemoryDestination::new("left");
    let right = MemoryDestination::new("right");
    source.link_to(&multicast);
    multicast.link_to(&left);
    multicast.link_to(&right);

    source.execute();
    left.wait().await.unwrap();
    right.wait().await.unwrap();
    assert_eq!(left.len(), rows as usize);
    assert_eq!(right.len(), rows as usize);
    assert_eq!(left.data(), right.data());
}

#[tokio::test]
async fn failed_batch_becomes_one_record_per_row() {
    let source = MemorySource::new("source", 1..=8);
    let batch = RowBatchTransformation::new("batch", 4, |rows: Vec<i32>| {
        if rows.contains(&6) {
            anyhow::bail!("batch with 6 rejected");
        }
        Ok(Some(rows))
    });
    let dest = MemoryDestination::new("dest");
    let errors = MemoryDestination::<ErrorRecord>::new("errors");
    source.link_to(&batch).link_to(&dest);
    batch.link_errors_to(&errors);

    source.execute();
    dest.wait().await.unwrap();
    errors.wait().await.unwrap();
    assert_eq!(dest.data(), vec![1, 2, 3, 4]);
    let records = errors.take_data();
    assert_eq!(records.len(), 4);
    let rows: Vec<_> = records
        .iter()
        .map(|r| r.record_as_json.clone().unwrap_or_default())
        .collect();
    assert_eq!(rows, vec!["5", "6", "7", "8"]);
    assert!(records.iter().all(|r| r.error_text == "batch with 6 rejected"));
}

#[tokio::test]
async fn failing_rows_are_either_delivered_or_reported() {
    let source = MemorySource::new("source", 1..=20);
    let checked = RowTransformation::new("checked", |x: i32| {
        if x % 3 == 0 {
            anyhow::bail!("{x} is divisible by three");
        }
        Ok(x)
    });
    let dest = MemoryDestination::new("dest");
    let errors = MemoryDestination::<ErrorRecord>::new("errors");
    source.link_to(&checked).link_to(&dest);
    checked.link_errors_to(&errors);

    source.execute();
    dest.wait().await.unwrap();
    errors.wait().await.unwrap();
    assert_eq!(dest.len() + errors.len(), 20);
    assert_eq!(errors.len(), 6);
}

#[tokio::test]
async fn null_rows_never_reach_a_target() {
    let source = MemorySource::with_nulls("source", vec![Some(1), None, Some(2), None]);
    let evens_dropped = RowTransformation::filter_map("odd", |x: i32| Ok((x % 2 == 1).then_some(x)));
    let dest = MemoryDestination::new("dest");
    source.link_to(&evens_dropped).link_to(&dest);

    source.execute();
    dest.wait().await.unwrap();
    assert_eq!(dest.data(), vec![1]);
    assert_eq!(source.core().processed(), 2);
}

#[tokio::test]
async fn predicate_links_partition_the_rows() {
    let source = MemorySource::new("source", 0..100);
    let small = MemoryDestination::new("small");
    let large = MemoryDestination::new("large");
    source.link_to_if(&small, |x: &i32| *x < 30);
    source.link_to_if(&large, |x: &i32| *x >= 30);

    source.execute();
    small.wait().await.unwrap();
    large.wait().await.unwrap();
    assert_eq!(small.data(), (0..30).collect::<Vec<_>>());
    assert_eq!(large.data(), (30..100).collect::<Vec<_>>());
}

#[tokio::test]
async fn multicast_predicate_and_its_negation_partition_the_rows() {
    let source = MemorySource::new("source", 0..100);
    let multicast = Multicast::new("split");
    let even = MemoryDestination::new("even");
    let odd = MemoryDestination::new("odd");
    source.link_to(&multicast);
    multicast.link_to_if(&even, |x: &i32| x % 2 == 0);
    multicast.link_to_if(&odd, |x: &i32| x % 2 != 0);

    source.execute();
    even.wait().await.unwrap();
    odd.wait().await.unwrap();
    let (even, odd) = (even.data(), odd.data());
    assert_eq!(even.len() + odd.len(), 100);
    assert!(even.iter().all(|x| !odd.contains(x)));
    assert_eq!(even, (0..100).step_by(2).collect::<Vec<_>>());
}

#[tokio::test]
async fn void_predicate_discards_rows() {
    let source = MemorySource::new("source", 0..10);
    let kept = MemoryDestination::new("kept");
    let rest = MemoryDestination::new("rest");
    source.link_to_filtered(&kept, |x: &i32| *x < 3, |x: &i32| *x >= 8);
    source.link_to(&rest);

    source.execute();
    kept.wait().await.unwrap();
    rest.wait().await.unwrap();
    assert_eq!(kept.data(), vec![0, 1, 2]);
    assert_eq!(rest.data(), vec![3, 4, 5, 6, 7]);
}

#[tokio::test]
async fn cross_join_cardinality() {
    let a = MemorySource::new("a", 0..4);
    let b = MemorySource::new("b", 0..5);
    let all = CrossJoin::new("all", |x: &i32, y: &i32| Ok(Some((*x, *y))));
    let dest = MemoryDestination::new("dest");
    a.link_to(&all.in_memory());
    b.link_to(&all.passing());
    all.link_to(&dest);

    a.execute();
    b.execute();
    dest.wait().await.unwrap();
    assert_eq!(dest.len(), 20);

    let a = MemorySource::new("a", 0..4);
    let b = MemorySource::new("b", 0..5);
    let some = CrossJoin::new("some", |x: &i32, y: &i32| Ok((x < y).then_some((*x, *y))));
    let dest = MemoryDestination::new("dest");
    a.link_to(&some.in_memory());
    b.link_to(&some.passing());
    some.link_to(&dest);

    a.execute();
    b.execute();
    dest.wait().await.unwrap();
    assert!(dest.len() < 20);
    assert_eq!(dest.len(), 10);
}

#[tokio::test]
async fn capacity_set_after_construction_covers_a_batch() {
    let source = MemorySource::new("source", 1..=20);
    let batch = RowBatchTransformation::new("times-ten", 5, |rows: Vec<i32>| {
        Ok(Some(rows.into_iter().map(|x| x * 10).collect()))
    });
    batch.set_bounded_capacity(Some(5)).unwrap();
    let dest = MemoryDestination::new("dest");
    source.link_to(&batch).link_to(&dest);

    source.execute();
    dest.wait().await.unwrap();
    assert_eq!(dest.data(), (1..=20).map(|x| x * 10).collect::<Vec<_>>());
    assert_eq!(batch.input().capacity(), Some(5));
}

#[tokio::test]
async fn capacity_is_frozen_once_started() {
    let source = MemorySource::new("source", 1..=3);
    let dest = MemoryDestination::new("dest");
    source.link_to(&dest);

    source.execute();
    dest.wait().await.unwrap();
    assert!(dest.set_bounded_capacity(Some(2)).is_err());
}

#[tokio::test]
async fn cancelled_source_still_completes_downstream() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let source = MemorySource::new("source", 1..=100);
    let dest = MemoryDestination::new("dest");
    source.link_to(&doubler()).link_to(&dest);

    source.execute_async(cancel).await.unwrap();
    dest.wait().await.unwrap();
    assert!(dest.is_empty());
}

#[tokio::test]
async fn faults_propagate_downstream_only() {
    let source = MemorySource::new("source", 1..=5);
    let broken = RowTransformation::new("broken", |x: i32| {
        if x == 3 {
            anyhow::bail!("three");
        }
        Ok(x)
    });
    let dest = MemoryDestination::new("dest");
    source.link_to(&broken).link_to(&dest);

    source.execute();
    let err = dest.wait().await.unwrap_err();
    assert_eq!(err.causes().len(), 1);
    assert!(err.to_string().contains("three"));
    assert_eq!(dest.data(), vec![1, 2]);
    source.wait().await.unwrap();
}
