//! Full route → extract → load → acknowledge cycle over the in-memory
//! store, stream protocol, and target dialect.

use std::sync::Arc;

use data_loader::{ConflictResolver, DataWriter};
use outgoing_batch::{BatchStatus, BatchStore};
use row_sync::pipeline::{acknowledge, extract_to_stream, load_stream};
use row_sync::protocol::read_stream;
use row_sync::testing::{
    customer_header, customer_insert, customer_target, service, val,
};
use sync_model::{ChangeEvent, Channel, NodeChannel, TableRef};

const NODE: &str = "store-001";

fn default_channel(max: usize) -> NodeChannel {
    NodeChannel::new(Channel::new("default", max))
}

#[tokio::test]
async fn events_flow_from_capture_to_target_rows() {
    let (svc, _store) = service(vec![default_channel(50)]);
    let events: Vec<ChangeEvent> = (1..=3)
        .map(|i| customer_insert(i, "default", &i.to_string(), "name"))
        .collect();
    svc.store().insert_events(events).await.unwrap();
    svc.build_outgoing_batches(NODE).await.unwrap();

    let (batches, bytes) = extract_to_stream(&svc, NODE, "server", Vec::new())
        .await
        .unwrap();
    assert_eq!(batches.len(), 1);

    let parsed = read_stream(bytes.as_slice()).unwrap();
    let target = customer_target();
    let mut writer = DataWriter::new(target.clone(), ConflictResolver::default());
    writer.open().unwrap();
    let outcomes = load_stream(&parsed, &mut writer).await.unwrap();
    writer.close().unwrap();

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].ok);
    assert_eq!(outcomes[0].stats.insert_count, 3);
    assert_eq!(target.row_count(&TableRef::new("customer")), 3);

    acknowledge(&svc, &outcomes).await.unwrap();
    // Acknowledged Ok: nothing left to resend.
    assert!(svc.get_outgoing_batches(NODE).await.unwrap().is_empty());
}

#[tokio::test]
async fn unacknowledged_batches_are_re_extracted() {
    let (svc, _store) = service(vec![default_channel(50)]);
    svc.store()
        .insert_events(vec![customer_insert(1, "default", "1", "ann")])
        .await
        .unwrap();
    svc.build_outgoing_batches(NODE).await.unwrap();

    let (first, _) = extract_to_stream(&svc, NODE, "server", Vec::new())
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    // No acknowledgment arrived; the same batch goes out again.
    let (again, _) = extract_to_stream(&svc, NODE, "server", Vec::new())
        .await
        .unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].batch_id, first[0].batch_id);
    assert_eq!(again[0].status, BatchStatus::Sent);
}

#[tokio::test]
async fn failed_channel_blocks_later_batches_on_that_channel_only() {
    let (svc, _store) = service(vec![
        default_channel(1),
        NodeChannel::new(Channel::new("config", 1).processing_order(0)),
    ]);
    // Two single-event batches per channel.
    let header = customer_header();
    let events = vec![
        customer_insert(1, "default", "1", "ann"),
        customer_insert(2, "default", "1", "dup"), // same key: conflicts
        ChangeEvent::insert(3, &header, "config", "server", vec![val("9"), val("cfg"), None]),
        ChangeEvent::insert(4, &header, "config", "server", vec![val("8"), val("cfg"), None]),
    ];
    svc.store().insert_events(events).await.unwrap();
    svc.build_outgoing_batches(NODE).await.unwrap();

    let (_batches, bytes) = extract_to_stream(&svc, NODE, "server", Vec::new())
        .await
        .unwrap();
    let parsed = read_stream(bytes.as_slice()).unwrap();
    assert_eq!(parsed.len(), 4);

    let target = customer_target();
    // Strict policy so the duplicate insert fails its batch.
    let mut writer = DataWriter::new(
        target.clone(),
        ConflictResolver::new(data_loader::ConflictPolicy::error_stop()),
    );
    writer.open().unwrap();
    let outcomes = load_stream(&parsed, &mut writer).await.unwrap();
    writer.close().unwrap();

    // config channel: both batches applied; default channel: first applied,
    // second failed, and nothing after it on that channel loads.
    let failed: Vec<_> = outcomes.iter().filter(|o| !o.ok).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.ok).count(), 3);

    acknowledge(&svc, &outcomes).await.unwrap();
    let resendable = svc.get_outgoing_batches(NODE).await.unwrap();
    // Only the failed batch remains in the pool.
    assert_eq!(resendable.len(), 1);
    assert_eq!(resendable[0].batch_id, failed[0].batch_id);
    assert_eq!(resendable[0].status, BatchStatus::Error);
}

#[tokio::test]
async fn aborted_batch_leaves_no_rows_behind() {
    let (svc, _store) = service(vec![default_channel(50)]);
    svc.store()
        .insert_events(vec![
            customer_insert(1, "default", "1", "ann"),
            customer_insert(2, "default", "1", "dup"),
        ])
        .await
        .unwrap();
    svc.build_outgoing_batches(NODE).await.unwrap();
    let (_batches, bytes) = extract_to_stream(&svc, NODE, "server", Vec::new())
        .await
        .unwrap();
    let parsed = read_stream(bytes.as_slice()).unwrap();

    let target = customer_target();
    let mut writer = DataWriter::new(
        target.clone(),
        ConflictResolver::new(data_loader::ConflictPolicy::error_stop()),
    );
    writer.open().unwrap();
    let outcomes = load_stream(&parsed, &mut writer).await.unwrap();

    assert!(!outcomes[0].ok);
    assert_eq!(target.row_count(&TableRef::new("customer")), 0);
    let failed = outcomes[0].failed_position.as_ref().unwrap();
    assert_eq!(failed.table, "customer");
}

#[tokio::test]
async fn deletes_and_updates_round_trip_through_the_stream() {
    let (svc, _store) = service(vec![default_channel(50)]);
    let header = customer_header();
    let events = vec![
        customer_insert(1, "default", "1", "ann"),
        ChangeEvent::update(
            2,
            &header,
            "default",
            "server",
            vec![val("1"), val("anne"), val("oslo")],
            None,
            vec![val("1")],
        ),
        ChangeEvent::delete(3, &header, "default", "server", vec![val("1")]),
    ];
    svc.store().insert_events(events).await.unwrap();
    svc.build_outgoing_batches(NODE).await.unwrap();
    let (_batches, bytes) = extract_to_stream(&svc, NODE, "server", Vec::new())
        .await
        .unwrap();

    let target = customer_target();
    let mut writer = DataWriter::new(target.clone(), ConflictResolver::default());
    writer.open().unwrap();
    let outcomes = load_stream(&read_stream(bytes.as_slice()).unwrap(), &mut writer)
        .await
        .unwrap();

    assert!(outcomes[0].ok);
    assert_eq!(outcomes[0].stats.insert_count, 1);
    assert_eq!(outcomes[0].stats.update_count, 1);
    assert_eq!(outcomes[0].stats.delete_count, 1);
    assert_eq!(target.row_count(&TableRef::new("customer")), 0);
}
