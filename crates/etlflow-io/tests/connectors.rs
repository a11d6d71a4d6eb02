use etlflow_core::{
    ColumnMap, Connection, DynamicRow, ErrorLinkable, ErrorRecord, Linkable, MemoryConnection, Node, Query,
};
use etlflow_io::{CustomSource, DbDestination, DbSource, MemoryDestination, Source, VoidDestination};
use serde_json::json;
use std::sync::Arc;

async fn customers() -> Arc<MemoryConnection> {
    let conn = Arc::new(MemoryConnection::new());
    conn.create_table("customers", ["customer_id", "customer_name"]);
    conn.open().await.unwrap();
    conn.bulk_insert(
        "customers",
        &["customer_id".to_string(), "customer_name".to_string()],
        (1..=5).map(|i| vec![json!(i), json!(format!("c{i}"))]).collect(),
    )
    .await
    .unwrap();
    conn.close().await.unwrap();
    conn
}

#[tokio::test]
async fn copies_a_table_through_column_maps() {
    let from = customers().await;
    let to = Arc::new(MemoryConnection::new());
    to.create_table("archive", ["id", "name"]);

    let source = DbSource::new("read", from, Query::table("customers")).with_column_map(
        ColumnMap::new()
            .map("id", "customer_id")
            .map("name", "customer_name"),
    );
    let dest = DbDestination::new("write", to.clone(), "archive").with_batch_size(2);
    source.link_to(&dest);

    source.execute();
    dest.wait().await.unwrap();
    let rows = to.rows("archive");
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0], vec![json!(1), json!("c1")]);
    assert_eq!(rows[4], vec![json!(5), json!("c5")]);
}

#[tokio::test]
async fn filtered_query_reads_matching_rows_only() {
    let conn = customers().await;
    let source = DbSource::new(
        "read",
        conn,
        Query::table("customers")
            .columns(["customer_name"])
            .where_eq("customer_id", 3),
    );
    let dest = MemoryDestination::new("dest");
    source.link_to(&dest);

    source.execute();
    dest.wait().await.unwrap();
    assert_eq!(dest.data(), vec![DynamicRow::new().with("customer_name", "c3")]);
}

#[tokio::test]
async fn rejected_batch_is_reported_row_by_row() {
    let conn = Arc::new(MemoryConnection::new());
    conn.create_table("people", ["id", "name"]);
    let rows = vec![
        DynamicRow::new().with("id", 1).with("name", "a"),
        DynamicRow::new().with("id", 2).with("name", "b"),
        DynamicRow::new().with("id", 3).with("nickname", "c"),
        DynamicRow::new().with("id", 4).with("name", "d"),
        DynamicRow::new().with("id", 5).with("name", "e"),
    ];
    let mut pending = rows.into_iter();
    let source = CustomSource::new("people", move |_| Ok(pending.next()), |index| index >= 5);
    let dest = DbDestination::new("write", conn.clone(), "people").with_batch_size(2);
    let errors = MemoryDestination::<ErrorRecord>::new("errors");
    source.link_to(&dest);
    dest.link_errors_to(&errors);

    source.execute();
    dest.wait().await.unwrap();
    errors.wait().await.unwrap();

    let ids: Vec<_> = conn.rows("people").into_iter().map(|r| r[0].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2), json!(5)]);
    let records = errors.take_data();
    assert_eq!(records.len(), 2);
    assert!(records[0].exception.contains("nickname"));
    assert_eq!(
        records[1].record_as_json.as_deref(),
        Some(r#"{"id":4,"name":"d"}"#)
    );
}

#[tokio::test]
async fn void_destination_drains_everything() {
    let conn = customers().await;
    let source = DbSource::new("read", conn, Query::table("customers"));
    let void = VoidDestination::new("void");
    source.link_to(&void);

    source.execute();
    void.wait().await.unwrap();
    assert_eq!(void.core().processed(), 5);
}
