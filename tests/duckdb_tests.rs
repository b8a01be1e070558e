//! End-to-end tests against a DuckDB file

#![cfg(feature = "duckdb-backend")]

use std::fs::File;
use std::io::Write;

use tempfile::TempDir;

use data_staging_core::inference::{InferenceConfig, InferredType, TypeInferenceEngine};
use data_staging_core::sink::{DuckDbSink, StorageSink};
use data_staging_core::staging::{ImportConfig, Importer, MemoryLimit};

fn config() -> ImportConfig {
    ImportConfig::builder()
        .batch_size(100)
        .minimum_batch_size(10)
        .memory_limit(MemoryLimit::Unlimited)
        .failed_items_table("import_failures")
        .build()
        .unwrap()
}

#[test]
fn test_wxr_import_into_duckdb_file() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("export.xml");
    let mut file = File::create(&source).unwrap();
    file.write_all(
        br#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:wp="http://wordpress.org/export/1.2/">
<channel>
<wp:author><wp:author_id>1</wp:author_id><wp:author_login>admin</wp:author_login></wp:author>
<item><title>One</title><wp:post_id>1</wp:post_id><category domain="category" nicename="news">News</category></item>
<item><title>Broken</titel></item>
<item><title>Two</title><guid>https://example.com/?p=42</guid></item>
</channel>
</rss>
"#,
    )
    .unwrap();

    let db_path = dir.path().join("staging.duckdb");
    let mut sink = DuckDbSink::open(db_path.to_str().unwrap()).unwrap();
    let run = Importer::new(&mut sink, config())
        .unwrap()
        .import_wxr(&source)
        .unwrap();

    assert_eq!(run.records_encountered, 4);
    assert_eq!(run.records_stored, 3);
    assert_eq!(run.records_failed, 1);
    assert!(run.is_balanced());
    assert_eq!(sink.count("posts").unwrap(), 2);
    assert_eq!(sink.count("users").unwrap(), 1);
    assert_eq!(sink.count("import_failures").unwrap(), 1);

    let ids: Vec<Option<String>> = sink
        .fetch_rows("posts", 0, 10)
        .unwrap()
        .into_iter()
        .map(|row| row[0].clone())
        .collect();
    assert_eq!(ids, vec![Some("1".to_string()), Some("42".to_string())]);
}

#[test]
fn test_csv_to_typed_table_in_duckdb() {
    let mut sink = DuckDbSink::memory().unwrap();
    let csv = "id,amount,shipped\n1,19.99,2024-01-15\n2,\"$1,200.50\",0000-00-00\n3,5,2024-03-02\n";
    Importer::new(&mut sink, config())
        .unwrap()
        .import_delimited_from(csv.as_bytes(), csv.len() as u64, "orders.csv", "orders")
        .unwrap();

    let report = TypeInferenceEngine::new(&mut sink, InferenceConfig::default())
        .run("orders")
        .unwrap();

    assert_eq!(
        report.column_type("amount"),
        Some(InferredType::Decimal {
            precision: 18,
            scale: 2
        })
    );
    assert_eq!(report.column_type("shipped"), Some(InferredType::Date));

    let rows = sink.fetch_rows("orders_typed", 0, 10).unwrap();
    let amounts: Vec<Option<String>> = rows.iter().map(|r| r[1].clone()).collect();
    assert_eq!(
        amounts,
        vec![
            Some("19.99".to_string()),
            Some("1200.50".to_string()),
            Some("5.00".to_string())
        ]
    );
    assert_eq!(rows[1][2], None);

    let rerun = TypeInferenceEngine::new(&mut sink, InferenceConfig::default())
        .run("orders")
        .unwrap();
    assert!(rerun.skipped);
    assert_eq!(sink.count("orders_typed").unwrap(), 3);
}
