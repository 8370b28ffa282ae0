//! Builds an index and checks that serving queries from it gives the
//! same points as scanning the raw records.

use chrono::{TimeZone, Utc};
use futures::stream::{self, BoxStream};
use futures::StreamExt;

use dragnet::error::SourceError;
use dragnet::query::Breakdown;
use dragnet::record::Record;
use dragnet::scan::raw_scan;
use dragnet::storage::build_index;
use dragnet::{Filter, IndexConfig, IndexReader, Interval, QueryConfig};

fn sample_records() -> Vec<serde_json::Value> {
    let base = Utc.with_ymd_and_hms(2014, 5, 1, 0, 0, 0).unwrap().timestamp();
    let mut out = Vec::new();
    for i in 0..48 {
        let host = if i % 3 == 0 { "a" } else { "b" };
        let op = if i % 2 == 0 { "get" } else { "put" };
        out.push(serde_json::json!({
            "host": host,
            "op": op,
            "latency": (i * 7) % 90,
            "time": base + i * 1800,
        }));
    }
    out
}

fn record_stream() -> BoxStream<'static, Result<Record, SourceError>> {
    stream::iter(
        sample_records()
            .into_iter()
            .map(|v| Ok(v.as_object().cloned().unwrap()))
            .collect::<Vec<_>>(),
    )
    .boxed()
}

fn queries() -> Vec<QueryConfig> {
    let filter = Filter::parse(&serde_json::json!({"eq": ["op", "get"]})).unwrap();
    let bounds = (
        Utc.with_ymd_and_hms(2014, 5, 1, 3, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2014, 5, 1, 9, 0, 0).unwrap(),
    );
    let time = Some("time".to_string());
    vec![
        QueryConfig::new(None, vec![Breakdown::field("host")], None, time.clone()).unwrap(),
        QueryConfig::new(
            Some(filter.clone()),
            vec![Breakdown::field("host")],
            None,
            time.clone(),
        )
        .unwrap(),
        QueryConfig::new(
            None,
            vec![Breakdown::field("host"), Breakdown::quantize("latency")],
            None,
            time.clone(),
        )
        .unwrap(),
        QueryConfig::new(
            Some(filter),
            vec![Breakdown::lquantize("latency", 30)],
            Some(bounds),
            time.clone(),
        )
        .unwrap(),
        QueryConfig::new(None, vec![], Some(bounds), time).unwrap(),
    ]
}

#[tokio::test]
async fn index_agrees_with_raw_scan() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("requests.db");

    let index = IndexConfig::new(
        "requests",
        vec![
            Breakdown::field("host"),
            Breakdown::field("op"),
            Breakdown::field("latency"),
        ],
        None,
        Some(Interval::Hour),
        Some("time".to_string()),
    )
    .unwrap();

    let stats = build_index(record_stream(), &index, &path).await.unwrap();
    assert_eq!(stats.scan.records, 48);

    let reader = IndexReader::open(&path).unwrap();
    for query in queries() {
        let from_index = reader.query(&query).unwrap();
        let (from_scan, _) = raw_scan(record_stream(), &query).await.unwrap();
        assert_eq!(from_index, from_scan);
        assert!(!from_index.is_empty());
    }
}

#[tokio::test]
async fn filtered_metric_only_serves_its_own_filter() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gets.db");

    let filter = Filter::parse(&serde_json::json!({"eq": ["op", "get"]})).unwrap();
    let index = IndexConfig::new(
        "gets",
        vec![Breakdown::field("host")],
        Some(filter.clone()),
        None,
        None,
    )
    .unwrap();
    build_index(record_stream(), &index, &path).await.unwrap();

    let reader = IndexReader::open(&path).unwrap();

    let same = QueryConfig::new(
        Some(filter),
        vec![Breakdown::field("host")],
        None,
        None,
    )
    .unwrap();
    let (expected, _) = raw_scan(record_stream(), &same).await.unwrap();
    assert_eq!(reader.query(&same).unwrap(), expected);

    let unfiltered = QueryConfig::new(None, vec![Breakdown::field("host")], None, None).unwrap();
    assert!(reader.query(&unfiltered).is_err());
}
