//! Integration tests for the time-series store: concurrent writers, schema growth
//! and reopening a session file.

use peppermint::core::DataPoint;
use peppermint::error::ConsoleError;
use peppermint::store::TimeSeriesStore;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

#[test]
fn concurrent_writers_share_one_table() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TimeSeriesStore::open(dir.path().join("shared.db")).unwrap());
    let table = store.register_table("shared").unwrap();

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let store = store.clone();
            let table = table.clone();
            thread::spawn(move || {
                let column = format!("writer_{w}");
                for i in 0..50 {
                    store
                        .add_result(&table, &[DataPoint::new(column.as_str(), f64::from(i))])
                        .unwrap();
                }
                store.release_thread_connection();
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let data = store.get_table_values(&table).unwrap();
    assert_eq!(data.len(), 200);
    assert_eq!(data.columns().len(), 6);
    let ids = data.ids();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    for w in 0..4 {
        let values = store
            .get_column_values(&table, &format!("writer_{w}"))
            .unwrap()
            .unwrap();
        assert_eq!(values.iter().filter(|v| !v.is_null()).count(), 50);
    }
}

#[test]
fn session_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("session.db");
    {
        let store = TimeSeriesStore::open(&path).unwrap();
        let table = store.register_table("cooldown").unwrap();
        store
            .add_result(&table, &[DataPoint::new("ls336_A_temperature", 290.5)])
            .unwrap();
    }

    let store = TimeSeriesStore::open(&path).unwrap();
    assert_eq!(store.get_tables().unwrap(), vec!["cooldown".to_string()]);
    assert_eq!(store.register_table("cooldown").unwrap(), "cooldown_1");
    assert_eq!(store.register_table("cooldown").unwrap(), "cooldown_2");

    let tail = store.get_tail_values("cooldown", 10).unwrap();
    assert_eq!(tail.column("ls336_A_temperature").unwrap()[0].as_f64(), Some(290.5));
    assert!(tail.column("timestamp").unwrap()[0].as_str().is_some());
}

#[test]
fn reads_from_missing_tables_are_typed_errors() {
    let dir = TempDir::new().unwrap();
    let store = TimeSeriesStore::open(dir.path().join("empty.db")).unwrap();
    assert!(matches!(
        store.get_tail_values("nope", 5),
        Err(ConsoleError::UnknownTable(_))
    ));
    assert!(matches!(
        store.get_columns("nope"),
        Err(ConsoleError::UnknownTable(_))
    ));
}
