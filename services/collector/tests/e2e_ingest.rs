//! End-to-end: the client library speaking to a live collector over TCP,
//! samples landing in the domain's SQLite database.

use std::sync::Arc;
use std::time::Duration;

use omsp_client::Client;
use omsp_protocol::{FieldDef, Value, ValueKind};
use tokio::net::TcpListener;
use tokio::sync::watch;

use collector::database::Registry;

async fn start_server(dir: &std::path::Path) -> (std::net::SocketAddr, watch::Sender<bool>) {
    let registry = Arc::new(Registry::new(dir.to_path_buf()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(collector::server::run(
        listener,
        registry,
        Duration::from_secs(10),
        stop_rx,
    ));
    (addr, stop_tx)
}

fn client_args(addr: std::net::SocketAddr, domain: &str, extra: &[&str]) -> Vec<String> {
    let mut args = vec![
        "--oml-collect".to_owned(),
        format!("tcp:127.0.0.1:{}", addr.port()),
        "--oml-id".to_owned(),
        "n1".to_owned(),
        "--oml-domain".to_owned(),
        domain.to_owned(),
    ];
    args.extend(extra.iter().map(|s| (*s).to_owned()));
    args
}

/// Poll the domain database until the query returns the expected count.
fn wait_for_rows(path: &std::path::Path, sql: &str, want: i64) -> bool {
    for _ in 0..100 {
        if let Ok(conn) = rusqlite::Connection::open(path) {
            if let Ok(n) = conn.query_row(sql, [], |r| r.get::<_, i64>(0)) {
                if n == want {
                    return true;
                }
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn text_client_samples_reach_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, stop) = start_server(dir.path()).await;

    let args = client_args(addr, "e2etext", &["--oml-text"]);
    tokio::task::spawn_blocking(move || {
        let (client, _) = Client::init("app", &args).unwrap();
        let mp = client
            .add_mp(
                "m",
                &[
                    FieldDef::new("v", ValueKind::Int32),
                    FieldDef::new("label", ValueKind::String),
                ],
            )
            .unwrap();
        client.start().unwrap();
        for i in 0..5 {
            client
                .inject(
                    &mp,
                    &[Value::Int32(i), Value::String(format!("tag\t{i}"))],
                )
                .unwrap();
        }
        client.close();
    })
    .await
    .unwrap();

    let db = dir.path().join("e2etext.sq3");
    assert!(
        wait_for_rows(&db, "SELECT COUNT(*) FROM app_m", 5),
        "samples never reached the database"
    );
    let conn = rusqlite::Connection::open(&db).unwrap();
    let (v, label): (i64, String) = conn
        .query_row(
            "SELECT v, label FROM app_m WHERE oml_seq = 3",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(v, 2);
    assert_eq!(label, "tag\t2");
    let _ = stop.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binary_client_samples_reach_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, stop) = start_server(dir.path()).await;

    // TCP defaults to the binary encoding.
    let args = client_args(addr, "e2ebin", &[]);
    tokio::task::spawn_blocking(move || {
        let (client, _) = Client::init("app", &args).unwrap();
        let mp = client
            .add_mp(
                "radio",
                &[
                    FieldDef::new("rssi", ValueKind::Double),
                    FieldDef::new("payload", ValueKind::Blob),
                ],
            )
            .unwrap();
        client.start().unwrap();
        for i in 0..10 {
            client
                .inject(
                    &mp,
                    &[
                        Value::Double(f64::from(i) / 2.0),
                        Value::Blob(vec![i as u8; 16]),
                    ],
                )
                .unwrap();
        }
        client.close();
    })
    .await
    .unwrap();

    let db = dir.path().join("e2ebin.sq3");
    assert!(
        wait_for_rows(&db, "SELECT COUNT(*) FROM app_radio", 10),
        "samples never reached the database"
    );
    let conn = rusqlite::Connection::open(&db).unwrap();
    let (rssi, payload): (f64, Vec<u8>) = conn
        .query_row(
            "SELECT rssi, payload FROM app_radio WHERE oml_seq = 10",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert!((rssi - 4.5).abs() < 1e-9);
    assert_eq!(payload, vec![9u8; 16]);
    let _ = stop.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_stream_declaration_reaches_new_table() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, stop) = start_server(dir.path()).await;

    let args = client_args(addr, "e2elate", &["--oml-text"]);
    tokio::task::spawn_blocking(move || {
        let (client, _) = Client::init("app", &args).unwrap();
        let m1 = client
            .add_mp("m1", &[FieldDef::new("a", ValueKind::Int32)])
            .unwrap();
        client.start().unwrap();
        client.inject(&m1, &[Value::Int32(1)]).unwrap();

        let m2 = client
            .add_mp("m2", &[FieldDef::new("y", ValueKind::UInt64)])
            .unwrap();
        client.inject(&m2, &[Value::UInt64(42)]).unwrap();
        client.close();
    })
    .await
    .unwrap();

    let db = dir.path().join("e2elate.sq3");
    assert!(
        wait_for_rows(&db, "SELECT COUNT(*) FROM app_m2", 1),
        "late-declared stream never reached the database"
    );
    let conn = rusqlite::Connection::open(&db).unwrap();
    let y: i64 = conn
        .query_row("SELECT y FROM app_m2", [], |r| r.get(0))
        .unwrap();
    assert_eq!(y, 42);
    let _ = stop.send(true);
}
