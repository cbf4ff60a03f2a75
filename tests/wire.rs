use std::net::SocketAddr;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};

use chairbook::clock::FixedClock;
use chairbook::notify::{LogNotifier, NotificationDispatcher};
use chairbook::policy::CancellationPolicy;
use chairbook::registry::{DEFAULT_STORAGE_TIMEOUT, SlotRegistry};
use chairbook::service::SchedulingService;
use chairbook::validator::{BookingRules, ReservationValidator};
use chairbook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(name: &str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join("chairbook_int_wire");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);

    let registry = Arc::new(SlotRegistry::open(&path, DEFAULT_STORAGE_TIMEOUT).unwrap());
    let now = NaiveDate::from_ymd_opt(2025, 3, 1)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap();
    let (notifications, _) = NotificationDispatcher::spawn(Arc::new(LogNotifier));
    let service = Arc::new(SchedulingService::new(
        registry,
        Arc::new(FixedClock::new(now)),
        ReservationValidator::new(BookingRules::default()),
        CancellationPolicy::default(),
        notifications,
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let svc = service.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, svc, "chairbook".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("chairbook")
        .user("frontend")
        .password("chairbook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn insert(client: &str, date: &str, time: &str) -> String {
    format!(
        "INSERT INTO reservations (client_id, date, slot_time, services, total, phone, contact_email) \
         VALUES ('{client}', '{date}', '{time}', '[\"corte\"]', '50.00', '(11) 91234-5678', '{client}@example.com')"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_query_and_cancel_over_the_wire() {
    let addr = start_test_server("book_query_cancel.wal").await;
    let client = connect(addr).await;

    let inserted = rows(client.simple_query(&insert("ana", "2025-03-10", "14:00:00")).await.unwrap());
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].get("id"), Some("1"));

    let occupied = rows(
        client
            .simple_query("SELECT * FROM occupied WHERE date = '2025-03-10'")
            .await
            .unwrap(),
    );
    assert_eq!(occupied.len(), 1);
    assert_eq!(occupied[0].get("slot_time"), Some("14:00"));

    let mine = rows(
        client
            .simple_query("SELECT * FROM reservations WHERE client_id = 'ana'")
            .await
            .unwrap(),
    );
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("services"), Some("[\"corte\"]"));
    assert_eq!(mine[0].get("total"), Some("50.00"));
    assert_eq!(mine[0].get("status"), Some("active"));
    assert_eq!(mine[0].get("cancelled_at"), None);

    client
        .simple_query("DELETE FROM reservations WHERE id = 1 AND client_id = 'ana'")
        .await
        .unwrap();
    let all = rows(client.simple_query("SELECT * FROM occupied").await.unwrap());
    assert!(all.is_empty());
}

#[tokio::test]
async fn rule_violations_carry_sqlstate() {
    let addr = start_test_server("sqlstate.wal").await;
    let client = connect(addr).await;

    client
        .simple_query(&insert("ana", "2025-03-10", "14:00"))
        .await
        .unwrap();

    let err = client
        .simple_query(&insert("bia", "2025-03-10", "14:00"))
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("23505"));

    let err = client
        .simple_query(&insert("ana", "2025-03-20", "14:00"))
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("P0001"));
    let message = err.as_db_error().map(|e| e.message().to_string()).unwrap_or_default();
    assert!(message.contains("2025-03-25"), "{message}");

    let err = client
        .simple_query("DELETE FROM reservations WHERE id = 1 AND client_id = 'bia'")
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("42501"));

    let err = client
        .simple_query(&insert("caio", "2025-03-10", "25:00"))
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("22023"));

    let err = client.simple_query("SELECT * FROM barbers").await.unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("42601"));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server("extended.wal").await;
    let client = connect(addr).await;

    client
        .execute(
            "INSERT INTO reservations VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &"ana",
                &"2025-03-11",
                &"10:00",
                &"corte,barba",
                &"70",
                &"11999990000",
                &"ana@example.com",
            ],
        )
        .await
        .unwrap();

    let rows = client
        .query(
            "SELECT * FROM reservations WHERE client_id = $1",
            &[&"ana"],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let services: String = rows[0].get("services");
    assert_eq!(services, "[\"corte\",\"barba\"]");
    let status: String = rows[0].get("status");
    assert_eq!(status, "active");
}

#[tokio::test]
async fn bound_text_that_looks_like_a_placeholder_stays_literal() {
    let addr = start_test_server("placeholder_text.wal").await;
    let client = connect(addr).await;

    client
        .execute(
            "INSERT INTO reservations VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &"ana",
                &"2025-03-12",
                &"11:00",
                &"corte",
                &"50",
                &"$1 ext. 2",
                &"",
            ],
        )
        .await
        .unwrap();

    let rows = client
        .query("SELECT * FROM reservations WHERE client_id = $1", &[&"ana"])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let phone: String = rows[0].get("phone");
    assert_eq!(phone, "$1 ext. 2");
}
