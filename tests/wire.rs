use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use slotbook::engine::Engine;
use slotbook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("slotbook.wal")).unwrap());

    let served = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = served.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotbook")
        .user("slotbook");

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

async fn query(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    rows(client.simple_query(sql).await.unwrap())
}

/// Create an event with one slot per capacity; returns (event_id, slot_ids).
async fn create_event(client: &tokio_postgres::Client, capacities: &[u32]) -> (String, Vec<String>) {
    let slots: Vec<String> = capacities
        .iter()
        .enumerate()
        .map(|(i, cap)| {
            format!(
                r#"{{"start_time": "2031-03-01T{i:02}:00:00Z", "end_time": "2031-03-01T{i:02}:30:00Z", "max_bookings": {cap}}}"#
            )
        })
        .collect();
    let created = query(
        client,
        &format!(
            "INSERT INTO events (title, description, creator_name, creator_email, time_slots) VALUES ('Workshop', 'Hands-on', 'Grace', 'grace@example.com', '[{}]')",
            slots.join(",")
        ),
    )
    .await;
    assert_eq!(created.len(), 1);
    let row = &created[0];
    assert_eq!(row.get("title"), Some("Workshop"));

    let json: serde_json::Value = serde_json::from_str(row.get("time_slots").unwrap()).unwrap();
    let slot_ids = json
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap().to_string())
        .collect();
    (row.get("id").unwrap().to_string(), slot_ids)
}

fn booking_sql(event_id: &str, slot_id: &str, email: &str) -> String {
    format!(
        "INSERT INTO bookings (event_id, time_slot_id, attendee_name, attendee_email) VALUES ('{event_id}', '{slot_id}', 'Attendee', '{email}')"
    )
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.as_db_error().map(|db| db.code().code())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_until_full_over_the_wire() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (event_id, slot_ids) = create_event(&client, &[1]).await;

    let booked = query(&client, &booking_sql(&event_id, &slot_ids[0], "a@x.com")).await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("event_title"), Some("Workshop"));
    assert_eq!(booked[0].get("attendee_email"), Some("a@x.com"));

    let slot = query(&client, &format!("SELECT * FROM time_slots WHERE id = '{}'", slot_ids[0])).await;
    assert_eq!(slot[0].get("current_bookings"), Some("1"));

    let full = client
        .simple_query(&booking_sql(&event_id, &slot_ids[0], "b@x.com"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&full), Some("53400"));
}

#[tokio::test]
async fn duplicate_booking_is_a_conflict() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (event_id, slot_ids) = create_event(&client, &[2]).await;

    assert_ok!(client.batch_execute(&booking_sql(&event_id, &slot_ids[0], "a@x.com")).await);
    let dup = client
        .batch_execute(&booking_sql(&event_id, &slot_ids[0], "a@x.com"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&dup), Some("23505"));
}

#[tokio::test]
async fn cancel_requires_matching_email() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let (event_id, slot_ids) = create_event(&client, &[3]).await;

    let booked = query(&client, &booking_sql(&event_id, &slot_ids[0], "a@x.com")).await;
    let booking_id = booked[0].get("id").unwrap().to_string();

    let wrong = client
        .batch_execute(&format!(
            "DELETE FROM bookings WHERE id = '{booking_id}' AND attendee_email = 'b@x.com'"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&wrong), Some("P0002"));

    assert_ok!(
        client
            .batch_execute(&format!(
                "DELETE FROM bookings WHERE id = '{booking_id}' AND attendee_email = 'a@x.com'"
            ))
            .await
    );
    let slot_id = Ulid::from_string(&slot_ids[0]).unwrap();
    assert_eq!(engine.get_time_slot(slot_id).await.unwrap().current_bookings, 0);

    let mine = query(&client, "SELECT * FROM bookings WHERE attendee_email = 'a@x.com'").await;
    assert!(mine.is_empty());
}

#[tokio::test]
async fn override_is_repaired_on_next_read() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (event_id, slot_ids) = create_event(&client, &[5, 5]).await;
    assert_ok!(client.batch_execute(&booking_sql(&event_id, &slot_ids[1], "a@x.com")).await);

    assert_ok!(
        client
            .batch_execute(&format!(
                "UPDATE time_slots SET current_bookings = 4 WHERE id = '{}'",
                slot_ids[1]
            ))
            .await
    );

    let slots = query(&client, &format!("SELECT * FROM time_slots WHERE event_id = '{event_id}'")).await;
    let counts: Vec<_> = slots.iter().map(|r| r.get("current_bookings").unwrap().to_string()).collect();
    assert_eq!(counts, vec!["0", "1"]);
}

#[tokio::test]
async fn update_list_and_delete_events() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (event_id, _) = create_event(&client, &[1]).await;

    let updated = query(
        &client,
        &format!("UPDATE events SET title = 'Renamed' WHERE id = '{event_id}'"),
    )
    .await;
    assert_eq!(updated[0].get("title"), Some("Renamed"));
    assert_eq!(updated[0].get("description"), Some("Hands-on"));

    let listed = query(&client, "SELECT * FROM events").await;
    assert_eq!(listed.len(), 1);
    let with_slots = query(&client, "SELECT * FROM events_with_slots").await;
    assert_eq!(with_slots.len(), 1);

    assert_ok!(client.batch_execute(&format!("DELETE FROM events WHERE id = '{event_id}'")).await);
    let missing = client
        .simple_query(&format!("SELECT * FROM events WHERE id = '{event_id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&missing), Some("P0002"));
}

#[tokio::test]
async fn invalid_input_and_bad_sql_are_distinguished() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let empty_slots = client
        .batch_execute("INSERT INTO events (title, description, creator_name, creator_email, time_slots) VALUES ('T', 'D', 'N', 'n@example.com', '[]')")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&empty_slots), Some("22023"));

    let bad_json = client
        .batch_execute("INSERT INTO events (title, description, creator_name, creator_email, time_slots) VALUES ('T', 'D', 'N', 'n@example.com', '{')")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&bad_json), Some("22023"));

    let garbage = client.batch_execute("SELEC nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&garbage), Some("42601"));

    assert_err!(client.batch_execute("SELECT * FROM resources").await);
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (event_id, slot_ids) = create_event(&client, &[2]).await;

    let booked = client
        .query(
            "INSERT INTO bookings (event_id, time_slot_id, attendee_name, attendee_email) VALUES ($1, $2, $3, $4)",
            &[&event_id, &slot_ids[0], &"Ada", &"ada@example.com"],
        )
        .await
        .unwrap();
    assert_eq!(booked.len(), 1);
    let email: &str = booked[0].get("attendee_email");
    assert_eq!(email, "ada@example.com");

    let on_event = client
        .query("SELECT * FROM bookings WHERE event_id = $1", &[&event_id])
        .await
        .unwrap();
    assert_eq!(on_event.len(), 1);
    let title: &str = on_event[0].get("event_title");
    assert_eq!(title, "Workshop");
}

#[tokio::test]
async fn parameter_values_are_bound_verbatim() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let slots = r#"[{"start_time": "2031-04-01T09:00:00Z", "end_time": "2031-04-01T10:00:00Z", "max_bookings": 3}]"#;
    let created = client
        .query(
            "INSERT INTO events (title, description, creator_name, creator_email, time_slots) VALUES ($1, $2, $3, $4, $5)",
            &[&"Pricing $2", &"Tickets cost $1 each", &"O'Brien", &"cash$1@example.com", &slots],
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    let title: &str = created[0].get("title");
    let description: &str = created[0].get("description");
    let creator: &str = created[0].get("creator_name");
    let email: &str = created[0].get("creator_email");
    assert_eq!(title, "Pricing $2");
    assert_eq!(description, "Tickets cost $1 each");
    assert_eq!(creator, "O'Brien");
    assert_eq!(email, "cash$1@example.com");

    let event_id: &str = created[0].get("id");
    let event_id = event_id.to_string();
    let updated = client
        .query(
            "UPDATE events SET description = $1 WHERE id = $2",
            &[&"now $2 off", &event_id],
        )
        .await
        .unwrap();
    let description: &str = updated[0].get("description");
    assert_eq!(description, "now $2 off");
}

#[tokio::test]
async fn filtered_event_select_matches_its_description() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (event_id, _) = create_event(&client, &[1]).await;

    let listed = client
        .query("SELECT * FROM events WHERE title = $1", &[&"Workshop"])
        .await
        .unwrap();
    assert!(!listed.is_empty());
    assert_eq!(listed[0].len(), 7);

    let one = client
        .query("SELECT * FROM events WHERE id = $1", &[&event_id])
        .await
        .unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].len(), 8);
}

#[tokio::test]
async fn admitted_booking_carries_confirmation() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (event_id, slot_ids) = create_event(&client, &[1]).await;

    let booked = query(&client, &booking_sql(&event_id, &slot_ids[0], "ada@example.com")).await;
    assert_eq!(booked[0].get("message"), Some("Booking successful!"));
    assert_eq!(booked[0].get("attendee_email"), Some("ada@example.com"));
}
