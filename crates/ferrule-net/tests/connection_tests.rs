//! Tests for stream connection behavior.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use ferrule_net::{Connection, ConnectionConfig};
use parking_lot::Mutex;

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// A broken-callback recorder: how many times it fired and the last flag.
fn broken_recorder() -> (Arc<AtomicUsize>, Arc<AtomicBool>, impl Fn(bool) + Send + Sync) {
    let count = Arc::new(AtomicUsize::new(0));
    let graceful = Arc::new(AtomicBool::new(false));
    let count_clone = Arc::clone(&count);
    let graceful_clone = Arc::clone(&graceful);
    let callback = move |was_graceful: bool| {
        count_clone.fetch_add(1, Ordering::SeqCst);
        graceful_clone.store(was_graceful, Ordering::SeqCst);
    };
    (count, graceful, callback)
}

#[test]
fn connection_config_builder() {
    let config = ConnectionConfig::new()
        .close_on_send_backpressure(true)
        .connect_timeout(Duration::from_secs(5));
    assert!(config.close_on_send_backpressure);
    assert_eq!(config.connect_timeout, Some(Duration::from_secs(5)));

    let defaults = ConnectionConfig::default();
    assert!(!defaults.close_on_send_backpressure);
    assert_eq!(defaults.connect_timeout, Some(Duration::from_secs(30)));

    assert_eq!(
        ConnectionConfig::new().no_connect_timeout().connect_timeout,
        None
    );
}

#[test]
fn connection_initial_state() {
    let connection = Connection::new();
    assert!(!connection.is_connected());
    assert_eq!(connection.bound_port(), 0);
    assert_eq!(connection.peer_port(), 0);
}

#[test]
fn connect_reports_local_and_peer_addresses() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let listener_port = listener.local_addr().unwrap().port();

    let connection = Connection::new();
    assert!(connection.connect(Ipv4Addr::LOCALHOST, listener_port));
    assert!(connection.is_connected());
    assert_eq!(connection.bound_address(), Ipv4Addr::LOCALHOST);
    assert_ne!(connection.bound_port(), 0);
    assert_eq!(connection.peer_address(), Ipv4Addr::LOCALHOST);
    assert_eq!(connection.peer_port(), listener_port);

    let (_accepted, peer) = listener.accept().unwrap();
    assert_eq!(peer.port(), connection.bound_port());
}

#[test]
fn connect_to_dead_port_fails() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let connection = Connection::new();
    assert!(!connection.connect(Ipv4Addr::LOCALHOST, port));
    assert!(!connection.is_connected());
}

#[test]
fn process_before_connect_fails() {
    let connection = Connection::new();
    assert!(!connection.process(|_| {}, |_| {}));
}

#[test]
fn repeated_process_is_a_warning_not_an_error() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let connection = Connection::new();
    assert!(connection.connect(Ipv4Addr::LOCALHOST, listener.local_addr().unwrap().port()));
    let (_accepted, _) = listener.accept().unwrap();

    assert!(connection.process(|_| {}, |_| {}));
    assert!(connection.process(|_| {}, |_| {}));
    connection.close(false);
}

#[test]
fn messages_are_sent_in_enqueue_order() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let connection = Connection::new();
    assert!(connection.connect(Ipv4Addr::LOCALHOST, listener.local_addr().unwrap().port()));
    let (mut accepted, _) = listener.accept().unwrap();
    accepted
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    assert!(connection.process(|_| {}, |_| {}));
    connection.send_message(b"one ".to_vec());
    connection.send_message(b"two ".to_vec());
    connection.send_message(b"three".to_vec());

    let mut received = [0u8; 13];
    accepted.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"one two three");
}

#[test]
fn received_bytes_arrive_in_order() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let connection = Connection::new();
    assert!(connection.connect(Ipv4Addr::LOCALHOST, listener.local_addr().unwrap().port()));
    let (mut accepted, _) = listener.accept().unwrap();

    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);
    assert!(connection.process(
        move |bytes| received_clone.lock().extend(bytes),
        |_| {},
    ));

    accepted.write_all(b"Hello, ").unwrap();
    accepted.write_all(b"World").unwrap();

    assert!(wait_until(|| received.lock().len() >= 12));
    assert_eq!(&*received.lock(), b"Hello, World");
}

#[test]
fn graceful_close_drains_queued_data_before_fin() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let connection = Connection::new();
    assert!(connection.connect(Ipv4Addr::LOCALHOST, listener.local_addr().unwrap().port()));
    let (mut accepted, _) = listener.accept().unwrap();
    accepted
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let (broken_count, broken_graceful, broken) = broken_recorder();
    assert!(connection.process(|_| {}, broken));

    let payload = vec![0xAB; 100 * 1024];
    connection.send_message(payload.clone());
    connection.close(true);

    // Every queued byte must arrive before the end-of-stream marker.
    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match accepted.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => received.extend_from_slice(&chunk[..read]),
            Err(e) => panic!("read failed: {e}"),
        }
    }
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);

    // Close our side too; the connection then finishes its sequence.
    drop(accepted);
    assert!(wait_until(|| broken_count.load(Ordering::SeqCst) == 1));
    assert!(!broken_graceful.load(Ordering::SeqCst));
    assert!(wait_until(|| !connection.is_connected()));

    // The notification never repeats.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(broken_count.load(Ordering::SeqCst), 1);
}

#[test]
fn abrupt_peer_close_notifies_once_and_disconnects() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let connection = Connection::new();
    assert!(connection.connect(Ipv4Addr::LOCALHOST, listener.local_addr().unwrap().port()));
    let (accepted, _) = listener.accept().unwrap();

    let (broken_count, broken_graceful, broken) = broken_recorder();
    assert!(connection.process(|_| {}, broken));

    // Reset-on-close so the peer ends the session abruptly.
    socket2::SockRef::from(&accepted)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(accepted);

    assert!(wait_until(|| broken_count.load(Ordering::SeqCst) == 1));
    assert!(!broken_graceful.load(Ordering::SeqCst));
    assert!(wait_until(|| !connection.is_connected()));

    // Sending now quietly goes nowhere.
    connection.send_message(b"into the void".to_vec());
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(broken_count.load(Ordering::SeqCst), 1);
}

#[test]
fn peer_fin_notifies_gracefully() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let connection = Connection::new();
    assert!(connection.connect(Ipv4Addr::LOCALHOST, listener.local_addr().unwrap().port()));
    let (accepted, _) = listener.accept().unwrap();

    let (broken_count, broken_graceful, broken) = broken_recorder();
    assert!(connection.process(|_| {}, broken));

    drop(accepted);

    assert!(wait_until(|| broken_count.load(Ordering::SeqCst) == 1));
    assert!(broken_graceful.load(Ordering::SeqCst));
    // Our side of the session is still up; we may keep sending or close.
    assert!(connection.is_connected());

    connection.close(false);
    assert!(!connection.is_connected());
    assert_eq!(broken_count.load(Ordering::SeqCst), 1);
}

#[test]
fn closing_from_a_receive_callback_does_not_deadlock() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let connection = Connection::new();
    assert!(connection.connect(Ipv4Addr::LOCALHOST, listener.local_addr().unwrap().port()));
    let (mut accepted, _) = listener.accept().unwrap();

    let (broken_count, _, broken) = broken_recorder();
    let connection_in_callback = connection.clone();
    assert!(connection.process(
        move |_bytes| connection_in_callback.close(false),
        broken,
    ));

    accepted.write_all(b"trigger").unwrap();

    assert!(wait_until(|| !connection.is_connected()));
    assert!(wait_until(|| broken_count.load(Ordering::SeqCst) == 1));
}

#[test]
fn reconnect_after_close() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let connection = Connection::new();
    assert!(connection.connect(Ipv4Addr::LOCALHOST, port));
    let (_first, _) = listener.accept().unwrap();
    connection.close(false);
    assert!(!connection.is_connected());

    assert!(connection.connect(Ipv4Addr::LOCALHOST, port));
    let (mut second, _) = listener.accept().unwrap();
    second
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    assert!(connection.process(|_| {}, |_| {}));
    connection.send_message(b"again".to_vec());

    let mut received = [0u8; 5];
    second.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"again");
}
