use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use kconn_client::{encode_frame, BrokerConnection, ConnError, ConnectionConfig, ConnectionState};

struct Broker {
    port: u16,
    accepted: Arc<AtomicUsize>,
}

/// Accepts up to `connections` sockets, serving each on its own thread.
fn spawn_broker<F>(connections: usize, handler: F) -> Broker
where
    F: Fn(usize, &mut TcpStream) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);

    let counter = accepted.clone();
    thread::spawn(move || {
        for idx in 0..connections {
            let (mut stream, _) = listener.accept().expect("accept");
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
            let handler = handler.clone();
            thread::spawn(move || handler(idx, &mut stream));
        }
    });

    Broker { port, accepted }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let mut payload = vec![0u8; i32::from_be_bytes(header) as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_frame(payload, &mut buf).expect("encode");
    buf.to_vec()
}

fn echo_once(stream: &mut TcpStream) {
    if let Ok(payload) = read_request(stream) {
        let _ = stream.write_all(&frame(&payload));
        let _ = stream.flush();
    }
}

fn client(port: u16) -> BrokerConnection {
    let config =
        ConnectionConfig::new("127.0.0.1", port).with_timeout(Some(Duration::from_secs(5)));
    BrokerConnection::new(config).expect("client")
}

#[test]
fn round_trips_payloads_of_various_sizes() {
    let sizes = [0usize, 1, 4096, 1_000_000];
    let broker = spawn_broker(1, |_, stream| {
        for _ in 0..4 {
            echo_once(stream);
        }
    });

    let mut conn = client(broker.port);
    for (idx, size) in sizes.iter().enumerate() {
        let payload: Vec<u8> = (0..*size).map(|i| (i % 253) as u8).collect();
        let response = conn.request(idx as i32, &frame(&payload)).expect("request");
        assert_eq!(response.len(), *size);
        assert_eq!(&response[..], &payload[..]);
    }
    assert_eq!(broker.accepted.load(Ordering::SeqCst), 1);
}

#[test]
fn reassembles_fragmented_response() {
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 7) as u8).collect();
    let expected = payload.clone();
    let broker = spawn_broker(1, move |_, stream| {
        let _ = stream.set_nodelay(true);
        read_request(stream).expect("request");
        for chunk in frame(&payload).chunks(3) {
            stream.write_all(chunk).expect("write");
            stream.flush().expect("flush");
        }
    });

    let mut conn = client(broker.port);
    conn.send(7, &frame(b"fetch")).expect("send");
    let response = conn.recv(7).expect("recv");
    assert_eq!(&response[..], &expected[..]);
}

#[test]
fn peer_close_fails_recv_and_disconnects() {
    let broker = spawn_broker(1, |_, stream| {
        let _ = read_request(stream);
    });

    let mut conn = client(broker.port);
    conn.send(1, &frame(b"ping")).expect("send");
    let err = conn.recv(1).unwrap_err();
    assert!(err.is_connection_failure());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[test]
fn truncated_header_is_connection_failure() {
    let broker = spawn_broker(1, |_, stream| {
        let _ = read_request(stream);
        let _ = stream.write_all(&[0, 0]);
    });

    let mut conn = client(broker.port);
    let err = conn.request(1, &frame(b"ping")).unwrap_err();
    match err {
        ConnError::Connection { source, .. } => {
            assert_eq!(source.kind(), ErrorKind::UnexpectedEof)
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!conn.is_connected());
}

#[test]
fn negative_length_is_connection_failure() {
    let broker = spawn_broker(1, |_, stream| {
        let _ = read_request(stream);
        let _ = stream.write_all(&(-5i32).to_be_bytes());
        thread::sleep(Duration::from_millis(200));
    });

    let mut conn = client(broker.port);
    let err = conn.request(1, &frame(b"ping")).unwrap_err();
    assert!(err.is_connection_failure());
    assert!(!conn.is_connected());
}

#[test]
fn write_to_closed_peer_fails_send_and_disconnects() {
    let broker = spawn_broker(1, |_, _| {});

    let mut conn = client(broker.port);
    conn.reinitialize().expect("dial");
    while broker.accepted.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(10));
    }
    // Give the broker thread time to drop its end of the socket.
    thread::sleep(Duration::from_millis(200));

    let payload = vec![0xabu8; 64 * 1024];
    let mut failure = None;
    for idx in 0..200 {
        if let Err(err) = conn.send(idx, &payload) {
            failure = Some(err);
            break;
        }
    }

    let err = failure.expect("writes to a closed peer should eventually fail");
    assert!(err.is_connection_failure());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(broker.accepted.load(Ordering::SeqCst), 1);
}

#[test]
fn read_timeout_fails_recv_and_disconnects() {
    let broker = spawn_broker(1, |_, stream| {
        let _ = read_request(stream);
        thread::sleep(Duration::from_secs(2));
    });

    let config = ConnectionConfig::new("127.0.0.1", broker.port)
        .with_timeout(Some(Duration::from_millis(100)));
    let mut conn = BrokerConnection::new(config).expect("client");

    let started = Instant::now();
    let err = conn.request(1, &frame(b"never answered")).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    match &err {
        ConnError::Connection { source, .. } => assert!(matches!(
            source.kind(),
            ErrorKind::WouldBlock | ErrorKind::TimedOut
        )),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[test]
fn zero_timeout_is_rejected_before_dialing() {
    let config = ConnectionConfig::new("127.0.0.1", 9092).with_timeout(Some(Duration::ZERO));
    let err = BrokerConnection::connect(config).unwrap_err();
    assert!(err.is_configuration_error());
}

#[test]
fn failure_then_exactly_one_redial() {
    let broker = spawn_broker(2, |idx, stream| {
        if idx == 0 {
            let _ = read_request(stream);
        } else {
            echo_once(stream);
        }
    });

    let mut conn = client(broker.port);
    assert!(conn.request(1, &frame(b"first")).is_err());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(broker.accepted.load(Ordering::SeqCst), 1);

    let response = conn.request(2, &frame(b"second")).expect("request after redial");
    assert_eq!(&response[..], b"second");
    assert_eq!(broker.accepted.load(Ordering::SeqCst), 2);
    assert!(conn.is_connected());
}

#[test]
fn clone_is_disconnected_and_dials_its_own_socket() {
    let broker = spawn_broker(2, |_, stream| echo_once(stream));

    let config =
        ConnectionConfig::new("127.0.0.1", broker.port).with_timeout(Some(Duration::from_secs(5)));
    let mut conn = BrokerConnection::connect(config).expect("connect");
    assert!(conn.is_connected());

    let mut copy = conn.clone();
    assert_eq!(copy.state(), ConnectionState::Disconnected);

    let worker = thread::spawn(move || {
        let response = copy.request(2, &frame(b"from worker")).expect("worker request");
        assert!(copy.is_connected());
        response
    });
    let worker_response = worker.join().expect("join");
    assert_eq!(&worker_response[..], b"from worker");

    let response = conn.request(1, &frame(b"from owner")).expect("owner request");
    assert_eq!(&response[..], b"from owner");
    assert_eq!(broker.accepted.load(Ordering::SeqCst), 2);
}

#[test]
fn reinitialize_replaces_live_socket() {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let broker = spawn_broker(2, move |idx, stream| {
        if idx == 0 {
            let mut buf = [0u8; 1];
            let eof = matches!(stream.read(&mut buf), Ok(0));
            let _ = tx.lock().expect("lock").send(eof);
        } else {
            echo_once(stream);
        }
    });

    let mut conn = client(broker.port);
    conn.reinitialize().expect("first dial");
    conn.reinitialize().expect("second dial");
    let first_closed = rx.recv_timeout(Duration::from_secs(5)).expect("first socket result");
    assert!(first_closed, "first socket should see an orderly close");

    let response = conn.request(3, &frame(b"fresh")).expect("request");
    assert_eq!(&response[..], b"fresh");
    assert_eq!(broker.accepted.load(Ordering::SeqCst), 2);
}

#[test]
fn refused_dial_leaves_connection_disconnected() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };

    let mut conn = client(port);
    let err = conn.reinitialize().unwrap_err();
    assert!(err.is_connection_failure());
    assert!(!conn.is_connected());

    let err = conn.send(1, b"anything").unwrap_err();
    assert!(err.is_connection_failure());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[test]
fn bogus_tls_key_fails_before_any_socket_io() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");
    let port = listener.local_addr().expect("addr").port();

    let config = ConnectionConfig::new("127.0.0.1", port)
        .with_tls_option("security.protocol", "SSL")
        .with_tls_option("bogus", "true");
    let err = BrokerConnection::connect(config).unwrap_err();
    assert!(matches!(err, ConnError::UnsupportedTlsOption { ref key } if key == "bogus"));

    let accept = listener.accept();
    assert!(matches!(accept, Err(ref e) if e.kind() == ErrorKind::WouldBlock));
}

#[test]
fn close_is_idempotent() {
    let broker = spawn_broker(1, |_, stream| echo_once(stream));

    let mut conn = client(broker.port);
    conn.close();
    conn.reinitialize().expect("dial");
    conn.close();
    conn.close();
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}
