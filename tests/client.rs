//! Client-side tests: TcpClient round trip against a live server, graceful
//! disconnect, and connector retry backoff against a dead port.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use eventline::{Connector, EventLoopThread, ServerConfig, TcpClient, TcpServer};

fn wait_for_server(addr: &SocketAddr) {
    for _ in 0..200 {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not start on {addr}");
}

fn start_echo_server() -> (EventLoopThread, Arc<TcpServer>, SocketAddr) {
    let base = EventLoopThread::start("client-test-server", None).expect("loop thread");
    let server = TcpServer::new(
        base.handle(),
        "127.0.0.1:0".parse().unwrap(),
        "echo",
        ServerConfig::default(),
    )
    .expect("bind failed");
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let data = buf.retrieve_all_as_vec();
        conn.send(&data);
    }));
    server.start().expect("start failed");
    let addr = server.local_addr().expect("local addr");
    wait_for_server(&addr);
    (base, server, addr)
}

/// Bind a port and drop the listener, leaving nothing behind it.
fn dead_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[test]
fn client_round_trips_and_disconnects() {
    let (_server_loop, _server, addr) = start_echo_server();

    let client_loop = EventLoopThread::start("client", None).unwrap();
    let client = TcpClient::new(client_loop.handle(), addr, "pinger");

    let (events_tx, events_rx) = crossbeam_channel::bounded::<&'static str>(4);
    let (data_tx, data_rx) = crossbeam_channel::bounded::<Vec<u8>>(4);

    client.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            let _ = events_tx.send("up");
            conn.send(b"PING");
        } else {
            let _ = events_tx.send("down");
        }
    }));
    client.set_message_callback(Arc::new(move |_conn, buf, _when| {
        let _ = data_tx.send(buf.retrieve_all_as_vec());
    }));

    client.connect();
    assert_eq!(events_rx.recv_timeout(Duration::from_secs(2)), Ok("up"));
    assert_eq!(
        data_rx.recv_timeout(Duration::from_secs(2)).as_deref(),
        Ok(&b"PING"[..])
    );

    client.disconnect();
    assert_eq!(events_rx.recv_timeout(Duration::from_secs(2)), Ok("down"));
    // Let the deferred teardown run before the loops stop.
    std::thread::sleep(Duration::from_millis(100));
}

#[test]
fn client_exposes_connection_while_up() {
    let (_server_loop, _server, addr) = start_echo_server();

    let client_loop = EventLoopThread::start("client", None).unwrap();
    let client = TcpClient::new(client_loop.handle(), addr, "peeker");

    let (events_tx, events_rx) = crossbeam_channel::bounded::<&'static str>(4);
    client.set_connection_callback(Arc::new(move |conn| {
        let _ = events_tx.send(if conn.connected() { "up" } else { "down" });
    }));

    assert!(client.connection().is_none());
    client.connect();
    assert_eq!(events_rx.recv_timeout(Duration::from_secs(2)), Ok("up"));

    let conn = client.connection().expect("connection present");
    assert_eq!(conn.peer_addr(), addr);

    client.disconnect();
    assert_eq!(events_rx.recv_timeout(Duration::from_secs(2)), Ok("down"));
    std::thread::sleep(Duration::from_millis(100));
}

#[test]
fn connector_backs_off_against_dead_port() {
    let addr = dead_port();
    let base = EventLoopThread::start("connector", None).unwrap();

    let connector = Connector::new(base.handle().clone(), addr);
    connector.set_new_connection_callback(Box::new(|_fd| {
        panic!("connected to a dead port");
    }));
    assert_eq!(connector.retry_delay(), Duration::from_millis(500));

    connector.start();
    // First failure doubles the delay to 1 s, the retry at +500 ms doubles
    // it again; after ~1.3 s at least one doubling has happened.
    std::thread::sleep(Duration::from_millis(1300));
    assert!(connector.retry_delay() >= Duration::from_millis(1000));

    connector.stop();
    std::thread::sleep(Duration::from_millis(100));
}
