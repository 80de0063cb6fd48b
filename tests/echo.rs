//! Integration tests: echo server using real TCP connections.
//!
//! Each test launches a server on a loop thread, connects via std TCP,
//! sends data, and verifies the echoed response.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use eventline::{EventLoopThread, ServerConfig, TcpServer};

// ── Helpers ─────────────────────────────────────────────────────────

fn start_echo_server(io_threads: usize) -> (EventLoopThread, Arc<TcpServer>, SocketAddr) {
    let base = EventLoopThread::start("echo-base", None).expect("loop thread");
    let config = ServerConfig {
        io_threads,
        ..Default::default()
    };
    let server = TcpServer::new(
        base.handle(),
        "127.0.0.1:0".parse().unwrap(),
        "echo",
        config,
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

fn wait_for_server(addr: &SocketAddr) {
    for _ in 0..200 {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not start on {addr}");
}

fn echo_round_trip(addr: &SocketAddr, msg: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(msg).unwrap();
    stream.flush().unwrap();

    let mut buf = vec![0u8; msg.len()];
    let mut total = 0;
    while total < msg.len() {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("read error: {e}"),
        }
    }
    buf.truncate(total);
    buf
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn echo_small_message() {
    let (_base, _server, addr) = start_echo_server(0);

    let msg = b"Hello, eventline!";
    let response = echo_round_trip(&addr, msg);
    assert_eq!(response, msg);
}

#[test]
fn echo_large_message() {
    let (_base, _server, addr) = start_echo_server(0);

    // Larger than the buffer's initial size and the 64 KiB readv overflow
    // area, so the scatter-read spill path is exercised.
    let msg: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
    let response = echo_round_trip(&addr, &msg);
    assert_eq!(response, msg);
}

#[test]
fn echo_multiple_connections_across_pool() {
    let (_base, _server, addr) = start_echo_server(2);

    let mut join_handles = Vec::new();
    for i in 0..8 {
        join_handles.push(std::thread::spawn(move || {
            let msg = format!("connection {i}");
            let response = echo_round_trip(&addr, msg.as_bytes());
            assert_eq!(response, msg.as_bytes());
        }));
    }
    for handle in join_handles {
        handle.join().unwrap();
    }
}

#[test]
fn echo_sequential_sends() {
    let (_base, _server, addr) = start_echo_server(0);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    for i in 0..10 {
        let msg = format!("msg-{i}\n");
        stream.write_all(msg.as_bytes()).unwrap();
        stream.flush().unwrap();

        let mut buf = vec![0u8; msg.len()];
        let mut total = 0;
        while total < msg.len() {
            match stream.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => panic!("read error: {e}"),
            }
        }
        assert_eq!(&buf[..total], msg.as_bytes(), "mismatch on send {i}");
    }
}

#[test]
fn survives_abrupt_client_disconnects() {
    let (_base, _server, addr) = start_echo_server(0);

    // Open and immediately close 10 connections.
    for _ in 0..10 {
        let stream = TcpStream::connect(addr).unwrap();
        drop(stream);
    }
    std::thread::sleep(Duration::from_millis(200));

    // The server must still answer.
    let msg = b"still alive";
    let response = echo_round_trip(&addr, msg);
    assert_eq!(response, msg);
}

#[test]
fn server_drop_from_foreign_thread_leaves_loop_running() {
    let (base, server, addr) = start_echo_server(0);
    let response = echo_round_trip(&addr, b"before");
    assert_eq!(response, b"before");

    // Dropping the server here, off the loop thread, must marshal the
    // acceptor teardown onto the loop instead of panicking mid-drop.
    drop(server);
    std::thread::sleep(Duration::from_millis(100));

    // A loop thread that died unwinding a destructor would never answer.
    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    base.handle().queue_in_loop(move || {
        let _ = tx.send(());
    });
    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
}

#[test]
fn server_start_is_idempotent() {
    let (_base, server, addr) = start_echo_server(0);
    server.start().expect("second start");
    server.start().expect("third start");

    let response = echo_round_trip(&addr, b"once");
    assert_eq!(response, b"once");
}
