//! End-to-end checks against every backend available on this machine.

use nexus_httpd::config::{Config, RuntimeType};
use nexus_httpd::protocols::http::HttpResponder;
use nexus_httpd::runtime::{self, BindError, EngineError, ListenAddr, ServerHandle, Stats};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn runtimes() -> Vec<RuntimeType> {
    let mut out = vec![RuntimeType::Mio, RuntimeType::Tokio];
    if runtime::uring_supported() {
        out.push(RuntimeType::Uring);
    } else {
        eprintln!("io_uring unavailable, skipping that backend");
    }
    out
}

fn config(runtime: RuntimeType, listen: &str) -> Config {
    Config {
        listen: listen.parse().unwrap(),
        workers: 2,
        runtime,
        max_connections: 256,
        ring_size: 256,
        ..Config::default()
    }
}

fn start(config: &Config) -> ServerHandle {
    let stats = Arc::new(Stats::new());
    let responder = Arc::new(HttpResponder::from_config(config, Arc::clone(&stats)));
    runtime::spawn(config, responder, stats).unwrap()
}

fn tcp_addr(handle: &ServerHandle) -> SocketAddr {
    match handle.local_addr() {
        ListenAddr::Tcp(addr) => *addr,
        other => panic!("expected a TCP listener, got {}", other),
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream
}

/// Read one response, using Content-Length to find its end.
fn read_response<S: Read>(stream: &mut S) -> (String, String) {
    let mut out = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed mid-response: {:?}", String::from_utf8_lossy(&out));
        out.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&out).into_owned();
        if let Some((head, body)) = text.split_once("\r\n\r\n") {
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .expect("response without Content-Length");
            if body.len() >= len {
                assert_eq!(body.len(), len, "extra bytes after the body");
                return (head.to_string(), body.to_string());
            }
        }
    }
}

fn assert_eof<S: Read>(stream: &mut S) {
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "unexpected bytes: {:?}", rest);
}

fn stop(handle: ServerHandle) {
    handle.shutdown();
    handle.join().unwrap();
}

#[test]
fn test_concurrent_clients() {
    for rt in runtimes() {
        let handle = start(&config(rt, "127.0.0.1:0"));
        let addr = tcp_addr(&handle);

        let clients: Vec<_> = (0..100)
            .map(|_| {
                thread::spawn(move || {
                    let mut stream = connect(addr);
                    stream.write_all(b"GET /\r\n\r\n").unwrap();
                    read_response(&mut stream)
                })
            })
            .collect();

        for client in clients {
            let (head, body) = client.join().unwrap();
            assert!(head.starts_with("HTTP/1.1 200 OK"), "{:?}: {}", rt, head);
            assert_eq!(body, "Hello World!");
        }

        assert_eq!(handle.stats().snapshot().requests, 100, "{:?}", rt);
        stop(handle);
    }
}

#[test]
fn test_keep_alive_reuses_connection() {
    for rt in runtimes() {
        let handle = start(&config(rt, "127.0.0.1:0"));
        let mut stream = connect(tcp_addr(&handle));

        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let (head, _) = read_response(&mut stream);
        assert!(head.contains("Connection: keep-alive"), "{:?}: {}", rt, head);

        stream.write_all(b"GET /api/hola HTTP/1.1\r\n\r\n").unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("\"requests\":2"), "{:?}: {}", rt, body);

        assert_eq!(handle.stats().snapshot().accepted, 1, "{:?}", rt);
        stop(handle);
    }
}

#[test]
fn test_connection_close_ends_stream() {
    for rt in runtimes() {
        let handle = start(&config(rt, "127.0.0.1:0"));
        let mut stream = connect(tcp_addr(&handle));

        stream
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.contains("Connection: close"), "{:?}: {}", rt, head);
        assert_eq!(body, "Hello World!");
        assert_eof(&mut stream);

        stop(handle);
    }
}

#[test]
fn test_misbehaving_clients_do_not_disturb_others() {
    for rt in runtimes() {
        let handle = start(&config(rt, "127.0.0.1:0"));
        let addr = tcp_addr(&handle);

        // Connects and leaves without a byte
        drop(connect(addr));

        // Half a request, then gone
        let mut partial = connect(addr);
        partial.write_all(b"GET / HT").unwrap();
        drop(partial);

        // Garbage gets the connection closed
        let mut garbage = connect(addr);
        garbage.write_all(b"not http at all\r\n\r\n").unwrap();
        assert_eof(&mut garbage);

        let mut stream = connect(addr);
        stream.write_all(b"GET /api/version HTTP/1.1\r\n\r\n").unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK"), "{:?}: {}", rt, head);
        assert!(body.contains("version"));

        assert_eq!(handle.stats().snapshot().requests, 1, "{:?}", rt);
        stop(handle);
    }
}

#[test]
fn test_unknown_endpoint_and_method() {
    for rt in runtimes() {
        let handle = start(&config(rt, "127.0.0.1:0"));
        let mut stream = connect(tcp_addr(&handle));

        stream.write_all(b"GET /nowhere HTTP/1.1\r\n\r\n").unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 404 Not Found"), "{:?}: {}", rt, head);
        assert_eq!(body, "{\"error\":\"endpoint not found\"}");

        stream.write_all(b"POST / HTTP/1.1\r\n\r\n").unwrap();
        let (head, _) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed"), "{:?}: {}", rt, head);

        stop(handle);
    }
}

#[test]
fn test_unix_socket_listener() {
    for rt in runtimes() {
        let path = std::env::temp_dir().join(format!(
            "nexus-engine-{:?}-{}.sock",
            rt,
            std::process::id()
        ));
        let config = config(rt, &format!("unix:{}", path.display()));
        let handle = start(&config);

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK"), "{:?}: {}", rt, head);
        assert_eq!(body, "Hello World!");
        drop(stream);

        stop(handle);
        assert!(!path.exists(), "{:?} left the socket file behind", rt);
    }
}

#[test]
fn test_address_in_use_is_reported() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let listen = taken.local_addr().unwrap().to_string();

    for rt in runtimes() {
        let config = config(rt, &listen);
        let stats = Arc::new(Stats::new());
        let responder = Arc::new(HttpResponder::from_config(&config, Arc::clone(&stats)));
        match runtime::spawn(&config, responder, stats) {
            Err(EngineError::Bind(BindError::AddrInUse { .. })) => {}
            Err(other) => panic!("{:?}: unexpected error {}", rt, other),
            Ok(_) => panic!("{:?}: bound an address already in use", rt),
        }
    }
}

#[test]
fn test_shutdown_with_idle_connections() {
    for rt in runtimes() {
        let handle = start(&config(rt, "127.0.0.1:0"));
        let addr = tcp_addr(&handle);

        let mut idle: Vec<_> = (0..4).map(|_| connect(addr)).collect();
        let mut active = connect(addr);
        active.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        read_response(&mut active);

        stop(handle);

        // Every connection is gone once the workers have exited
        for stream in idle.iter_mut().chain(std::iter::once(&mut active)) {
            let mut buf = [0u8; 16];
            match stream.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => panic!("{:?}: read {} bytes after shutdown", rt, n),
                Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset, "{:?}", rt),
            }
        }
    }
}

#[test]
fn test_shutdown_with_connection_limit_reached() {
    for rt in runtimes() {
        let config = Config {
            workers: 1,
            max_connections: 1,
            ..config(rt, "127.0.0.1:0")
        };
        let handle = start(&config);
        let mut idle = connect(tcp_addr(&handle));
        idle.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        read_response(&mut idle);

        // The only slot stays taken by an idle keep-alive client
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            handle.shutdown();
            done_tx.send(handle.join().is_ok()).unwrap();
        });
        match done_rx.recv_timeout(TIMEOUT) {
            Ok(joined) => assert!(joined, "{:?}: worker failed", rt),
            Err(_) => panic!("{:?}: shutdown hung with every connection slot taken", rt),
        }
        drop(idle);
    }
}
