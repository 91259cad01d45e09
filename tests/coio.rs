use std::cell::Cell;
use std::io::IoSlice;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use cordage::coio::{self, CoioDgram, CoioListener, CoioService, CoioStream};
use cordage::cord;
use cordage::fiber;
use cordage::Error;

const LONG: Duration = Duration::from_secs(5);

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn local_pair() -> (CoioStream, CoioStream) {
    init_log();
    let listener = CoioListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = CoioStream::new(TcpStream::connect(addr).unwrap()).unwrap();
    let (server, _peer) = listener.accept_timeout(LONG).unwrap();
    (client, server)
}

// A read on a silent socket must fail with a timeout, not block.
#[test]
fn read_times_out() {
    cord::run(|| {
        let (client, _server) = local_pair();
        let mut buf = [0u8; 1];
        let started = Instant::now();
        match client.read_timeout(&mut buf, Duration::from_millis(50)) {
            Err(Error::TimedOut) => {}
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(45));
    })
    .unwrap();
}

#[test]
fn read_write_round_trip() {
    cord::run(|| {
        let (client, server) = local_pair();
        let echo = fiber::start_proc(move || {
            let mut buf = [0u8; 5];
            server.readn(&mut buf, LONG).unwrap();
            server.write_timeout(&buf, LONG).unwrap();
        });
        client.write_timeout(b"hello", LONG).unwrap();
        let mut buf = [0u8; 5];
        client.readn(&mut buf, LONG).unwrap();
        assert_eq!(&buf, b"hello");
        echo.join();
    })
    .unwrap();
}

#[test]
fn read_ahead_reports_eof_as_a_short_read() {
    cord::run(|| {
        let (client, server) = local_pair();
        client.write_timeout(b"abc", LONG).unwrap();
        drop(client);
        let mut buf = [0u8; 16];
        let n = server.read_ahead(&mut buf, 10, LONG).unwrap();
        assert_eq!(&buf[..n], b"abc");
        // And a strict read treats the same EOF as an error.
        let mut rest = [0u8; 4];
        assert!(server.readn(&mut rest, LONG).is_err());
    })
    .unwrap();
}

#[test]
fn writev_covers_all_slices() {
    cord::run(|| {
        let (client, server) = local_pair();
        let parts = [IoSlice::new(b"scatter "), IoSlice::new(b"gather")];
        let written = client.writev(&parts, 0, LONG).unwrap();
        assert_eq!(written, 14);
        let mut buf = [0u8; 14];
        server.readn(&mut buf, LONG).unwrap();
        assert_eq!(&buf, b"scatter gather");
    })
    .unwrap();
}

// Cancelling a fiber parked in a read wakes it with a cancellation error
// within one loop iteration.
#[test]
fn cancel_interrupts_a_parked_read() {
    cord::run(|| {
        let (client, _server) = local_pair();
        let reader = fiber::start(move || {
            let mut buf = [0u8; 1];
            client.read_timeout(&mut buf, Duration::from_secs(30))
        });
        let started = Instant::now();
        reader.cancel();
        match reader.join() {
            Err(Error::FiberIsCancelled) => {}
            other => panic!("expected a cancellation, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    })
    .unwrap();
}

#[test]
fn wait_sees_readiness() {
    cord::run(|| {
        let (client, server) = local_pair();
        server.write_timeout(b"!", LONG).unwrap();
        coio::wait(client.as_raw_fd(), coio::CoioFlags::READ, LONG).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read_timeout(&mut buf, LONG).unwrap(), 1);
    })
    .unwrap();
}

#[test]
fn connect_by_address() {
    cord::run(|| {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = CoioStream::connect_addr(&addr, LONG).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        stream.write_timeout(b"ok", LONG).unwrap();
        let mut buf = [0u8; 2];
        std::io::Read::read_exact(&mut peer, &mut buf).unwrap();
        assert_eq!(&buf, b"ok");
    })
    .unwrap();
}

#[test]
fn connect_resolves_numeric_hosts() {
    cord::run(|| {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = CoioStream::connect("127.0.0.1", &port.to_string(), LONG).unwrap();
        let (_peer, _) = listener.accept().unwrap();
        drop(stream);
    })
    .unwrap();
}

#[test]
fn accept_times_out_without_clients() {
    cord::run(|| {
        let listener = CoioListener::bind("127.0.0.1:0").unwrap();
        match listener.accept_timeout(Duration::from_millis(30)) {
            Err(Error::TimedOut) => {}
            other => panic!("expected a timeout, got {other:?}"),
        }
    })
    .unwrap();
}

#[test]
fn dgram_round_trip() {
    cord::run(|| {
        let a = CoioDgram::bind("127.0.0.1:0").unwrap();
        let b = CoioDgram::bind("127.0.0.1:0").unwrap();
        let b_addr = b.local_addr().unwrap();

        let responder = fiber::start_proc(move || {
            let mut buf = [0u8; 16];
            let (n, from) = b.recv_from(&mut buf, LONG).unwrap();
            b.send_to(&buf[..n], &from, LONG).unwrap();
        });
        a.send_to(b"dgram", &b_addr, LONG).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = a.recv_from(&mut buf, LONG).unwrap();
        assert_eq!(&buf[..n], b"dgram");
        assert_eq!(from, b_addr);
        responder.join();
    })
    .unwrap();
}

#[test]
fn service_echoes() {
    cord::run(|| {
        let service = CoioService::start("echo", "127.0.0.1:0", |stream, _peer| {
            let mut buf = [0u8; 4];
            if stream.readn(&mut buf, LONG).is_ok() {
                let _ = stream.write_timeout(&buf, LONG);
            }
        })
        .unwrap();
        let addr = service.addr();

        let client = CoioStream::connect_addr(&addr, LONG).unwrap();
        client.write_timeout(b"ping", LONG).unwrap();
        let mut buf = [0u8; 4];
        client.readn(&mut buf, LONG).unwrap();
        assert_eq!(&buf, b"ping");

        service.stop();
    })
    .unwrap();
}

#[test]
fn service_handles_concurrent_connections() {
    cord::run(|| {
        let served = Rc::new(Cell::new(0u32));
        let counter = served.clone();
        let service = CoioService::start("count", "127.0.0.1:0", move |stream, _peer| {
            let mut buf = [0u8; 1];
            if stream.readn(&mut buf, LONG).is_ok() {
                counter.set(counter.get() + 1);
                let _ = stream.write_timeout(&buf, LONG);
            }
        })
        .unwrap();
        let addr = service.addr();

        let clients: Vec<_> = (0..4)
            .map(|i| {
                fiber::start(move || {
                    let c = CoioStream::connect_addr(&addr, LONG).unwrap();
                    c.write_timeout(&[i], LONG).unwrap();
                    let mut buf = [0u8; 1];
                    c.readn(&mut buf, LONG).unwrap();
                    buf[0]
                })
            })
            .collect();
        for (i, c) in clients.into_iter().enumerate() {
            assert_eq!(c.join(), i as u8);
        }
        assert_eq!(served.get(), 4);
        service.stop();
    })
    .unwrap();
}
