use std::cell::Cell;
use std::io::Read;
use std::net::{SocketAddr, SocketAddrV4, TcpListener};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tideloop::{runtime, PromiseStatus, Socket, TaskLoop};

const PAYLOAD: usize = 10 * 1024 * 1024;

fn run_until(condition: impl Fn() -> bool, what: &str) {
    let task_loop = TaskLoop::thread_loop();
    for _ in 0..20_000_000 {
        if condition() {
            return;
        }
        task_loop.run_once().expect("loop tick failed");
    }
    panic!("timed out waiting for {what}");
}

/// A peer that accepts, sits on the connection, then drains it.
fn slow_peer() -> (SocketAddrV4, thread::JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("peer bind failed");
    let addr = match listener.local_addr().expect("peer address") {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
    };

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("peer accept failed");
        thread::sleep(Duration::from_millis(300));

        let mut total = 0usize;
        let mut buffer = [0u8; 64 * 1024];
        while total < PAYLOAD {
            let n = stream.read(&mut buffer).expect("peer read failed");
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    });

    (addr, handle)
}

#[test]
fn a_large_write_backs_up_and_resolves_once_the_peer_drains() {
    runtime::init().expect("runtime init failed");

    let (addr, peer) = slow_peer();

    let socket = Socket::new().expect("socket creation failed");
    let connected = Rc::new(Cell::new(false));
    let flag = connected.clone();
    socket.on_connect(move || flag.set(true));
    socket.connect(addr).expect("connect failed");
    run_until(|| connected.get(), "connection establishment");

    let payload = Bytes::from(vec![0x61u8; PAYLOAD]);
    let write_promise = socket.write(payload).expect("write failed");

    // The kernel cannot absorb the whole payload while the peer sleeps.
    assert!(socket.buffer_size() > 0, "payload unexpectedly fit in kernel buffers");
    assert_eq!(write_promise.status(), PromiseStatus::Pending);
    assert_eq!(socket.bytes_written() + socket.buffer_size(), PAYLOAD);

    let resolved = Rc::new(Cell::new(false));
    let flag = resolved.clone();
    write_promise.then(move |_| flag.set(true));

    // The accounting invariant holds while the reactor flushes.
    for _ in 0..1_000 {
        TaskLoop::thread_loop().run_once().expect("loop tick failed");
        assert_eq!(socket.bytes_written() + socket.buffer_size(), PAYLOAD);
    }

    run_until(|| resolved.get(), "write completion");
    assert_eq!(socket.bytes_written(), PAYLOAD);
    assert_eq!(socket.buffer_size(), 0);

    let received = peer.join().expect("peer thread panicked");
    assert_eq!(received, PAYLOAD);
}
