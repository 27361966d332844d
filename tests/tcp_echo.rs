use std::cell::{Cell, RefCell};
use std::net::SocketAddrV4;
use std::rc::Rc;

use bytes::Bytes;
use tideloop::{runtime, ServerSocket, Socket, SocketStatus, TaskLoop};

fn run_until(condition: impl Fn() -> bool, what: &str) {
    let task_loop = TaskLoop::thread_loop();
    for _ in 0..200_000 {
        if condition() {
            return;
        }
        task_loop.run_once().expect("loop tick failed");
    }
    panic!("timed out waiting for {what}");
}

fn listening_server() -> (ServerSocket, SocketAddrV4) {
    let server = ServerSocket::new().expect("server socket creation failed");
    server
        .listen_backlog("127.0.0.1:0".parse().expect("address"), 16)
        .expect("listen failed");
    let addr = server
        .local_addr()
        .expect("a listening server has a definite address");
    assert_ne!(addr.port(), 0, "listen must learn the real ephemeral port");
    (server, addr)
}

#[test]
fn echo_round_trip() {
    runtime::init().expect("runtime init failed");

    let (server, addr) = listening_server();

    // Echo every payload back on the socket it arrived on.
    let server_seen: Rc<RefCell<Option<Bytes>>> = Rc::new(RefCell::new(None));
    let seen = server_seen.clone();
    server.on_connect(move |client| {
        let sink = client.clone();
        let seen = seen.clone();
        client.on_data(move |bytes| {
            *seen.borrow_mut() = Some(bytes.clone());
            sink.write(bytes.clone()).expect("echo write failed");
        });
    });

    let client = Socket::new().expect("client socket creation failed");
    let received: Rc<RefCell<Option<Bytes>>> = Rc::new(RefCell::new(None));
    let sink = received.clone();
    client.on_data(move |bytes| *sink.borrow_mut() = Some(bytes.clone()));

    let writer = client.clone();
    client.on_connect(move || {
        writer.write(&b"hello"[..]).expect("client write failed");
    });
    client.connect(addr).expect("connect failed");

    run_until(|| received.borrow().is_some(), "the echo reply");

    assert_eq!(server_seen.borrow().as_deref(), Some(&b"hello"[..]));
    assert_eq!(received.borrow().as_deref(), Some(&b"hello"[..]));
    assert_eq!(client.status(), SocketStatus::Connected);
    assert_eq!(client.bytes_written(), 5);
    assert_eq!(client.bytes_read(), 5);
}

#[test]
fn connect_promise_resolves_on_establishment() {
    runtime::init().expect("runtime init failed");

    let (_server, addr) = listening_server();

    let client = Socket::new().expect("client socket creation failed");
    let connected = Rc::new(Cell::new(false));

    let flag = connected.clone();
    client
        .connect(addr)
        .expect("connect failed")
        .then(move |_| flag.set(true));

    run_until(|| connected.get(), "connect promise resolution");
    assert_eq!(client.status(), SocketStatus::Connected);
    assert_eq!(client.remote_addr(), Some(addr));
    assert!(client
        .local_addr()
        .expect("local_addr query failed")
        .is_some());
}

#[test]
fn half_close_lifecycle() {
    runtime::init().expect("runtime init failed");

    let (server, addr) = listening_server();

    let server_side: Rc<RefCell<Option<Socket>>> = Rc::new(RefCell::new(None));
    let ended = Rc::new(Cell::new(false));
    let closed = Rc::new(Cell::new(false));

    let accepted = server_side.clone();
    let end_flag = ended.clone();
    let close_flag = closed.clone();
    server.on_connect(move |client| {
        let end_flag = end_flag.clone();
        client.on_end(move || end_flag.set(true));
        let close_flag = close_flag.clone();
        client.on_close(move || close_flag.set(true));
        *accepted.borrow_mut() = Some(client.clone());
    });

    let client = Socket::new().expect("client socket creation failed");
    let connected = Rc::new(Cell::new(false));
    let flag = connected.clone();
    client.on_connect(move || flag.set(true));
    client.connect(addr).expect("connect failed");

    run_until(
        || connected.get() && server_side.borrow().is_some(),
        "connection establishment",
    );

    // Local close: the client half-closes, the peer observes the FIN.
    client.close().expect("client close failed");
    assert_eq!(client.status(), SocketStatus::HalfClosed);

    run_until(|| ended.get(), "the End event on the accepted socket");
    let accepted = server_side.borrow().clone().expect("accepted socket");
    assert_eq!(accepted.status(), SocketStatus::HalfClosed);
    assert!(!closed.get());

    // Closing the other side finishes the connection.
    accepted.close().expect("server-side close failed");
    assert!(closed.get(), "Close must fire when both sides are gone");
    assert_eq!(accepted.status(), SocketStatus::Closed);
}

#[test]
fn sequential_writes_keep_their_order() {
    runtime::init().expect("runtime init failed");

    let (server, addr) = listening_server();

    let collected: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = collected.clone();
    server.on_connect(move |client| {
        let sink = sink.clone();
        client.on_data(move |bytes| sink.borrow_mut().extend_from_slice(bytes));
    });

    let client = Socket::new().expect("client socket creation failed");
    let settle_order: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(Vec::new()));

    let writer = client.clone();
    let order = settle_order.clone();
    client.on_connect(move || {
        let first = writer.write(&b"first "[..]).expect("first write failed");
        let second = writer.write(&b"second"[..]).expect("second write failed");

        let entry = order.clone();
        first.then(move |_| entry.borrow_mut().push("first"));
        let entry = order.clone();
        second.then(move |_| entry.borrow_mut().push("second"));
    });
    client.connect(addr).expect("connect failed");

    run_until(|| collected.borrow().len() == 12, "both payloads on the wire");
    assert_eq!(&collected.borrow()[..], b"first second");

    run_until(|| settle_order.borrow().len() == 2, "both write promises");
    assert_eq!(*settle_order.borrow(), ["first", "second"]);

    // Write accounting holds after everything settled.
    assert_eq!(client.bytes_written(), 12);
    assert_eq!(client.buffer_size(), 0);
}
