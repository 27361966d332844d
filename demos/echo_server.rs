//! A TCP echo server on the tideloop runtime.
//!
//! Run with `cargo run --example echo_server`, then connect with the
//! echo client demo or `nc 127.0.0.1 7000`.

use tideloop::{runtime, ServerSocket, TaskLoop};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    runtime::init()?;

    let server = ServerSocket::new()?;
    server.on_connect(|client| {
        println!("client connected: {:?}", client.remote_addr());

        let sink = client.clone();
        client.on_data(move |bytes| {
            if let Err(error) = sink.write(bytes.clone()) {
                eprintln!("echo write failed: {error}");
            }
        });

        let peer = client.clone();
        client.on_end(move || {
            println!("client left: {:?}", peer.remote_addr());
            let _ = peer.close();
        });
    });

    server.listen("127.0.0.1:7000".parse()?)?;
    println!("echo server listening on {:?}", server.local_addr());

    TaskLoop::thread_loop().run()
}
