//! A TCP client for the echo server demo, written as an async function.
//!
//! Run the echo server first, then `cargo run --example echo_client`.

use tideloop::{async_func, runtime, AsyncCtx, Socket, TaskLoop};

fn main() -> anyhow::Result<()> {
    runtime::init()?;

    let socket = Socket::new()?;
    socket.on_data(|bytes| {
        println!("echoed back: {:?}", bytes);
        std::process::exit(0);
    });

    let session = {
        let socket = socket.clone();
        async_func(move |ctx: AsyncCtx| {
            ctx.wait(socket.connect("127.0.0.1:7000".parse()?)?)?;
            ctx.wait(socket.write(&b"hello tideloop"[..])?)?;
            println!("payload flushed, waiting for the echo");
            Ok(())
        })
    };
    session();

    TaskLoop::thread_loop().run()
}
