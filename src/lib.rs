//! # Tideloop
//!
//! **Tideloop** is a single-threaded cooperative async I/O runtime for
//! TCP networking on POSIX platforms.
//!
//! Unlike future-based runtimes, Tideloop is built on three interlocking
//! primitives in the promise/generator tradition:
//!
//! - A **[`Promise`]** — a single-assignment value-or-error cell whose
//!   continuations fire from a microtask queue drained once per loop
//!   tick.
//! - A **[`Generator`]** — a stackful coroutine that suspends
//!   mid-execution and resumes with a value, switching machine contexts
//!   between caller and body.
//! - A **reactor** ([`reactor`]) — a readiness dispatcher over the
//!   kernel's edge-triggered multiplexer (`epoll` on Linux, `kqueue` on
//!   the BSDs and macOS).
//!
//! On top of these, [`async_func`] turns linear imperative code with
//! [`AsyncCtx::wait`] points into a promise-returning function, and
//! [`net`] provides nonblocking TCP sockets whose reads, writes, and
//! lifecycle events are driven by the reactor.
//!
//! Everything runs on one thread: the [`TaskLoop`] ticks permanent tasks
//! (the microtask drain and the reactor) and oneshot tasks forever, and
//! all runtime state is thread-local. No locks, no atomics, no work
//! stealing.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tideloop::{runtime, ServerSocket, TaskLoop};
//!
//! fn main() -> anyhow::Result<()> {
//!     runtime::init()?;
//!
//!     let server = ServerSocket::new()?;
//!     server.on_connect(|client| {
//!         let sink = client.clone();
//!         client.on_data(move |bytes| {
//!             let _ = sink.write(bytes.clone());
//!         });
//!     });
//!     server.listen("127.0.0.1:7000".parse()?)?;
//!
//!     TaskLoop::thread_loop().run()
//! }
//! ```
//!
//! ## Modules
//!
//! - [`task_loop`] — the cooperative task loop
//! - [`generator`] — stackful generators
//! - [`promise`] — promises and the microtask queue
//! - [`async_func`] — async functions over promises and generators
//! - [`reactor`] — readiness dispatch over epoll/kqueue
//! - [`net`] — nonblocking TCP sockets
//! - [`runtime`] — per-thread initialization

mod captured;

pub mod async_func;
pub mod generator;
pub mod net;
pub mod promise;
pub mod reactor;
pub mod runtime;
pub mod task_loop;

pub use async_func::{async_func, async_func1, async_func2, async_func3, AsyncCtx};
pub use captured::{BadCast, CapturedError};
pub use generator::{GenCtx, GenStatus, Generator, GeneratorError};
pub use net::{
    EventHandle, ServerEvent, ServerSocket, ServerStatus, Socket, SocketError, SocketErrorKind,
    SocketEvent, SocketStatus,
};
pub use promise::{IntoPromise, Promise, PromiseCtx, PromiseStatus};
pub use reactor::{ReactorError, ReactorErrorKind, ReactorTarget};
pub use task_loop::TaskLoop;
