//! TCP echo server on the spindle runtime.
//!
//! One fiber accepts; every client gets its own fiber running a
//! read-then-write loop. Try it with:
//!
//! ```text
//! cargo run --release -p spindle-echo
//! nc 127.0.0.1 4321
//! ```

use std::net::{TcpListener, TcpStream};

use spindle::{Buffer, Runtime, sinfo};

fn main() -> spindle::Result<()> {
    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(4321u16);

    let listener = TcpListener::bind(("127.0.0.1", port)).expect("bind failed");
    sinfo!("echo server listening on 127.0.0.1:{}", port);

    let rt = Runtime::new()?;
    rt.spawn(move |rt| {
        rt.accept_loop(&listener, |client: TcpStream| {
            rt.spawn(move |rt| {
                rt.read_loop(&client, 8192, |data| {
                    rt.write(&client, &Buffer::from(data)).map(|_| ())
                })
            })
            .map(|_| ())
        })
    })?;

    rt.run()
}
