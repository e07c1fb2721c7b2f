//! An HTTP server answering every request, plus a client request against
//! it from the same loop.
//!
//! Run with: cargo run --example http_hello

use eddy::{
    close_http_server, http_client, http_response, http_server, start_event_loop, ClientOptions,
    LoopOptions, ResponseOptions,
};
use std::net::Ipv4Addr;
use std::time::Duration;

fn main() {
    start_event_loop(
        || {
            let server = http_server(
                Some(Ipv4Addr::LOCALHOST),
                0,
                |req| {
                    println!("{} {}", req.method(), req.uri());
                    http_response(
                        &req,
                        ResponseOptions {
                            status: 200,
                            headers: vec![("Content-Type".into(), "text/plain".into())],
                            body: format!("hello from {}\n", req.resource()).into_bytes(),
                        },
                    )
                    .unwrap();
                },
                |cond| eprintln!("server condition: {cond}"),
            )
            .unwrap();
            let port = server.local_addr().unwrap().port();
            println!("serving on 127.0.0.1:{port}");

            http_client(
                &format!("http://127.0.0.1:{port}/demo"),
                move |status, _headers, body| {
                    println!("client got {status}: {}", String::from_utf8_lossy(&body));
                    close_http_server(server).unwrap();
                },
                |cond| eprintln!("client condition: {cond}"),
                ClientOptions { timeout: Some(Duration::from_secs(5)), ..Default::default() },
            )
            .unwrap();
        },
        LoopOptions::default(),
    )
    .unwrap();
}
