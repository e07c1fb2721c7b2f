//! A TCP echo server that shuts down when a client sends QUIT.
//!
//! Run with: cargo run --example echo_server
//! Then: nc 127.0.0.1 7007

use eddy::{
    close_socket, exit_event_loop, start_event_loop, tcp_server, write_socket_data, LoopOptions,
    ServerOptions, WriteOptions,
};
use std::net::Ipv4Addr;

fn main() {
    start_event_loop(
        || {
            tcp_server(
                Some(Ipv4Addr::LOCALHOST),
                7007,
                |sock, bytes| {
                    write_socket_data(sock, bytes.clone(), WriteOptions::default()).unwrap();
                    if bytes.windows(4).any(|w| w == b"QUIT") {
                        println!("QUIT received, shutting down");
                        close_socket(sock).unwrap();
                        exit_event_loop().unwrap();
                    }
                },
                |cond| eprintln!("socket condition: {cond}"),
                ServerOptions::default(),
            )
            .unwrap();
            println!("echoing on 127.0.0.1:7007");
        },
        LoopOptions::default(),
    )
    .unwrap();
}
