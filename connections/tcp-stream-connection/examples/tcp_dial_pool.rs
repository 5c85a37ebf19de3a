// Copyright 2020 Joyent, Inc.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use slog::{info, o, Drain, Logger};

use dialpool::dial_pool::types::DialPoolOptions;
use dialpool::dial_pool::DialPool;
use dialpool_tcp_stream_connection::TcpDialer;

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        slog_term::FullFormat::new(plain).build().fuse(),
        o!("build-id" => "0.1.0"),
    );

    // A small echo server so the example is self-contained.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            thread::spawn(move || {
                let mut buf = [0u8; 64];
                while let Ok(n) = stream.read(&mut buf) {
                    if n == 0 || stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            });
        }
    });

    let dpo = DialPoolOptions {
        log: Some(log.clone()),
        dial_thread_name: Some(String::from("echo-dial")),
        ..Default::default()
    };
    let dialer = TcpDialer::new()
        .connect_timeout(Duration::from_secs(2))
        .nodelay(true)
        .logger(log.clone());
    let pool = DialPool::new(dpo, dialer);

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let pool = pool.clone();
            let log = log.clone();
            thread::spawn(move || {
                let conn = pool.request(&addr).unwrap();
                info!(log, "worker {} connected to {}", i, conn.peer_addr());
                conn
            })
        })
        .collect();

    let conns: Vec<_> =
        workers.into_iter().map(|w| w.join().unwrap()).collect();
    let shared = conns.iter().all(|conn| Arc::ptr_eq(conn, &conns[0]));
    info!(log, "all workers share one connection: {}", shared);

    let mut stream = conns[0].stream();
    stream.write_all(b"ping").unwrap();
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).unwrap();
    info!(log, "echo replied {:?}", String::from_utf8_lossy(&reply));

    info!(log, "pool stats: {:?}", pool.get_stats());
    pool.shutdown();
    info!(log, "pool state: {}", pool.get_state());
}
