//! Round-robin assignment exercised through a real `TcpServer` instead of
//! the thread pool in isolation: 9 sequential connections against a
//! 3-worker pool land on each worker 3 times.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use reactor_net::event_loop::EventLoop;
use reactor_net::tcp_server::{ServerOptions, TcpServer};

#[test]
fn nine_connections_spread_evenly_over_three_workers() {
    let loop_ = EventLoop::new();
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
    let options = ServerOptions {
        thread_num: 3,
        reuse_port: false,
    };
    let server = TcpServer::new(loop_.clone(), addr, "round-robin-test", options).unwrap();
    let bound = server.listen_addr();
    assert_eq!(server.num_threads(), 3);

    let seen: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        server.set_connection_callback(move |c| {
            if c.connected() {
                seen.lock().unwrap().push(std::thread::current().id());
            }
        });
    }
    server.set_message_callback(|_c, buf, _now| {
        buf.retrieve_all();
    });
    server.start();

    let loop_for_timeout = loop_.clone();
    loop_.run_after(5.0, move || loop_for_timeout.quit());

    let seen_for_quit = seen.clone();
    let loop_for_quit = loop_.clone();
    let client = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        for _ in 0..9 {
            let stream = TcpStream::connect(bound).unwrap();
            std::thread::sleep(Duration::from_millis(10));
            drop(stream);
        }
        // Give the last connection's callback a moment to land, then stop
        // the main loop from this client thread.
        std::thread::sleep(Duration::from_millis(50));
        loop_for_quit.quit();
        let _ = seen_for_quit;
    });

    loop_.run();
    client.join().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 9, "expected all 9 connections to be observed");

    let mut counts: HashMap<ThreadId, usize> = HashMap::new();
    for id in seen.iter() {
        *counts.entry(*id).or_insert(0) += 1;
    }
    assert_eq!(counts.len(), 3, "connections must be spread over exactly 3 worker threads");
    for count in counts.values() {
        assert_eq!(*count, 3, "round-robin over 9 connections / 3 workers must be perfectly even");
    }
}
