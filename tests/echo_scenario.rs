//! Drives a full client exchange through the public API: greet on connect,
//! echo back lines, "exit" says goodbye and half-closes, "quit" stops the
//! server loop.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::time::Duration;

use reactor_net::event_loop::EventLoop;
use reactor_net::tcp_server::{ServerOptions, TcpServer};

fn read_line(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).expect("read");
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

#[test]
fn greet_echo_exit_quit() {
    let loop_ = EventLoop::new();
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
    let server = TcpServer::new(loop_.clone(), addr, "echo-scenario", ServerOptions::default()).unwrap();
    let bound = server.listen_addr();

    server.set_connection_callback(|conn| {
        if conn.connected() {
            conn.send(b"hello\n");
        }
    });
    server.set_message_callback(|conn, buf, _now| {
        let bytes = buf.retrieve_all();
        for line in bytes.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            match line {
                b"exit" => {
                    conn.send(b"bye\n");
                    conn.shutdown();
                }
                b"quit" => conn.loop_().quit(),
                _ => {
                    conn.send(line);
                    conn.send(b"\n");
                }
            }
        }
    });
    server.start();

    let loop_for_timeout = loop_.clone();
    loop_.run_after(2.0, move || loop_for_timeout.quit());

    let client = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        let mut stream = TcpStream::connect(bound).unwrap();

        let greet = read_line(&mut stream);
        assert_eq!(greet, "hello");

        stream.write_all(b"hi\n").unwrap();
        let echoed = read_line(&mut stream);
        assert_eq!(echoed, "hi");

        stream.write_all(b"exit\n").unwrap();
        let bye = read_line(&mut stream);
        assert_eq!(bye, "bye");

        // The server half-closed its write side; the peer still sees EOF
        // on further reads even though it could keep writing.
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        stream.write_all(b"quit\n").unwrap();
    });

    loop_.run();
    client.join().unwrap();
}
