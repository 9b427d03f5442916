//! Line-oriented echo server: greets on connect, echoes each line back,
//! `exit` says goodbye and half-closes, `quit` stops the whole server.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use clap::Parser;
use reactor_net::event_loop::EventLoop;
use reactor_net::tcp_server::{ServerOptions, TcpServer};

#[derive(Debug, Parser)]
#[command(author, version, about = "Line-oriented echo server")]
struct Cli {
    #[arg(help = "Port to listen on", long, default_value_t = 2007)]
    port: u16,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let loop_ = EventLoop::new();
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, cli.port));
    let server = TcpServer::new(loop_.clone(), addr, "echo", ServerOptions::default())
        .unwrap_or_else(|e| {
            eprintln!("failed to bind {addr}: {e}");
            std::process::exit(1);
        });

    server.set_connection_callback(|conn| {
        if conn.connected() {
            log::info!("new connection from {}", conn.peer_addr());
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
                b"quit" => {
                    conn.loop_().quit();
                }
                _ => {
                    conn.send(line);
                    conn.send(b"\n");
                }
            }
        }
    });

    server.start();
    println!("echo server listening on {addr}");
    loop_.run();
}
