use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread;

use packetflow::{Config, Endpoint, EventLoop, Role, UdpDatagramSocket};

fn main() {
    tracing_subscriber::fmt::init();

    let local: SocketAddr = "127.0.0.1:34344".parse().unwrap();
    let peer: SocketAddr = "127.0.0.1:34343".parse().unwrap();

    tracing::info!(%local, %peer, "client starting");

    let socket = UdpDatagramSocket::connect(local, peer).expect("bind/connect client socket");
    let endpoint = Endpoint::new(Role::Client, Config::default());
    let mut event_loop = EventLoop::new(endpoint, socket);

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    thread::spawn(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut chunk = [0u8; 1012];
        loop {
            match stdin.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut pending = Vec::new();
    let input = |buf: &mut [u8]| -> usize {
        if pending.is_empty() {
            if let Ok(chunk) = rx.try_recv() {
                pending = chunk;
            }
        }
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.drain(..n);
        n
    };
    let output = |bytes: &[u8]| {
        use std::io::Write;
        print!("{}", String::from_utf8_lossy(bytes));
        std::io::stdout().flush().ok();
    };

    event_loop.run(input, output).expect("event loop failed");
}
