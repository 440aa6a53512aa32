//! Minimal demo application: serves a static page on `--port` (or `$PORT`).
//!
//! Exits with "Address already in use" when the port is taken, like the
//! frameworks it stands in for.

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

const PAGE: &str = "<!doctype html><title>launchpad sample</title><h1>It works</h1>\n";

fn port_from_args() -> Option<u16> {
    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        if a == "--port" {
            return args.next().and_then(|p| p.parse().ok());
        }
        if let Some(p) = a.strip_prefix("--port=") {
            return p.parse().ok();
        }
    }
    std::env::var("PORT").ok().and_then(|p| p.parse().ok())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let Some(port) = port_from_args() else {
        eprintln!("usage: launchpad-sample --port <port>");
        std::process::exit(2);
    };

    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            eprintln!("Error: Address already in use (port {port})");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: cannot bind port {port}: {e}");
            std::process::exit(1);
        }
    };
    println!("listening on http://0.0.0.0:{port}");

    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            continue;
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{PAGE}",
                PAGE.len()
            );
            let _ = stream.write_all(resp.as_bytes()).await;
        });
    }
}
