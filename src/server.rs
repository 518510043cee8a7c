//! Worker HTTP server
//!
//! Every worker binds its own listening socket with `SO_REUSEPORT`, so
//! sibling processes share one port and the kernel spreads connections
//! across them. Once bound, a worker announces itself on stdout with a
//! `listening <addr>` line that the coordinator watches for.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

use actix_web::dev::Server;
use actix_web::middleware::{Compress, Logger, NormalizePath};
use actix_web::{web, App, HttpServer};
use log::info;
use socket2::{Domain, Protocol, Socket, Type};

use crate::api;
use crate::app_state::AppState;
use crate::config::AppConfig;

/// Prefix of the readiness line a worker prints once its socket is bound
pub const READY_PREFIX: &str = "listening";

const BACKLOG: i32 = 1024;

/// Bind a listener that sibling processes can bind too
pub fn bind_shared(host: &str, port: u16) -> io::Result<TcpListener> {
    let addr: SocketAddr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("cannot resolve {}", host)))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

/// Build the actix server for `state` on an already bound listener
pub fn build_server(state: AppState, listener: TcpListener, threads: usize) -> io::Result<Server> {
    let data = web::Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(Logger::new("%a \"%r\" %s %b %T"))
            .wrap(Compress::default())
            .wrap(NormalizePath::trim())
            .configure(api::configure)
    })
    .workers(threads.max(1))
    .listen(listener)?
    .run();
    Ok(server)
}

/// Run one worker until its server stops
pub async fn run_worker(config: AppConfig, worker_index: usize) -> io::Result<()> {
    let threads = config.server.threads;
    let listener = bind_shared(&config.server.host, config.server.port)?;
    let addr = listener.local_addr()?;

    let state = AppState::from_config(config, worker_index)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let server = build_server(state, listener, threads)?;

    info!("Worker {} listening at http://{}", worker_index, addr);
    println!("{} {}", READY_PREFIX, addr);
    server.await
}

/// Address announced in a worker's readiness line
pub fn parse_ready_line(line: &str) -> Option<SocketAddr> {
    line.trim()
        .strip_prefix(READY_PREFIX)?
        .trim()
        .parse()
        .ok()
}
