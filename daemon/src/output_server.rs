//! TCP server that streams NMEA sentences to connected clients (gpsd in
//! "tcp://" mode, Navit, or anything else speaking NMEA-over-TCP).
//!
//! Each client gets its own writer thread behind a small bounded queue;
//! the emit loop only enqueues. A slow client can therefore never stall
//! the fusion pipeline: when its queue overflows it is disconnected.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::net::{bind_listener, ACCEPT_POLL};

/// Sentences buffered per client before it is considered too slow.
const CLIENT_QUEUE_LEN: usize = 64;

const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

struct Client {
    peer: SocketAddr,
    tx: SyncSender<String>,
    dead: Arc<AtomicBool>,
}

/// Broadcast server for the emit loop.
pub struct NmeaServer {
    clients: Arc<Mutex<Vec<Client>>>,
    local_addr: SocketAddr,
    acceptor: Option<JoinHandle<()>>,
}

impl NmeaServer {
    /// Bind and start accepting clients. Bind failure is fatal upstream.
    pub fn start(
        host: &str,
        port: u16,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<NmeaServer> {
        let listener = bind_listener(host, port)?;
        let local_addr = listener.local_addr()?;
        info!("NMEA TCP server listening on {}", local_addr);

        let clients: Arc<Mutex<Vec<Client>>> = Arc::new(Mutex::new(Vec::new()));
        let clients_for_acceptor = Arc::clone(&clients);
        let acceptor = std::thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        if let Some(client) = spawn_client(stream, peer, Arc::clone(&shutdown)) {
                            if let Ok(mut guard) = clients_for_acceptor.lock() {
                                guard.push(client);
                                info!("NMEA client connected (total {})", guard.len());
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        warn!("NMEA accept error: {}", e);
                        std::thread::sleep(ACCEPT_POLL);
                    }
                }
            }
            // Dropping the senders unblocks and terminates writer threads.
            if let Ok(mut guard) = clients_for_acceptor.lock() {
                guard.clear();
            }
        });

        Ok(NmeaServer {
            clients,
            local_addr,
            acceptor: Some(acceptor),
        })
    }

    #[allow(dead_code)] // exercised by tests
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue one sentence (CRLF already included) to every client.
    /// Dead and overflowing clients are pruned here.
    pub fn broadcast(&self, line: &str) {
        let Ok(mut guard) = self.clients.lock() else {
            return;
        };
        guard.retain(|client| {
            if client.dead.load(Ordering::Relaxed) {
                debug!("NMEA client {} gone", client.peer);
                return false;
            }
            match client.tx.try_send(line.to_string()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("NMEA client {} too slow, dropping", client.peer);
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }

    /// Number of currently connected clients.
    #[allow(dead_code)] // exercised by tests
    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Wait for the acceptor to notice shutdown and exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_client(
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: Arc<AtomicBool>,
) -> Option<Client> {
    if stream.set_nodelay(true).is_err()
        || stream
            .set_write_timeout(Some(CLIENT_WRITE_TIMEOUT))
            .is_err()
    {
        return None;
    }
    let (tx, rx): (SyncSender<String>, Receiver<String>) = sync_channel(CLIENT_QUEUE_LEN);
    let dead = Arc::new(AtomicBool::new(false));
    let dead_for_writer = Arc::clone(&dead);
    std::thread::spawn(move || {
        let mut stream = stream;
        loop {
            match rx.recv_timeout(Duration::from_millis(250)) {
                Ok(line) => {
                    if stream.write_all(line.as_bytes()).is_err() {
                        break;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        dead_for_writer.store(true, Ordering::Relaxed);
    });
    Some(Client { peer, tx, dead })
}
