//! Raw UDP network layer, §4.4.
//!
//! Owns one UDP socket per configured listen endpoint. A receive thread and
//! a send thread cooperate on each socket; the "reliable pump" that drains
//! `pending_out` across all connections is expected to run on the mainloop
//! (or a dedicated thread, per deployment) and talks to this layer purely
//! through `egress`/`ingress` channels, never touching the socket directly.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace, warn};

use crate::error::NetError;

/// Per-socket configuration: an endpoint plus the "connect-as" grouping
/// name used for population reporting (§6).
#[derive(Debug, Clone)]
pub struct ListenData {
    pub ip: IpAddr,
    pub port: u16,
    pub connect_as: String,
}

impl ListenData {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// First byte of a datagram that should be routed through the
/// connection-init pipeline rather than an established connection's
/// decrypt/dispatch path.
pub const INIT_MAGIC: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Handled,
    Pass,
}

/// Registered by encryption modules and the peer module; tried in
/// registration order until one reports `Handled`.
pub trait ConnectionInitHandler: Send + Sync {
    fn try_handle(&self, data: &[u8], from: SocketAddr, listen: &ListenData) -> InitOutcome;
}

/// Ordered list of init handlers for incoming datagrams whose first byte is
/// [`INIT_MAGIC`]. The first handler to report `Handled` ends processing;
/// if none handles it, the packet is dropped with a log line (§4.4).
#[derive(Default, Clone)]
pub struct InitPipeline {
    handlers: Arc<parking_lot::RwLock<Vec<Arc<dyn ConnectionInitHandler>>>>,
}

impl InitPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn ConnectionInitHandler>) {
        self.handlers.write().push(handler);
    }

    /// Runs the pipeline over an incoming init datagram. Returns whether any
    /// handler accepted it.
    pub fn dispatch(&self, data: &[u8], from: SocketAddr, listen: &ListenData) -> bool {
        for handler in self.handlers.read().iter() {
            if handler.try_handle(data, from, listen) == InitOutcome::Handled {
                return true;
            }
        }
        false
    }
}

/// A datagram received on a listen socket, tagged with which socket (and
/// thus which `connect_as` group) it arrived on.
pub struct IngressDatagram {
    pub from: SocketAddr,
    pub listen: ListenData,
    pub data: Vec<u8>,
}

/// One UDP listen socket plus its receive/send threads. Ingress datagrams
/// whose first byte is [`INIT_MAGIC`] are handed to `init_pipeline`
/// in-thread; everything else is forwarded on `ingress_rx` for the
/// reliable-pump layer to decrypt and route to an established connection.
pub struct RawSocket {
    listen: ListenData,
    egress_tx: Sender<(SocketAddr, Vec<u8>)>,
    ingress_rx: Receiver<IngressDatagram>,
    running: Arc<AtomicBool>,
    recv_handle: Option<JoinHandle<()>>,
    send_handle: Option<JoinHandle<()>>,
}

impl RawSocket {
    /// Binds `listen.socket_addr()` and spawns its receive/send threads.
    pub fn bind(listen: ListenData, init_pipeline: InitPipeline) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(listen.socket_addr())?;
        socket.set_nonblocking(false)?;

        let recv_socket = socket.try_clone()?;
        let send_socket = socket;

        let (ingress_tx, ingress_rx) = unbounded::<IngressDatagram>();
        let (egress_tx, egress_rx) = unbounded::<(SocketAddr, Vec<u8>)>();

        let running = Arc::new(AtomicBool::new(true));

        let recv_running = running.clone();
        let recv_listen = listen.clone();
        let recv_handle = std::thread::spawn(move || {
            let mut buf = vec![0u8; 2048];
            while recv_running.load(Ordering::Acquire) {
                match recv_socket.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        if n == 0 {
                            continue;
                        }
                        trace!("recv {} bytes from {}", n, from);
                        if buf[0] == INIT_MAGIC {
                            if !init_pipeline.dispatch(&buf[..n], from, &recv_listen) {
                                warn!("dropping unhandled init datagram from {}", from);
                            }
                        } else if ingress_tx
                            .send(IngressDatagram {
                                from,
                                listen: recv_listen.clone(),
                                data: buf[..n].to_vec(),
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => {
                        warn!("recv_from error on {}: {}", recv_listen.socket_addr(), e);
                    }
                }
            }
            debug!("receive thread for {} exiting", recv_listen.socket_addr());
        });

        let send_running = running.clone();
        let send_addr = listen.socket_addr();
        let send_handle = std::thread::spawn(move || {
            while send_running.load(Ordering::Acquire) {
                match egress_rx.recv_timeout(std::time::Duration::from_millis(200)) {
                    Ok((to, data)) => {
                        if let Err(e) = send_socket.send_to(&data, to) {
                            warn!("send_to {} failed: {}", to, e);
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("send thread for {} exiting", send_addr);
        });

        Ok(Self {
            listen,
            egress_tx,
            ingress_rx,
            running,
            recv_handle: Some(recv_handle),
            send_handle: Some(send_handle),
        })
    }

    pub fn listen_data(&self) -> &ListenData {
        &self.listen
    }

    pub fn egress_sender(&self) -> Sender<(SocketAddr, Vec<u8>)> {
        self.egress_tx.clone()
    }

    pub fn ingress_receiver(&self) -> Receiver<IngressDatagram> {
        self.ingress_rx.clone()
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        // Wake the blocking recv_from by sending ourselves a zero-length
        // datagram; ignore failures, the thread will also exit once the
        // channel receivers are dropped.
        let _ = UdpSocket::bind("0.0.0.0:0").and_then(|s| s.send_to(&[0u8], self.listen.socket_addr()));
        if let Some(h) = self.recv_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.send_handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHandler(Mutex<Vec<SocketAddr>>);
    impl ConnectionInitHandler for RecordingHandler {
        fn try_handle(&self, _data: &[u8], from: SocketAddr, _listen: &ListenData) -> InitOutcome {
            self.0.lock().unwrap().push(from);
            InitOutcome::Handled
        }
    }

    struct PassingHandler;
    impl ConnectionInitHandler for PassingHandler {
        fn try_handle(&self, _data: &[u8], _from: SocketAddr, _listen: &ListenData) -> InitOutcome {
            InitOutcome::Pass
        }
    }

    #[test]
    fn first_handled_wins_and_stops_dispatch() {
        let pipeline = InitPipeline::new();
        let recorder = Arc::new(RecordingHandler(Mutex::new(Vec::new())));
        pipeline.register(Arc::new(PassingHandler));
        pipeline.register(recorder.clone());

        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        let listen = ListenData { ip: "127.0.0.1".parse().unwrap(), port: 1234, connect_as: "pub".into() };
        assert!(pipeline.dispatch(&[0xFF], addr, &listen));
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn no_handler_accepts_returns_false() {
        let pipeline = InitPipeline::new();
        pipeline.register(Arc::new(PassingHandler));
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        let listen = ListenData { ip: "127.0.0.1".parse().unwrap(), port: 1234, connect_as: "pub".into() };
        assert!(!pipeline.dispatch(&[0xFF], addr, &listen));
    }
}
