use std::{
    collections::HashMap,
    error, fmt,
    future::Future,
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use log::{debug, info, warn};
use rand::{rngs::OsRng, RngCore};
use tokio::{
    net::UdpSocket,
    sync::{watch, Notify},
    task::JoinHandle,
    time::sleep,
};

pub mod crypto;
pub mod identity;
pub mod message;
pub mod session;
pub mod state;
pub mod tkm;

use crate::platform::SessionCallbacks;
use identity::Identity;
use message::{
    ExchangeType, Flags, IkeHeader, Message, NotifyMessageType, NotifyPayload, Payload,
    PayloadType, TrafficSelector, TransformType,
};
pub use session::{SessionError, SessionHandle};

const MAX_DATAGRAM_SIZE: usize = 4096;
const DEFAULT_LIFETIME: Duration = Duration::from_secs(60 * 60);
const SESSION_RESTART_DELAY: Duration = Duration::from_secs(5);

// One UDP datagram with both endpoint addresses.
pub struct Datagram {
    pub data: Vec<u8>,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

// Datagram-framed packet port; no partial reads. The UDP implementation is
// below, tests plug in an in-memory one.
pub trait PacketPort: Send + Sync + 'static {
    fn write_packet(
        &self,
        data: &[u8],
        to_addr: SocketAddr,
    ) -> impl Future<Output = io::Result<()>> + Send;

    fn read_message(&self) -> impl Future<Output = io::Result<Datagram>> + Send;

    fn local_addr(&self) -> SocketAddr;

    fn close(&self);
}

pub struct UdpPacketPort {
    socket: UdpSocket,
    local_addr: SocketAddr,
    closed: Notify,
    is_closed: AtomicBool,
}

impl UdpPacketPort {
    pub async fn bind(listen_addr: SocketAddr) -> io::Result<UdpPacketPort> {
        let socket = UdpSocket::bind(listen_addr).await?;
        let local_addr = socket.local_addr()?;
        info!("Started server on {}", local_addr);
        Ok(UdpPacketPort {
            socket,
            local_addr,
            closed: Notify::new(),
            is_closed: AtomicBool::new(false),
        })
    }
}

fn port_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "packet port is closed")
}

impl PacketPort for UdpPacketPort {
    fn write_packet(
        &self,
        data: &[u8],
        to_addr: SocketAddr,
    ) -> impl Future<Output = io::Result<()>> + Send {
        async move { self.socket.send_to(data, to_addr).await.map(|_| ()) }
    }

    fn read_message(&self) -> impl Future<Output = io::Result<Datagram>> + Send {
        async move {
            if self.is_closed.load(Ordering::Acquire) {
                return Err(port_closed());
            }
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            tokio::select! {
                _ = self.closed.notified() => Err(port_closed()),
                res = self.socket.recv_from(&mut buf) => {
                    let (len, remote_addr) = res?;
                    buf.truncate(len);
                    Ok(Datagram {
                        data: buf,
                        local_addr: self.local_addr,
                        remote_addr,
                    })
                }
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn close(&self) {
        self.is_closed.store(true, Ordering::Release);
        self.closed.notify_waiters();
    }
}

// Immutable per-peer settings; every session takes its own snapshot.
#[derive(Clone)]
pub struct Config {
    pub proposal_ike: crypto::Transforms,
    pub proposal_esp: crypto::Transforms,
    pub local_id: Arc<Identity>,
    pub remote_id: Arc<Identity>,
    pub ts_i: Vec<TrafficSelector>,
    pub ts_r: Vec<TrafficSelector>,
    pub is_transport_mode: bool,
    pub throttle_init_requests: bool,
    pub lifetime: Duration,
}

impl Config {
    pub fn new(local_id: Arc<Identity>, remote_id: Arc<Identity>) -> Config {
        Config {
            proposal_ike: crypto::default_ike_transforms(),
            proposal_esp: crypto::default_esp_transforms(),
            local_id,
            remote_id,
            ts_i: vec![],
            ts_r: vec![],
            is_transport_mode: true,
            throttle_init_requests: false,
            lifetime: DEFAULT_LIFETIME,
        }
    }

    // Tunnel-mode selectors built from network prefixes.
    pub fn add_network_selectors(
        &mut self,
        local: (IpAddr, u8),
        remote: (IpAddr, u8),
        is_initiator: bool,
    ) {
        let (initiator, responder) = if is_initiator {
            (local, remote)
        } else {
            (remote, local)
        };
        self.ts_i = vec![selector_from_network(initiator.0, initiator.1)];
        self.ts_r = vec![selector_from_network(responder.0, responder.1)];
        self.is_transport_mode = false;
    }

    // Single-address selectors from the session's own endpoints.
    pub fn add_host_based_selectors(
        &mut self,
        local: IpAddr,
        remote: IpAddr,
        is_initiator: bool,
    ) {
        let (initiator, responder) = if is_initiator {
            (local, remote)
        } else {
            (remote, local)
        };
        self.ts_i = vec![TrafficSelector::from_address(initiator)];
        self.ts_r = vec![TrafficSelector::from_address(responder)];
    }
}

fn selector_from_network(addr: IpAddr, prefix_len: u8) -> TrafficSelector {
    let (start_addr, end_addr) = match addr {
        IpAddr::V4(addr) => {
            let bits = u32::from(addr);
            let mask = if prefix_len >= 32 {
                u32::MAX
            } else {
                !(u32::MAX >> prefix_len)
            };
            (
                IpAddr::from((bits & mask).to_be_bytes()),
                IpAddr::from((bits | !mask).to_be_bytes()),
            )
        }
        IpAddr::V6(addr) => {
            let bits = u128::from(addr);
            let mask = if prefix_len >= 128 {
                u128::MAX
            } else {
                !(u128::MAX >> prefix_len)
            };
            (
                IpAddr::from((bits & mask).to_be_bytes()),
                IpAddr::from((bits | !mask).to_be_bytes()),
            )
        }
    };
    let mut ts = TrafficSelector::from_address(start_addr);
    ts.end_addr = end_addr;
    ts
}

// SPI-keyed session table with exclusive insert, shared between the
// multiplexer and the session-done watchers.
struct SessionTable {
    inner: Mutex<HashMap<u64, SessionHandle>>,
}

impl SessionTable {
    fn new() -> SessionTable {
        SessionTable {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn add(&self, spi: u64, handle: SessionHandle) -> Result<(), &'static str> {
        let mut inner = self.inner.lock().expect("session table mutex");
        if inner.contains_key(&spi) {
            return Err("Duplicate session SPI");
        }
        inner.insert(spi, handle);
        Ok(())
    }

    fn remove(&self, spi: u64) -> Option<SessionHandle> {
        self.inner.lock().expect("session table mutex").remove(&spi)
    }

    fn get(&self, spi: u64) -> Option<SessionHandle> {
        self.inner
            .lock()
            .expect("session table mutex")
            .get(&spi)
            .cloned()
    }

    fn handles(&self) -> Vec<SessionHandle> {
        self.inner
            .lock()
            .expect("session table mutex")
            .values()
            .cloned()
            .collect()
    }
}

enum InitCheck {
    Cookie(Vec<u8>),
    InvalidKe(u16),
    NoProposalChosen,
    Drop(&'static str),
}

pub struct ServerHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

// The session multiplexer: owns the packet port, routes datagrams to
// sessions by initiator SPI, spawns responders and supervises initiators.
pub struct Server<P: PacketPort> {
    config: Config,
    port: Arc<P>,
    callbacks: SessionCallbacks,
    sessions: Arc<SessionTable>,
    initiators: Arc<SessionTable>,
    cookie_secret: [u8; 32],
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<P: PacketPort> Server<P> {
    pub fn new(config: Config, port: P, callbacks: SessionCallbacks) -> Server<P> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut cookie_secret = [0u8; 32];
        OsRng.fill_bytes(&mut cookie_secret);
        Server {
            config,
            port: Arc::new(port),
            callbacks,
            sessions: Arc::new(SessionTable::new()),
            initiators: Arc::new(SessionTable::new()),
            cookie_secret,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown_tx.clone(),
        }
    }

    // Starts the initiator supervisor: establishes a session, waits on its
    // done signal and restarts it based on the settled error. Rekey
    // (DeadlineExceeded) restarts immediately, Canceled exits, anything else
    // retries after a delay.
    pub fn connect(&self, remote_addr: SocketAddr) -> JoinHandle<()> {
        let config = self.config.clone();
        let port = self.port.clone();
        let callbacks = self.callbacks.clone();
        let sessions = self.sessions.clone();
        let initiators = self.initiators.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }
                let handle = match session::spawn_initiator(
                    config.clone(),
                    port.clone(),
                    callbacks.clone(),
                    remote_addr,
                ) {
                    Ok(handle) => handle,
                    Err(err) => {
                        warn!("Failed to start initiator session: {}", err);
                        return;
                    }
                };
                let spi = handle.initiator_spi;
                if initiators.add(spi, handle.clone()).is_err() {
                    warn!("Duplicate initiator SPI {:x}", spi);
                    handle.close(SessionError::Canceled);
                    continue;
                }
                let mut waiter = handle.clone();
                waiter.wait_done().await;
                initiators.remove(spi);
                sessions.remove(spi);
                match handle.error() {
                    Some(SessionError::DeadlineExceeded) => {
                        info!("{:x} rekeying", spi);
                    }
                    Some(SessionError::Canceled) => return,
                    err => {
                        warn!(
                            "Initiator session {:x} ended: {}",
                            spi,
                            err.unwrap_or(SessionError::Internal("no error"))
                        );
                        tokio::select! {
                            _ = sleep(SESSION_RESTART_DELAY) => {}
                            _ = shutdown_rx.changed() => {}
                        }
                    }
                }
            }
        })
    }

    // The read loop; returns when the packet port fails, including the
    // deliberate close on shutdown.
    pub async fn run(&self) -> Result<(), IkeError> {
        let port = self.port.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let watcher = tokio::spawn(async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    return;
                }
            }
            port.close();
        });
        let result = loop {
            match self.port.read_message().await {
                Ok(datagram) => {
                    let remote_addr = datagram.remote_addr;
                    if let Err(err) = self.process_datagram(datagram).await {
                        warn!("Failed to process message from {}: {}", remote_addr, err);
                    }
                }
                Err(err) => break err,
            }
        };
        let shutting_down = *self.shutdown_rx.borrow();
        self.shutdown_sessions().await;
        watcher.abort();
        if shutting_down {
            info!("Stopped server");
            Ok(())
        } else {
            Err(result.into())
        }
    }

    async fn shutdown_sessions(&self) {
        const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
        let mut handles = self.sessions.handles();
        handles.extend(self.initiators.handles());
        for mut handle in handles {
            handle.close(SessionError::Canceled);
            if tokio::time::timeout(DRAIN_TIMEOUT, handle.wait_done())
                .await
                .is_err()
            {
                warn!("Session {:x} did not drain in time", handle.initiator_spi);
            }
        }
    }

    async fn process_datagram(&self, datagram: Datagram) -> Result<(), IkeError> {
        let header = match IkeHeader::decode(&datagram.data) {
            Ok(header) => header,
            Err(err) => {
                debug!(
                    "Dropping invalid datagram from {}: {}",
                    datagram.remote_addr, err
                );
                return Ok(());
            }
        };
        let spi = header.initiator_spi;
        if let Some(handle) = self.sessions.get(spi) {
            handle.post_message(datagram);
            return Ok(());
        }
        if header.is_response() {
            return self.process_initiator_response(datagram, &header).await;
        }
        if header.exchange_type == ExchangeType::IKE_SA_INIT
            && header.message_id == 0
            && header.flags.has(Flags::INITIATOR)
        {
            return self.process_new_responder(datagram, &header).await;
        }
        debug!("Session not found for SPI {:x}", spi);
        Ok(())
    }

    // A response with no established session: either an INIT reply for a
    // pending initiator, or noise to drop.
    async fn process_initiator_response(
        &self,
        datagram: Datagram,
        header: &IkeHeader,
    ) -> Result<(), IkeError> {
        let spi = header.initiator_spi;
        let handle = match self.initiators.get(spi) {
            Some(handle) => handle,
            None => {
                debug!("Dropping response for unknown SPI {:x}", spi);
                return Ok(());
            }
        };
        // Cookie and INVALID_KE challenges keep the session in the
        // initiators table; a real INIT response graduates it.
        let is_challenge = header.exchange_type == ExchangeType::IKE_SA_INIT
            && match Message::decode(&datagram.data) {
                Ok(msg) => {
                    msg.payloads
                        .notification(NotifyMessageType::COOKIE)
                        .is_some()
                        || msg
                            .payloads
                            .notification(NotifyMessageType::INVALID_KE_PAYLOAD)
                            .is_some()
                }
                Err(_) => false,
            };
        if !is_challenge {
            self.initiators.remove(spi);
            if self.sessions.add(spi, handle.clone()).is_ok() {
                self.watch_session(spi, handle.clone());
            }
        }
        handle.post_message(datagram);
        Ok(())
    }

    async fn process_new_responder(
        &self,
        datagram: Datagram,
        header: &IkeHeader,
    ) -> Result<(), IkeError> {
        let spi = header.initiator_spi;
        let msg = match Message::decode(&datagram.data) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(
                    "Dropping invalid INIT request from {}: {}",
                    datagram.remote_addr, err
                );
                return Ok(());
            }
        };
        match self.check_init_request(&msg, &datagram) {
            Ok(()) => {
                let mut config = self.config.clone();
                if config.ts_i.is_empty() || config.ts_r.is_empty() {
                    config.add_host_based_selectors(
                        datagram.local_addr.ip(),
                        datagram.remote_addr.ip(),
                        false,
                    );
                }
                let handle = session::spawn_responder(
                    config,
                    self.port.clone(),
                    self.callbacks.clone(),
                    spi,
                    datagram.local_addr,
                    datagram.remote_addr,
                )?;
                if self.sessions.add(spi, handle.clone()).is_err() {
                    warn!("Duplicate responder SPI {:x}", spi);
                    handle.close(SessionError::Canceled);
                    return Ok(());
                }
                self.watch_session(spi, handle.clone());
                handle.post_message(datagram);
            }
            Err(InitCheck::Cookie(cookie)) => {
                debug!("Challenging INIT from {} with a cookie", datagram.remote_addr);
                self.send_init_reply(
                    &datagram,
                    header,
                    NotifyPayload::with_data(NotifyMessageType::COOKIE, cookie),
                )
                .await?;
            }
            Err(InitCheck::InvalidKe(group)) => {
                debug!(
                    "Rejecting INIT from {} with INVALID_KE_PAYLOAD ({})",
                    datagram.remote_addr, group
                );
                self.send_init_reply(
                    &datagram,
                    header,
                    NotifyPayload::with_data(
                        NotifyMessageType::INVALID_KE_PAYLOAD,
                        group.to_be_bytes().to_vec(),
                    ),
                )
                .await?;
            }
            Err(InitCheck::NoProposalChosen) => {
                debug!("Rejecting INIT from {}: no proposal chosen", datagram.remote_addr);
                self.send_init_reply(
                    &datagram,
                    header,
                    NotifyPayload::new(NotifyMessageType::NO_PROPOSAL_CHOSEN),
                )
                .await?;
            }
            Err(InitCheck::Drop(reason)) => {
                debug!("Dropping INIT from {}: {}", datagram.remote_addr, reason);
            }
        }
        Ok(())
    }

    fn check_init_request(&self, msg: &Message, datagram: &Datagram) -> Result<(), InitCheck> {
        if msg
            .payloads
            .ensure(&[
                PayloadType::SECURITY_ASSOCIATION,
                PayloadType::KEY_EXCHANGE,
                PayloadType::NONCE,
            ])
            .is_err()
        {
            return Err(InitCheck::Drop("INIT request is missing payloads"));
        }
        if self.config.throttle_init_requests {
            let nonce = msg.payloads.nonce().unwrap_or(&[]);
            let expected = compute_cookie(
                &self.cookie_secret,
                nonce,
                datagram.remote_addr.ip(),
                msg.header.initiator_spi,
            );
            match msg.payloads.notification(NotifyMessageType::COOKIE) {
                Some(notify) if notify.data == expected => {}
                _ => return Err(InitCheck::Cookie(expected)),
            }
        }
        let local_group = self.config.proposal_ike.dh_group().unwrap_or(0);
        let proposals = msg.payloads.security_association().unwrap_or(&[]);
        if crypto::negotiate(&self.config.proposal_ike, message::ProtocolId::IKE, proposals)
            .is_none()
        {
            // A proposal that matches in everything but the DH group gets the
            // preferred group back instead of a flat rejection.
            let stripped = self.config.proposal_ike.without(TransformType::TYPE_DH);
            return if crypto::negotiate(&stripped, message::ProtocolId::IKE, proposals).is_some()
            {
                Err(InitCheck::InvalidKe(local_group))
            } else {
                Err(InitCheck::NoProposalChosen)
            };
        }
        match msg.payloads.key_exchange() {
            Some((group, _)) if group == local_group => Ok(()),
            Some(_) => Err(InitCheck::InvalidKe(local_group)),
            None => Err(InitCheck::Drop("INIT request has no KE payload")),
        }
    }

    async fn send_init_reply(
        &self,
        datagram: &Datagram,
        header: &IkeHeader,
        notify: NotifyPayload,
    ) -> Result<(), IkeError> {
        let mut reply = Message::new(IkeHeader::new(
            header.initiator_spi,
            0,
            ExchangeType::IKE_SA_INIT,
            Flags::RESPONSE,
            0,
        ));
        reply.payloads.push(Payload::Notify(notify));
        let encoded = reply.encode()?;
        self.port
            .write_packet(&encoded, datagram.remote_addr)
            .await?;
        Ok(())
    }

    fn watch_session(&self, spi: u64, handle: SessionHandle) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let mut handle = handle;
            handle.wait_done().await;
            sessions.remove(spi);
            info!("Removed IKE SA {:x}", spi);
        });
    }
}

// Cookie notify data: HMAC(secret, Ni | peer IP | SPIi).
fn compute_cookie(secret: &[u8; 32], nonce: &[u8], remote_ip: IpAddr, spi_i: u64) -> Vec<u8> {
    let ip_octets = match remote_ip {
        IpAddr::V4(addr) => addr.octets().to_vec(),
        IpAddr::V6(addr) => addr.octets().to_vec(),
    };
    let mut data = Vec::with_capacity(nonce.len() + ip_octets.len() + 8);
    data.extend_from_slice(nonce);
    data.extend_from_slice(&ip_octets);
    data.extend_from_slice(&spi_i.to_be_bytes());
    crypto::hmac_sha256(secret, &data)
}

#[derive(Debug)]
pub enum IkeError {
    Internal(&'static str),
    Format(message::FormatError),
    Session(SessionError),
    Cert(identity::CertError),
    Io(io::Error),
}

impl fmt::Display for IkeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Format(err) => write!(f, "Format error: {}", err),
            Self::Session(err) => write!(f, "Session error: {}", err),
            Self::Cert(err) => write!(f, "PKI cert error: {}", err),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl error::Error for IkeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_) => None,
            Self::Format(err) => Some(err),
            Self::Session(err) => Some(err),
            Self::Cert(err) => Some(err),
            Self::Io(err) => Some(err),
        }
    }
}

impl From<&'static str> for IkeError {
    fn from(msg: &'static str) -> IkeError {
        Self::Internal(msg)
    }
}

impl From<message::FormatError> for IkeError {
    fn from(err: message::FormatError) -> IkeError {
        Self::Format(err)
    }
}

impl From<SessionError> for IkeError {
    fn from(err: SessionError) -> IkeError {
        Self::Session(err)
    }
}

impl From<identity::CertError> for IkeError {
    fn from(err: identity::CertError) -> IkeError {
        Self::Cert(err)
    }
}

impl From<io::Error> for IkeError {
    fn from(err: io::Error) -> IkeError {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_is_stable_per_peer() {
        let secret = [7u8; 32];
        let nonce = [1u8; 32];
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        let first = compute_cookie(&secret, &nonce, addr, 42);
        let second = compute_cookie(&secret, &nonce, addr, 42);
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        let other_peer = compute_cookie(&secret, &nonce, "192.0.2.2".parse().unwrap(), 42);
        assert_ne!(first, other_peer);
        let other_spi = compute_cookie(&secret, &nonce, addr, 43);
        assert_ne!(first, other_spi);
    }

    #[test]
    fn network_selector_covers_prefix() {
        let ts = selector_from_network("192.168.10.0".parse().unwrap(), 24);
        assert_eq!(ts.start_addr, "192.168.10.0".parse::<IpAddr>().unwrap());
        assert_eq!(ts.end_addr, "192.168.10.255".parse::<IpAddr>().unwrap());
        let host = selector_from_network("10.0.0.5".parse().unwrap(), 32);
        assert_eq!(host.start_addr, host.end_addr);
    }

    #[test]
    fn session_table_insert_is_exclusive() {
        // Exercised indirectly through the handshake tests; the table itself
        // only needs the duplicate check here.
        let table = SessionTable::new();
        assert!(table.get(1).is_none());
        assert!(table.remove(1).is_none());
    }
}
