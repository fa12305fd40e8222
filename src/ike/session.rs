use std::{
    error, fmt, io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, info, warn};
use rand::Rng;
use tokio::{
    sync::{mpsc, watch},
    time::{sleep_until, Instant},
};

use crate::platform::{
    Direction, IpsecMode, PlatformError, PolicyAction, PolicyParams, SaParams, SessionCallbacks,
    SessionInfo,
};

use super::crypto::{self, CryptoError, InitError};
use super::identity::AuthError;
use super::message::{
    self, ExchangeType, Flags, IkeHeader, Message, NotifyMessageType, NotifyPayload, Payload,
    PayloadType, Payloads, ProtocolId, TrafficSelector, TransformType,
};
use super::state::{self, Event, State};
use super::tkm::Tkm;
use super::{Config, Datagram, PacketPort};

const SESSION_INBOX_SIZE: usize = 32;
const IKE_RETRANSMISSIONS_LIMIT: usize = 5;
const IKE_RETRANSMIT_DELAY: Duration = Duration::from_millis(500);

const INIT_PAYLOADS: [PayloadType; 3] = [
    PayloadType::SECURITY_ASSOCIATION,
    PayloadType::KEY_EXCHANGE,
    PayloadType::NONCE,
];
const AUTH_I_PAYLOADS: [PayloadType; 5] = [
    PayloadType::ID_INITIATOR,
    PayloadType::AUTHENTICATION,
    PayloadType::SECURITY_ASSOCIATION,
    PayloadType::TRAFFIC_SELECTOR_INITIATOR,
    PayloadType::TRAFFIC_SELECTOR_RESPONDER,
];
const AUTH_R_PAYLOADS: [PayloadType; 5] = [
    PayloadType::ID_RESPONDER,
    PayloadType::AUTHENTICATION,
    PayloadType::SECURITY_ASSOCIATION,
    PayloadType::TRAFFIC_SELECTOR_INITIATOR,
    PayloadType::TRAFFIC_SELECTOR_RESPONDER,
];

pub enum SessionInput {
    Datagram(Datagram),
    Close(SessionError),
}

// Clonable face of a session: the multiplexer posts datagrams through it,
// watchers await the done signal and read the settled error.
#[derive(Clone)]
pub struct SessionHandle {
    pub initiator_spi: u64,
    inbox: mpsc::Sender<SessionInput>,
    done: watch::Receiver<bool>,
    err: Arc<Mutex<Option<SessionError>>>,
}

impl SessionHandle {
    // Non-blocking post; a full inbox drops the datagram (the peer will
    // retransmit).
    pub fn post_message(&self, datagram: Datagram) {
        if let Err(err) = self.inbox.try_send(SessionInput::Datagram(datagram)) {
            warn!("Session {:x} inbox is full: {}", self.initiator_spi, err);
        }
    }

    pub fn close(&self, err: SessionError) {
        let _ = self.inbox.try_send(SessionInput::Close(err));
    }

    pub async fn wait_done(&mut self) {
        while !*self.done.borrow() {
            if self.done.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn error(&self) -> Option<SessionError> {
        self.err.lock().expect("session error mutex").clone()
    }
}

// Spawns an initiator session: generates the initiator SPI, sends
// IKE_SA_INIT and drives the exchange to Mature.
pub fn spawn_initiator<P: PacketPort>(
    cfg: Config,
    port: Arc<P>,
    callbacks: SessionCallbacks,
    remote_addr: SocketAddr,
) -> Result<SessionHandle, SessionError> {
    let initiator_spi = loop {
        let spi = rand::thread_rng().gen::<u64>();
        if spi != 0 {
            break spi;
        }
    };
    let tkm = Tkm::new_initiator(&cfg.proposal_ike)?;
    let local_addr = port.local_addr();
    spawn_session(
        true,
        initiator_spi,
        0,
        tkm,
        cfg,
        port,
        callbacks,
        local_addr,
        remote_addr,
    )
}

// Spawns a responder session for a validated IKE_SA_INIT request; the caller
// posts the request datagram right after.
pub fn spawn_responder<P: PacketPort>(
    cfg: Config,
    port: Arc<P>,
    callbacks: SessionCallbacks,
    initiator_spi: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
) -> Result<SessionHandle, SessionError> {
    let tkm = Tkm::new_responder(&cfg.proposal_ike)?;
    spawn_session(
        false,
        initiator_spi,
        0,
        tkm,
        cfg,
        port,
        callbacks,
        local_addr,
        remote_addr,
    )
}

#[allow(clippy::too_many_arguments)]
fn spawn_session<P: PacketPort>(
    is_initiator: bool,
    initiator_spi: u64,
    responder_spi: u64,
    tkm: Tkm,
    cfg: Config,
    port: Arc<P>,
    callbacks: SessionCallbacks,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
) -> Result<SessionHandle, SessionError> {
    let (inbox_tx, inbox_rx) = mpsc::channel(SESSION_INBOX_SIZE);
    let (done_tx, done_rx) = watch::channel(false);
    let err = Arc::new(Mutex::new(None));
    let session = Session {
        is_initiator,
        state: if is_initiator {
            State::SmiInit
        } else {
            State::SmrInit
        },
        cfg,
        tkm,
        ike_spi_i: initiator_spi,
        ike_spi_r: responder_spi,
        esp_spi_local: 0,
        esp_spi_remote: 0,
        init_ib: vec![],
        init_rb: vec![],
        local_addr,
        remote_addr,
        port,
        callbacks,
        cookie: None,
        local_message_id: 0,
        remote_message_id: 0,
        last_sent_request: None,
        retransmit_at: None,
        retransmit_attempt: 0,
        last_response: None,
        installed: None,
        err: err.clone(),
        done_tx,
    };
    let handle = SessionHandle {
        initiator_spi,
        inbox: inbox_tx,
        done: done_rx,
        err,
    };
    tokio::spawn(session.run(inbox_rx));
    Ok(handle)
}

struct InstalledChild {
    policies: Vec<PolicyParams>,
    sa: SaParams,
}

// The per-SA actor. All state is owned by the session task; message handling
// is strictly serial, so no locks are needed.
struct Session<P: PacketPort> {
    is_initiator: bool,
    state: State,
    cfg: Config,
    tkm: Tkm,
    ike_spi_i: u64,
    ike_spi_r: u64,
    esp_spi_local: u32,
    esp_spi_remote: u32,
    // Raw encoded INIT messages, kept for the AUTH signed octets.
    init_ib: Vec<u8>,
    init_rb: Vec<u8>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    port: Arc<P>,
    callbacks: SessionCallbacks,
    cookie: Option<Vec<u8>>,
    local_message_id: u32,
    remote_message_id: u32,
    last_sent_request: Option<Vec<u8>>,
    retransmit_at: Option<Instant>,
    retransmit_attempt: usize,
    // The held response is replayed bit-for-bit on a duplicate request.
    last_response: Option<(u32, Vec<u8>)>,
    installed: Option<InstalledChild>,
    err: Arc<Mutex<Option<SessionError>>>,
    done_tx: watch::Sender<bool>,
}

impl<P: PacketPort> Session<P> {
    fn tag(&self) -> String {
        format!(
            "[{}]{:x}",
            if self.is_initiator { "I" } else { "R" },
            self.ike_spi_i
        )
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<SessionInput>) {
        if self.is_initiator {
            if let Err(err) = self.start_initiator().await {
                warn!("{} failed to start: {}", self.tag(), err);
                self.settle_error(err);
                self.apply_event(Event::Close);
            }
        }
        let rekey_at = Instant::now() + self.cfg.lifetime;
        while !self.state.is_finished() {
            let retransmit_at = self.retransmit_at.unwrap_or_else(far_future);
            tokio::select! {
                input = inbox.recv() => match input {
                    Some(SessionInput::Datagram(datagram)) => {
                        if let Err(err) = self.handle_datagram(datagram).await {
                            warn!("{} failed: {}", self.tag(), err);
                            self.settle_error(err);
                            self.apply_event(Event::Close);
                        }
                    }
                    Some(SessionInput::Close(err)) => {
                        self.close_with(err).await;
                    }
                    None => {
                        self.close_with(SessionError::Canceled).await;
                    }
                },
                _ = sleep_until(retransmit_at), if self.retransmit_at.is_some() => {
                    self.handle_retransmit().await;
                }
                _ = sleep_until(rekey_at) => {
                    info!("{} lifetime expired, rekeying", self.tag());
                    self.close_with(SessionError::DeadlineExceeded).await;
                }
            }
        }
        self.finish().await;
    }

    // Settles the session error; the first error wins.
    fn settle_error(&self, err: SessionError) {
        let mut slot = self.err.lock().expect("session error mutex");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn apply_event(&mut self, event: Event) {
        match state::transition(self.state, event) {
            Some(next) => {
                debug!("{} {} x {} -> {}", self.tag(), self.state, event, next);
                self.state = next;
            }
            None => {
                warn!("{} no transition for {} in {}", self.tag(), event, self.state);
            }
        }
    }

    async fn close_with(&mut self, err: SessionError) {
        let emit_delete = self.state.is_established();
        self.settle_error(err);
        if emit_delete {
            // Best-effort INFORMATIONAL Delete, not retransmitted.
            if let Err(err) = self.send_delete_request().await {
                debug!("{} failed to send Delete: {}", self.tag(), err);
            }
        }
        self.apply_event(Event::Close);
    }

    // Teardown: remove_child_sa strictly precedes remove_policy, and both
    // only run when a child SA was installed.
    async fn finish(&mut self) {
        if let Some(installed) = self.installed.take() {
            let info = self.session_info();
            if let Err(err) = (self.callbacks.remove_child_sa)(&info, &installed.sa) {
                warn!("{} failed to remove child SA: {}", self.tag(), err);
            }
            for policy in &installed.policies {
                if let Err(err) = (self.callbacks.remove_policy)(&info, policy) {
                    warn!("{} failed to remove policy: {}", self.tag(), err);
                }
            }
        }
        self.apply_event(Event::Finished);
        info!("{} finished", self.tag());
        let _ = self.done_tx.send(true);
    }

    fn session_info(&self) -> SessionInfo {
        SessionInfo {
            initiator_spi: self.ike_spi_i,
            responder_spi: self.ike_spi_r,
            is_initiator: self.is_initiator,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
        }
    }

    async fn start_initiator(&mut self) -> Result<(), SessionError> {
        self.send_init_request().await?;
        self.apply_event(Event::Connect);
        Ok(())
    }

    // IKE_SA_INIT request: [N(COOKIE),] SA, KE, Ni.
    async fn send_init_request(&mut self) -> Result<(), SessionError> {
        let mut msg = Message::new(IkeHeader::new(
            self.ike_spi_i,
            0,
            ExchangeType::IKE_SA_INIT,
            Flags::INITIATOR,
            0,
        ));
        if let Some(cookie) = self.cookie.as_ref() {
            // An echoed cookie must be the first payload.
            msg.payloads.push(Payload::Notify(NotifyPayload::with_data(
                NotifyMessageType::COOKIE,
                cookie.clone(),
            )));
        }
        msg.payloads.push(Payload::SecurityAssociation(vec![self
            .cfg
            .proposal_ike
            .to_proposal(ProtocolId::IKE, &[])]));
        msg.payloads.push(Payload::KeyExchange {
            group: self.tkm.dh_group(),
            data: self.tkm.dh_public_key()?,
        });
        msg.payloads
            .push(Payload::Nonce(self.tkm.local_nonce().to_vec()));
        let encoded = msg.encode()?;
        self.init_ib = encoded.clone();
        self.local_message_id = 0;
        self.send_request(encoded).await
    }

    async fn send_request(&mut self, encoded: Vec<u8>) -> Result<(), SessionError> {
        self.port
            .write_packet(&encoded, self.remote_addr)
            .await
            .map_err(SessionError::from)?;
        self.last_sent_request = Some(encoded);
        self.retransmit_attempt = 0;
        self.retransmit_at = Some(Instant::now() + IKE_RETRANSMIT_DELAY);
        Ok(())
    }

    // Exponential backoff: 500ms, 1s, 2s, 4s, 8s, then Timeout.
    async fn handle_retransmit(&mut self) {
        let request = match self.last_sent_request.as_ref() {
            Some(request) => request.clone(),
            None => {
                self.retransmit_at = None;
                return;
            }
        };
        self.retransmit_attempt += 1;
        if self.retransmit_attempt > IKE_RETRANSMISSIONS_LIMIT {
            warn!("{} exceeded retransmission limit", self.tag());
            self.settle_error(SessionError::Timeout);
            self.apply_event(Event::Timeout);
            return;
        }
        debug!(
            "{} retransmitting request {} (attempt {})",
            self.tag(),
            self.local_message_id,
            self.retransmit_attempt
        );
        if let Err(err) = self.port.write_packet(&request, self.remote_addr).await {
            warn!("{} failed to retransmit: {}", self.tag(), err);
        }
        let delay = IKE_RETRANSMIT_DELAY * (1 << self.retransmit_attempt);
        self.retransmit_at = Some(Instant::now() + delay);
    }

    fn request_completed(&mut self) {
        self.last_sent_request = None;
        self.retransmit_at = None;
        self.retransmit_attempt = 0;
        self.local_message_id += 1;
    }

    async fn handle_datagram(&mut self, datagram: Datagram) -> Result<(), SessionError> {
        let msg = match Message::decode(&datagram.data) {
            Ok(msg) => msg,
            Err(err) => {
                // Parse errors drop the datagram without a state change.
                warn!("{} invalid message: {}", self.tag(), err);
                return Ok(());
            }
        };
        if msg.header.is_response() {
            self.handle_response(&datagram, &msg).await
        } else {
            self.handle_request(&datagram, &msg).await
        }
    }

    async fn handle_response(
        &mut self,
        datagram: &Datagram,
        msg: &Message,
    ) -> Result<(), SessionError> {
        if self.last_sent_request.is_none() || msg.header.message_id != self.local_message_id {
            debug!(
                "{} dropping response with unexpected message ID {}",
                self.tag(),
                msg.header.message_id
            );
            return Ok(());
        }
        match self.state {
            State::SmiInitWait => self.process_init_response(datagram, msg).await,
            State::SmiAuthWait => self.process_auth_response(datagram, msg).await,
            _ => {
                // Delete acknowledgements and other late responses.
                debug!("{} ignoring response in {}", self.tag(), self.state);
                self.request_completed();
                Ok(())
            }
        }
    }

    async fn process_init_response(
        &mut self,
        datagram: &Datagram,
        msg: &Message,
    ) -> Result<(), SessionError> {
        if let Some(notify) = msg.payloads.notification(NotifyMessageType::COOKIE) {
            info!("{} got cookie challenge, retrying INIT", self.tag());
            self.cookie = Some(notify.data.clone());
            self.send_init_request().await?;
            self.apply_event(Event::InitRetry);
            return Ok(());
        }
        if let Some(notify) = msg
            .payloads
            .notification(NotifyMessageType::INVALID_KE_PAYLOAD)
        {
            if notify.data.len() != 2 {
                warn!("{} INVALID_KE_PAYLOAD carries no group", self.tag());
                return Ok(());
            }
            let mut group = [0u8; 2];
            group.copy_from_slice(&notify.data);
            let group = u16::from_be_bytes(group);
            info!("{} peer prefers DH group {}, retrying INIT", self.tag(), group);
            self.cfg.proposal_ike.replace(message::SaTransform::new(
                TransformType::dh_from_group(group),
            ));
            self.tkm = Tkm::new_initiator(&self.cfg.proposal_ike)?;
            self.send_init_request().await?;
            self.apply_event(Event::InitRetry);
            return Ok(());
        }
        if let Some(notify) = msg.payloads.notifications().find(|n| n.message_type.is_error()) {
            warn!("{} peer rejected INIT: {}", self.tag(), notify.message_type);
            self.settle_error(SessionError::NoProposalChosen);
            self.apply_event(Event::NoProposalChosen);
            return Ok(());
        }
        if msg.payloads.ensure(&INIT_PAYLOADS).is_err() {
            warn!("{} INIT response is missing payloads", self.tag());
            return Ok(());
        }
        let proposals = msg.payloads.security_association().unwrap_or(&[]);
        if crypto::negotiate(&self.cfg.proposal_ike, ProtocolId::IKE, proposals).is_none() {
            warn!("{} INIT response proposal is unacceptable", self.tag());
            self.settle_error(SessionError::NoProposalChosen);
            self.apply_event(Event::NoProposalChosen);
            return Ok(());
        }
        let (group, peer_public_key) = match msg.payloads.key_exchange() {
            Some(kex) => kex,
            None => return Ok(()),
        };
        if group != self.tkm.dh_group() {
            warn!("{} INIT response KE group mismatch", self.tag());
            return Ok(());
        }
        let nonce = match msg.payloads.nonce() {
            Some(nonce) => nonce.to_vec(),
            None => return Ok(()),
        };
        self.tkm.set_peer_nonce(&nonce);
        self.tkm.compute_dh_shared(peer_public_key)?;
        self.ike_spi_r = msg.header.responder_spi;
        let raw = datagram
            .data
            .get(..msg.header.length as usize)
            .unwrap_or(&datagram.data);
        self.init_rb = raw.to_vec();
        self.tkm.isa_create(
            &self.ike_spi_i.to_be_bytes(),
            &self.ike_spi_r.to_be_bytes(),
        )?;
        self.request_completed();
        self.apply_event(Event::InitResponseOk);
        self.send_auth_request().await
    }

    // IKE_AUTH request: SK {IDi, [CERT,] AUTH, SAi2, TSi, TSr,
    // N(INITIAL_CONTACT) [, N(USE_TRANSPORT_MODE)]}.
    async fn send_auth_request(&mut self) -> Result<(), SessionError> {
        self.esp_spi_local = nonzero_spi();
        self.ensure_selectors();
        let id_payload = self.cfg.local_id.id_payload();
        let signed_octets = self
            .tkm
            .auth_octets(true, &self.init_ib, &id_payload.body())?;
        let auth_data = self.cfg.local_id.sign(&self.tkm, &signed_octets)?;

        let mut payloads = Payloads::new();
        payloads.push(Payload::IdInitiator(id_payload));
        if let Some(cert) = self.cfg.local_id.certificate() {
            payloads.push(Payload::Certificate {
                encoding: message::CertificateEncoding::X509_SIGNATURE,
                data: cert.to_vec(),
            });
        }
        payloads.push(Payload::Authentication {
            method: self.cfg.local_id.auth_method(),
            data: auth_data,
        });
        payloads.push(Payload::SecurityAssociation(vec![self
            .cfg
            .proposal_esp
            .to_proposal(ProtocolId::ESP, &self.esp_spi_local.to_be_bytes())]));
        payloads.push(Payload::TrafficSelectorInitiator(self.cfg.ts_i.clone()));
        payloads.push(Payload::TrafficSelectorResponder(self.cfg.ts_r.clone()));
        payloads.push(Payload::Notify(NotifyPayload::new(
            NotifyMessageType::INITIAL_CONTACT,
        )));
        if self.cfg.is_transport_mode {
            payloads.push(Payload::Notify(NotifyPayload::new(
                NotifyMessageType::USE_TRANSPORT_MODE,
            )));
        }

        let mut header = IkeHeader::new(
            self.ike_spi_i,
            self.ike_spi_r,
            ExchangeType::IKE_AUTH,
            Flags::INITIATOR,
            self.local_message_id,
        );
        let encoded = self.tkm.seal_message(&mut header, &payloads)?;
        self.send_request(encoded).await
    }

    async fn process_auth_response(
        &mut self,
        datagram: &Datagram,
        msg: &Message,
    ) -> Result<(), SessionError> {
        let raw = datagram
            .data
            .get(..msg.header.length as usize)
            .unwrap_or(&datagram.data);
        let payloads = match self.tkm.open_message(raw, msg) {
            Ok(payloads) => payloads,
            Err(err) => {
                // Failed integrity or decryption: as if it never arrived.
                debug!("{} discarding AUTH response: {}", self.tag(), err);
                return Ok(());
            }
        };
        if let Some(notify) = payloads.notifications().find(|n| n.message_type.is_error()) {
            warn!("{} peer rejected AUTH: {}", self.tag(), notify.message_type);
            let err = if notify.message_type == NotifyMessageType::AUTHENTICATION_FAILED {
                SessionError::AuthenticationFailed
            } else {
                SessionError::NoProposalChosen
            };
            self.settle_error(err);
            self.apply_event(Event::AuthFailed);
            return Ok(());
        }
        if payloads.ensure(&AUTH_R_PAYLOADS).is_err() {
            warn!("{} AUTH response is missing payloads", self.tag());
            self.settle_error(SessionError::AuthenticationFailed);
            self.apply_event(Event::AuthFailed);
            return Ok(());
        }
        let id_payload = payloads.identification(false).expect("IDr ensured");
        let (method, auth_data) = payloads.authentication().expect("AUTH ensured");
        let signed_octets = self
            .tkm
            .auth_octets(false, &self.init_rb, &id_payload.body())?;
        if let Err(err) = self.cfg.remote_id.verify(
            &self.tkm,
            &signed_octets,
            method,
            auth_data,
            id_payload,
            payloads.certificate().map(|(_, data)| data),
        ) {
            warn!("{} peer authentication failed: {}", self.tag(), err);
            self.settle_error(SessionError::AuthenticationFailed);
            self.apply_event(Event::AuthFailed);
            return Ok(());
        }
        let proposals = payloads.security_association().unwrap_or(&[]);
        let chosen = match crypto::negotiate(&self.cfg.proposal_esp, ProtocolId::ESP, proposals) {
            Some(chosen) => chosen,
            None => {
                warn!("{} AUTH response ESP proposal is unacceptable", self.tag());
                self.settle_error(SessionError::NoProposalChosen);
                self.apply_event(Event::NoProposalChosen);
                return Ok(());
            }
        };
        if chosen.remote_spi.len() != 4 {
            warn!("{} AUTH response ESP SPI length is invalid", self.tag());
            self.settle_error(SessionError::NoProposalChosen);
            self.apply_event(Event::NoProposalChosen);
            return Ok(());
        }
        let mut spi = [0u8; 4];
        spi.copy_from_slice(&chosen.remote_spi);
        self.esp_spi_remote = u32::from_be_bytes(spi);
        self.request_completed();
        self.install_child_sa()?;
        self.apply_event(Event::AuthResponseOk);
        info!("{} IKE SA established", self.tag());
        Ok(())
    }

    async fn handle_request(
        &mut self,
        datagram: &Datagram,
        msg: &Message,
    ) -> Result<(), SessionError> {
        let message_id = msg.header.message_id;
        if message_id + 1 == self.remote_message_id {
            // A duplicate of the last request: replay the held response.
            if let Some((id, response)) = self.last_response.as_ref() {
                if *id == message_id {
                    debug!("{} replaying response {}", self.tag(), message_id);
                    let response = response.clone();
                    self.port
                        .write_packet(&response, self.remote_addr)
                        .await
                        .map_err(SessionError::from)?;
                }
            }
            return Ok(());
        }
        if message_id != self.remote_message_id {
            debug!(
                "{} dropping request with unexpected message ID {}",
                self.tag(),
                message_id
            );
            return Ok(());
        }
        let response = match msg.header.exchange_type {
            ExchangeType::IKE_SA_INIT if self.state == State::SmrInit => {
                self.process_init_request(datagram, msg).await?
            }
            ExchangeType::IKE_AUTH if self.state == State::SmrAuth => {
                self.process_auth_request(datagram, msg).await?
            }
            ExchangeType::CREATE_CHILD_SA if self.state.is_established() => {
                // Rekeying is break-before-make; no new child SAs here.
                let mut payloads = Payloads::new();
                payloads.push(Payload::Notify(NotifyPayload::new(
                    NotifyMessageType::NO_ADDITIONAL_SAS,
                )));
                Some(self.seal_response(ExchangeType::CREATE_CHILD_SA, message_id, &payloads)?)
            }
            ExchangeType::INFORMATIONAL => self.process_informational_request(datagram, msg).await?,
            _ => {
                debug!(
                    "{} dropping {} request in {}",
                    self.tag(),
                    msg.header.exchange_type,
                    self.state
                );
                None
            }
        };
        if let Some(response) = response {
            self.port
                .write_packet(&response, self.remote_addr)
                .await
                .map_err(SessionError::from)?;
            self.last_response = Some((message_id, response));
            self.remote_message_id = message_id + 1;
        }
        Ok(())
    }

    async fn process_init_request(
        &mut self,
        datagram: &Datagram,
        msg: &Message,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        if msg.payloads.ensure(&INIT_PAYLOADS).is_err() {
            debug!("{} INIT request is missing payloads", self.tag());
            return Ok(None);
        }
        let proposals = msg.payloads.security_association().unwrap_or(&[]);
        let chosen = match crypto::negotiate(&self.cfg.proposal_ike, ProtocolId::IKE, proposals) {
            Some(chosen) => chosen,
            None => {
                self.settle_error(SessionError::NoProposalChosen);
                self.apply_event(Event::NoProposalChosen);
                return Ok(None);
            }
        };
        let (group, peer_public_key) = msg.payloads.key_exchange().expect("KE ensured");
        if group != self.tkm.dh_group() {
            debug!("{} INIT request KE group mismatch", self.tag());
            return Ok(None);
        }
        let nonce = msg.payloads.nonce().expect("nonce ensured").to_vec();
        self.tkm.set_peer_nonce(&nonce);
        self.tkm.compute_dh_shared(peer_public_key)?;
        self.ike_spi_r = nonzero_spi_u64();

        let mut response = Message::new(IkeHeader::new(
            self.ike_spi_i,
            self.ike_spi_r,
            ExchangeType::IKE_SA_INIT,
            Flags::RESPONSE,
            msg.header.message_id,
        ));
        let mut accepted = self.cfg.proposal_ike.to_proposal(ProtocolId::IKE, &[]);
        accepted.number = chosen.proposal_number;
        response
            .payloads
            .push(Payload::SecurityAssociation(vec![accepted]));
        response.payloads.push(Payload::KeyExchange {
            group: self.tkm.dh_group(),
            data: self.tkm.dh_public_key()?,
        });
        response
            .payloads
            .push(Payload::Nonce(self.tkm.local_nonce().to_vec()));
        let encoded = response.encode()?;

        let raw = datagram
            .data
            .get(..msg.header.length as usize)
            .unwrap_or(&datagram.data);
        self.init_ib = raw.to_vec();
        self.init_rb = encoded.clone();
        self.tkm.isa_create(
            &self.ike_spi_i.to_be_bytes(),
            &self.ike_spi_r.to_be_bytes(),
        )?;
        self.apply_event(Event::Accept);
        Ok(Some(encoded))
    }

    async fn process_auth_request(
        &mut self,
        datagram: &Datagram,
        msg: &Message,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let raw = datagram
            .data
            .get(..msg.header.length as usize)
            .unwrap_or(&datagram.data);
        let payloads = match self.tkm.open_message(raw, msg) {
            Ok(payloads) => payloads,
            Err(err) => {
                debug!("{} discarding AUTH request: {}", self.tag(), err);
                return Ok(None);
            }
        };
        if payloads.ensure(&AUTH_I_PAYLOADS).is_err() {
            warn!("{} AUTH request is missing payloads", self.tag());
            return self.auth_failed_response(msg).map(Some);
        }
        let id_payload = payloads.identification(true).expect("IDi ensured");
        let (method, auth_data) = payloads.authentication().expect("AUTH ensured");
        let signed_octets = self
            .tkm
            .auth_octets(true, &self.init_ib, &id_payload.body())?;
        if let Err(err) = self.cfg.remote_id.verify(
            &self.tkm,
            &signed_octets,
            method,
            auth_data,
            id_payload,
            payloads.certificate().map(|(_, data)| data),
        ) {
            warn!("{} peer authentication failed: {}", self.tag(), err);
            return self.auth_failed_response(msg).map(Some);
        }
        info!("{} peer authenticated", self.tag());

        let proposals = payloads.security_association().unwrap_or(&[]);
        let chosen = match crypto::negotiate(&self.cfg.proposal_esp, ProtocolId::ESP, proposals) {
            Some(chosen) if chosen.remote_spi.len() == 4 => chosen,
            _ => {
                warn!("{} AUTH request ESP proposal is unacceptable", self.tag());
                self.settle_error(SessionError::NoProposalChosen);
                self.apply_event(Event::NoProposalChosen);
                let mut reply = Payloads::new();
                reply.push(Payload::Notify(NotifyPayload::new(
                    NotifyMessageType::NO_PROPOSAL_CHOSEN,
                )));
                return self
                    .seal_response(ExchangeType::IKE_AUTH, msg.header.message_id, &reply)
                    .map(Some);
            }
        };
        let mut spi = [0u8; 4];
        spi.copy_from_slice(&chosen.remote_spi);
        self.esp_spi_remote = u32::from_be_bytes(spi);
        self.esp_spi_local = nonzero_spi();

        let ts_i = payloads
            .traffic_selectors(true)
            .expect("TSi ensured")
            .to_vec();
        let ts_r = payloads
            .traffic_selectors(false)
            .expect("TSr ensured")
            .to_vec();
        self.cfg.ts_i = ts_i.clone();
        self.cfg.ts_r = ts_r.clone();

        let id_responder = self.cfg.local_id.id_payload();
        let signed_octets = self
            .tkm
            .auth_octets(false, &self.init_rb, &id_responder.body())?;
        let auth_data = self.cfg.local_id.sign(&self.tkm, &signed_octets)?;
        let mut reply = Payloads::new();
        reply.push(Payload::IdResponder(id_responder));
        if let Some(cert) = self.cfg.local_id.certificate() {
            reply.push(Payload::Certificate {
                encoding: message::CertificateEncoding::X509_SIGNATURE,
                data: cert.to_vec(),
            });
        }
        reply.push(Payload::Authentication {
            method: self.cfg.local_id.auth_method(),
            data: auth_data,
        });
        let mut accepted = self
            .cfg
            .proposal_esp
            .to_proposal(ProtocolId::ESP, &self.esp_spi_local.to_be_bytes());
        accepted.number = chosen.proposal_number;
        reply.push(Payload::SecurityAssociation(vec![accepted]));
        reply.push(Payload::TrafficSelectorInitiator(ts_i));
        reply.push(Payload::TrafficSelectorResponder(ts_r));
        let response =
            self.seal_response(ExchangeType::IKE_AUTH, msg.header.message_id, &reply)?;

        // The response is emitted before the child SA install.
        self.port
            .write_packet(&response, self.remote_addr)
            .await
            .map_err(SessionError::from)?;
        self.last_response = Some((msg.header.message_id, response));
        self.remote_message_id = msg.header.message_id + 1;
        self.install_child_sa()?;
        self.apply_event(Event::AuthRequestOk);
        info!("{} IKE SA established", self.tag());
        Ok(None)
    }

    fn auth_failed_response(&mut self, msg: &Message) -> Result<Vec<u8>, SessionError> {
        self.settle_error(SessionError::AuthenticationFailed);
        self.apply_event(Event::AuthFailed);
        let mut payloads = Payloads::new();
        payloads.push(Payload::Notify(NotifyPayload::new(
            NotifyMessageType::AUTHENTICATION_FAILED,
        )));
        self.seal_response(ExchangeType::IKE_AUTH, msg.header.message_id, &payloads)
    }

    async fn process_informational_request(
        &mut self,
        datagram: &Datagram,
        msg: &Message,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        if !self.tkm.has_keys() {
            debug!("{} dropping INFORMATIONAL before key derivation", self.tag());
            return Ok(None);
        }
        let raw = datagram
            .data
            .get(..msg.header.length as usize)
            .unwrap_or(&datagram.data);
        let payloads = match self.tkm.open_message(raw, msg) {
            Ok(payloads) => payloads,
            Err(err) => {
                debug!("{} discarding INFORMATIONAL request: {}", self.tag(), err);
                return Ok(None);
            }
        };
        let reply = Payloads::new();
        let response =
            self.seal_response(ExchangeType::INFORMATIONAL, msg.header.message_id, &reply)?;
        if payloads.delete().is_some() {
            info!("{} peer deleted the SA", self.tag());
            self.settle_error(SessionError::PeerDeleted);
            self.apply_event(Event::PeerDelete);
        }
        Ok(Some(response))
    }

    fn seal_response(
        &mut self,
        exchange_type: ExchangeType,
        message_id: u32,
        payloads: &Payloads,
    ) -> Result<Vec<u8>, SessionError> {
        let mut flags = Flags::RESPONSE;
        if self.is_initiator {
            flags = flags.with(Flags::INITIATOR);
        }
        let mut header = IkeHeader::new(
            self.ike_spi_i,
            self.ike_spi_r,
            exchange_type,
            flags,
            message_id,
        );
        Ok(self.tkm.seal_message(&mut header, payloads)?)
    }

    // SK {D(IKE)}, sent once on local teardown.
    async fn send_delete_request(&mut self) -> Result<(), SessionError> {
        let mut payloads = Payloads::new();
        payloads.push(Payload::Delete(message::DeletePayload {
            protocol_id: ProtocolId::IKE,
            spis: vec![],
        }));
        let mut flags = Flags::NONE;
        if self.is_initiator {
            flags = flags.with(Flags::INITIATOR);
        }
        let mut header = IkeHeader::new(
            self.ike_spi_i,
            self.ike_spi_r,
            ExchangeType::INFORMATIONAL,
            flags,
            self.local_message_id,
        );
        let encoded = self.tkm.seal_message(&mut header, &payloads)?;
        self.local_message_id += 1;
        self.port
            .write_packet(&encoded, self.remote_addr)
            .await
            .map_err(SessionError::from)
    }

    // Host-based selectors when the configuration has none.
    fn ensure_selectors(&mut self) {
        if !self.cfg.ts_i.is_empty() && !self.cfg.ts_r.is_empty() {
            return;
        }
        info!("{} adding host based selectors", self.tag());
        let (initiator_addr, responder_addr) = if self.is_initiator {
            (self.local_addr.ip(), self.remote_addr.ip())
        } else {
            (self.remote_addr.ip(), self.local_addr.ip())
        };
        self.cfg.ts_i = vec![TrafficSelector::from_address(initiator_addr)];
        self.cfg.ts_r = vec![TrafficSelector::from_address(responder_addr)];
    }

    // install_policy (per direction) strictly precedes install_child_sa.
    fn install_child_sa(&mut self) -> Result<(), SessionError> {
        let (encr_length, integ_length) = crypto::esp_keymat_lengths(&self.cfg.proposal_esp)?;
        let keys = self.tkm.child_sa_keys(encr_length, integ_length)?;
        let (spi_initiator, spi_responder) = if self.is_initiator {
            (self.esp_spi_local, self.esp_spi_remote)
        } else {
            (self.esp_spi_remote, self.esp_spi_local)
        };
        let enc_alg = self
            .cfg
            .proposal_esp
            .get_type(TransformType::TYPE_ENCR)
            .map(|tr| tr.transform_type)
            .unwrap_or(TransformType::ENCR_CHACHA20_POLY1305);
        let auth_alg = self
            .cfg
            .proposal_esp
            .get_type(TransformType::TYPE_INTEG)
            .map(|tr| tr.transform_type);
        let ipsec_mode = if self.cfg.is_transport_mode {
            IpsecMode::Transport
        } else {
            IpsecMode::Tunnel
        };
        let policies = vec![
            PolicyParams {
                src: self.local_addr.ip(),
                dst: self.remote_addr.ip(),
                src_port: 0,
                dst_port: 0,
                proto: 0,
                direction: Direction::Outbound,
                action: PolicyAction::Protect,
                ipsec_mode,
            },
            PolicyParams {
                src: self.remote_addr.ip(),
                dst: self.local_addr.ip(),
                src_port: 0,
                dst_port: 0,
                proto: 0,
                direction: Direction::Inbound,
                action: PolicyAction::Protect,
                ipsec_mode,
            },
        ];
        let sa = SaParams {
            spi_initiator,
            spi_responder,
            enc_alg,
            auth_alg,
            enc_key_initiator: keys.encr_initiator,
            auth_key_initiator: keys.integ_initiator,
            enc_key_responder: keys.encr_responder,
            auth_key_responder: keys.integ_responder,
            src: self.local_addr.ip(),
            dst: self.remote_addr.ip(),
            src_port: self.local_addr.port(),
            dst_port: self.remote_addr.port(),
            reqid: spi_initiator,
            is_initiator: self.is_initiator,
            is_transport: self.cfg.is_transport_mode,
        };
        let info = self.session_info();
        for policy in &policies {
            (self.callbacks.install_policy)(&info, policy)?;
        }
        (self.callbacks.install_child_sa)(&info, &sa)?;
        self.installed = Some(InstalledChild { policies, sa });
        Ok(())
    }
}

fn nonzero_spi() -> u32 {
    loop {
        let spi = rand::thread_rng().gen::<u32>();
        if spi != 0 {
            return spi;
        }
    }
}

fn nonzero_spi_u64() -> u64 {
    loop {
        let spi = rand::thread_rng().gen::<u64>();
        if spi != 0 {
            return spi;
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

// The single error value a session settles at close; observers read it once
// done fires. Rekey closes with DeadlineExceeded, explicit shutdown with
// Canceled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionError {
    Timeout,
    Canceled,
    DeadlineExceeded,
    AuthenticationFailed,
    NoProposalChosen,
    PeerDeleted,
    Internal(&'static str),
    Other(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Canceled => f.write_str("canceled"),
            Self::DeadlineExceeded => f.write_str("deadline exceeded"),
            Self::AuthenticationFailed => f.write_str("authentication failed"),
            Self::NoProposalChosen => f.write_str("no proposal chosen"),
            Self::PeerDeleted => f.write_str("peer deleted the SA"),
            Self::Internal(msg) => f.write_str(msg),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for SessionError {}

impl From<&'static str> for SessionError {
    fn from(msg: &'static str) -> SessionError {
        Self::Internal(msg)
    }
}

impl From<message::FormatError> for SessionError {
    fn from(err: message::FormatError) -> SessionError {
        Self::Other(format!("format error: {}", err))
    }
}

impl From<InitError> for SessionError {
    fn from(err: InitError) -> SessionError {
        Self::Other(format!("crypto init error: {}", err))
    }
}

impl From<CryptoError> for SessionError {
    fn from(err: CryptoError) -> SessionError {
        Self::Other(format!("crypto error: {}", err))
    }
}

impl From<AuthError> for SessionError {
    fn from(err: AuthError) -> SessionError {
        Self::Other(format!("auth error: {}", err))
    }
}

impl From<PlatformError> for SessionError {
    fn from(err: PlatformError) -> SessionError {
        Self::Other(format!("platform error: {}", err))
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> SessionError {
        Self::Other(format!("io error: {}", err))
    }
}
