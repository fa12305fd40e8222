// End-to-end exchanges between two engines over an in-memory packet port.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;

use ikev2d::ike::{
    self,
    identity::{Identity, PskIdentity},
    message::{SaTransform, TransformType},
    Config, Datagram, PacketPort, Server, SessionError,
};
use ikev2d::platform::{PolicyParams, SaParams, SessionCallbacks};

const ADDR_A: &str = "192.168.10.2:4500";
const ADDR_B: &str = "10.10.10.2:4500";

struct MemPort {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: Notify,
    write_count: AtomicUsize,
    // 0-based indexes of outbound writes to silently discard.
    drop_writes: Vec<usize>,
}

fn port_pair(addr_a: &str, addr_b: &str) -> (MemPort, MemPort) {
    port_pair_dropping(addr_a, addr_b, vec![], vec![])
}

fn port_pair_dropping(
    addr_a: &str,
    addr_b: &str,
    drop_a: Vec<usize>,
    drop_b: Vec<usize>,
) -> (MemPort, MemPort) {
    let addr_a: SocketAddr = addr_a.parse().expect("valid address");
    let addr_b: SocketAddr = addr_b.parse().expect("valid address");
    let (tx_ab, rx_ab) = mpsc::unbounded_channel();
    let (tx_ba, rx_ba) = mpsc::unbounded_channel();
    let port_a = MemPort {
        local_addr: addr_a,
        peer_addr: addr_b,
        tx: tx_ab,
        rx: tokio::sync::Mutex::new(rx_ba),
        closed: Notify::new(),
        write_count: AtomicUsize::new(0),
        drop_writes: drop_a,
    };
    let port_b = MemPort {
        local_addr: addr_b,
        peer_addr: addr_a,
        tx: tx_ba,
        rx: tokio::sync::Mutex::new(rx_ab),
        closed: Notify::new(),
        write_count: AtomicUsize::new(0),
        drop_writes: drop_b,
    };
    (port_a, port_b)
}

impl PacketPort for MemPort {
    fn write_packet(
        &self,
        data: &[u8],
        _to_addr: SocketAddr,
    ) -> impl Future<Output = io::Result<()>> + Send {
        let index = self.write_count.fetch_add(1, Ordering::SeqCst);
        let dropped = self.drop_writes.contains(&index);
        let result = if dropped {
            Ok(())
        } else {
            self.tx
                .send(data.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionAborted, "peer is gone"))
        };
        async move { result }
    }

    fn read_message(&self) -> impl Future<Output = io::Result<Datagram>> + Send {
        async move {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                _ = self.closed.notified() => {
                    Err(io::Error::new(io::ErrorKind::ConnectionAborted, "port is closed"))
                }
                data = rx.recv() => match data {
                    Some(data) => Ok(Datagram {
                        data,
                        local_addr: self.local_addr,
                        remote_addr: self.peer_addr,
                    }),
                    None => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "peer is gone")),
                }
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn close(&self) {
        self.closed.notify_waiters();
    }
}

#[derive(Clone, Debug)]
enum Callback {
    InstallPolicy(PolicyParams),
    RemovePolicy(PolicyParams),
    InstallSa(SaParams),
    RemoveSa(SaParams),
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Callback>>>,
}

impl Recorder {
    fn callbacks(&self) -> SessionCallbacks {
        let install_policy = self.events.clone();
        let remove_policy = self.events.clone();
        let install_sa = self.events.clone();
        let remove_sa = self.events.clone();
        SessionCallbacks {
            install_policy: Arc::new(move |_, pol| {
                install_policy
                    .lock()
                    .unwrap()
                    .push(Callback::InstallPolicy(pol.clone()));
                Ok(())
            }),
            remove_policy: Arc::new(move |_, pol| {
                remove_policy
                    .lock()
                    .unwrap()
                    .push(Callback::RemovePolicy(pol.clone()));
                Ok(())
            }),
            install_child_sa: Arc::new(move |_, sa| {
                install_sa
                    .lock()
                    .unwrap()
                    .push(Callback::InstallSa(sa.clone()));
                Ok(())
            }),
            remove_child_sa: Arc::new(move |_, sa| {
                remove_sa
                    .lock()
                    .unwrap()
                    .push(Callback::RemoveSa(sa.clone()));
                Ok(())
            }),
        }
    }

    fn installed_sas(&self) -> Vec<SaParams> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Callback::InstallSa(sa) => Some(sa.clone()),
                _ => None,
            })
            .collect()
    }

    fn removed_sas(&self) -> Vec<SaParams> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Callback::RemoveSa(sa) => Some(sa.clone()),
                _ => None,
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    // install_policy calls before the first install_child_sa.
    fn policies_before_first_sa(&self) -> usize {
        let events = self.events.lock().unwrap();
        events
            .iter()
            .take_while(|event| !matches!(event, Callback::InstallSa(_)))
            .filter(|event| matches!(event, Callback::InstallPolicy(_)))
            .count()
    }
}

fn psk_config() -> Config {
    let local = Identity::Psk(PskIdentity::new("ak@msgbox.io", b"foo"));
    let remote = Identity::Psk(PskIdentity::new("ak@msgbox.io", b"foo"));
    Config::new(Arc::new(local), Arc::new(remote))
}

async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

struct TestPeers {
    server_a: Arc<Server<MemPort>>,
    server_b: Arc<Server<MemPort>>,
    recorder_a: Recorder,
    recorder_b: Recorder,
}

fn start_peers(config_a: Config, config_b: Config, port_a: MemPort, port_b: MemPort) -> TestPeers {
    let recorder_a = Recorder::default();
    let recorder_b = Recorder::default();
    let server_a = Arc::new(Server::new(config_a, port_a, recorder_a.callbacks()));
    let server_b = Arc::new(Server::new(config_b, port_b, recorder_b.callbacks()));
    let run_a = server_a.clone();
    let run_b = server_b.clone();
    tokio::spawn(async move { run_a.run().await });
    tokio::spawn(async move { run_b.run().await });
    TestPeers {
        server_a,
        server_b,
        recorder_a,
        recorder_b,
    }
}

impl TestPeers {
    fn shutdown(&self) {
        self.server_a.handle().shutdown();
        self.server_b.handle().shutdown();
    }
}

// Scenario: initiator happy path with the default ChaCha20-Poly1305/ECP-256
// suite and PSK identities; both sides install exactly one child SA keyed
// from the same KEYMAT.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initiator_happy_path() {
    let (port_a, port_b) = port_pair(ADDR_A, ADDR_B);
    let peers = start_peers(psk_config(), psk_config(), port_a, port_b);
    peers.server_a.connect(ADDR_B.parse().unwrap());

    let recorder_a = peers.recorder_a.clone();
    let recorder_b = peers.recorder_b.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            recorder_a.installed_sas().len() == 1 && recorder_b.installed_sas().len() == 1
        })
        .await,
        "both sides should install a child SA"
    );

    let sa_a = &peers.recorder_a.installed_sas()[0];
    let sa_b = &peers.recorder_b.installed_sas()[0];
    assert!(sa_a.is_initiator);
    assert!(!sa_b.is_initiator);
    assert_ne!(sa_a.spi_initiator, sa_a.spi_responder);
    // Both ends derived the same KEYMAT partition, roles swapped.
    assert_eq!(sa_a.spi_initiator, sa_b.spi_initiator);
    assert_eq!(sa_a.spi_responder, sa_b.spi_responder);
    assert_eq!(sa_a.enc_key_initiator, sa_b.enc_key_initiator);
    assert_eq!(sa_a.enc_key_responder, sa_b.enc_key_responder);
    assert_ne!(sa_a.enc_key_initiator, sa_a.enc_key_responder);
    // Policies precede the child SA on both sides.
    assert!(peers.recorder_a.policies_before_first_sa() > 0);
    assert!(peers.recorder_b.policies_before_first_sa() > 0);

    peers.shutdown();
}

// Scenario: responder challenges with a cookie; the initiator echoes it in a
// retried INIT and the handshake completes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cookie_challenge_is_echoed() {
    let (port_a, port_b) = port_pair(ADDR_A, ADDR_B);
    let mut config_b = psk_config();
    config_b.throttle_init_requests = true;
    let peers = start_peers(psk_config(), config_b, port_a, port_b);
    peers.server_a.connect(ADDR_B.parse().unwrap());

    let recorder_a = peers.recorder_a.clone();
    let recorder_b = peers.recorder_b.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            recorder_a.installed_sas().len() == 1 && recorder_b.installed_sas().len() == 1
        })
        .await,
        "handshake should complete after the cookie round trip"
    );

    peers.shutdown();
}

// A responder that issued cookies rejects INIT requests without the echo.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cookie_is_required_once_issued() {
    use ikev2d::ike::message::{
        ExchangeType, Flags, IkeHeader, Message, NotifyMessageType, Payload, Proposal, ProtocolId,
    };

    let (port_a, port_b) = port_pair(ADDR_A, ADDR_B);
    let mut config_b = psk_config();
    config_b.throttle_init_requests = true;
    let recorder_b = Recorder::default();
    let server_b = Arc::new(Server::new(config_b, port_b, recorder_b.callbacks()));
    let run_b = server_b.clone();
    tokio::spawn(async move { run_b.run().await });

    // A hand-built INIT without a cookie only ever gets COOKIE challenges.
    let mut init = Message::new(IkeHeader::new(
        0x1122334455667788,
        0,
        ExchangeType::IKE_SA_INIT,
        Flags::INITIATOR,
        0,
    ));
    init.payloads.push(Payload::SecurityAssociation(vec![Proposal {
        number: 1,
        protocol_id: ProtocolId::IKE,
        spi: vec![],
        transforms: vec![
            SaTransform::with_key_length(TransformType::ENCR_CHACHA20_POLY1305, 256),
            SaTransform::new(TransformType::PRF_HMAC_SHA2_256),
            SaTransform::new(TransformType::DH_256_ECP),
        ],
    }]));
    init.payloads.push(Payload::KeyExchange {
        group: 19,
        data: vec![0x33; 64],
    });
    init.payloads.push(Payload::Nonce(vec![0x44; 32]));
    let encoded = init.encode().expect("encode INIT");

    for _ in 0..2 {
        port_a
            .write_packet(&encoded, ADDR_B.parse().unwrap())
            .await
            .expect("send INIT");
        let reply = port_a.read_message().await.expect("read challenge");
        let reply = Message::decode(&reply.data).expect("decode challenge");
        assert!(reply
            .payloads
            .notification(NotifyMessageType::COOKIE)
            .is_some());
    }
    assert_eq!(recorder_b.len(), 0);
    server_b.handle().shutdown();
}

// Scenario: initiator proposes MODP-2048, responder only accepts ECP-256;
// INVALID_KE_PAYLOAD carries group 19 and the rebuilt INIT completes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_ke_reselects_group() {
    let (port_a, port_b) = port_pair(ADDR_A, ADDR_B);
    let mut config_a = psk_config();
    config_a
        .proposal_ike
        .replace(SaTransform::new(TransformType::DH_2048_MODP));
    let peers = start_peers(config_a, psk_config(), port_a, port_b);
    peers.server_a.connect(ADDR_B.parse().unwrap());

    let recorder_a = peers.recorder_a.clone();
    let recorder_b = peers.recorder_b.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            recorder_a.installed_sas().len() == 1 && recorder_b.installed_sas().len() == 1
        })
        .await,
        "handshake should complete after group reselection"
    );

    peers.shutdown();
}

// Scenario: the first IKE_AUTH response is lost; the initiator retransmits
// and the responder replays its held reply bit-for-bit.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_auth_response_is_replayed() {
    // B's write #0 is the INIT response, write #1 the AUTH response.
    let (port_a, port_b) = port_pair_dropping(ADDR_A, ADDR_B, vec![], vec![1]);
    let peers = start_peers(psk_config(), psk_config(), port_a, port_b);
    peers.server_a.connect(ADDR_B.parse().unwrap());

    let recorder_a = peers.recorder_a.clone();
    let recorder_b = peers.recorder_b.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            recorder_a.installed_sas().len() == 1 && recorder_b.installed_sas().len() == 1
        })
        .await,
        "handshake should complete after the retransmission"
    );
    // The replay path never reinstalls.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(peers.recorder_a.installed_sas().len(), 1);
    assert_eq!(peers.recorder_b.installed_sas().len(), 1);

    peers.shutdown();
}

// Scenario: mismatched PSKs; the responder answers AUTHENTICATION_FAILED,
// both sides terminate and no child SA state is ever touched.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn authentication_failure_terminates() {
    let (port_a, port_b) = port_pair(ADDR_A, ADDR_B);
    let mut config_b = psk_config();
    config_b.remote_id = Arc::new(Identity::Psk(PskIdentity::new("ak@msgbox.io", b"bar")));
    let recorder_b = Recorder::default();
    let server_b = Arc::new(Server::new(config_b, port_b, recorder_b.callbacks()));
    let run_b = server_b.clone();
    tokio::spawn(async move { run_b.run().await });

    // Drive the initiator session directly to observe its settled error.
    let recorder_a = Recorder::default();
    let port_a = Arc::new(port_a);
    let handle = ike::session::spawn_initiator(
        psk_config(),
        port_a.clone(),
        recorder_a.callbacks(),
        ADDR_B.parse().unwrap(),
    )
    .expect("spawn initiator");
    let pump_handle = handle.clone();
    let pump_port = port_a.clone();
    tokio::spawn(async move {
        while let Ok(datagram) = pump_port.read_message().await {
            pump_handle.post_message(datagram);
        }
    });

    let mut waiter = handle.clone();
    tokio::time::timeout(Duration::from_secs(5), waiter.wait_done())
        .await
        .expect("session should terminate");
    assert_eq!(handle.error(), Some(SessionError::AuthenticationFailed));
    // Nothing was installed, so nothing may be removed.
    assert_eq!(recorder_a.len(), 0);
    assert_eq!(recorder_b.installed_sas().len(), 0);
    assert_eq!(recorder_b.removed_sas().len(), 0);
    server_b.handle().shutdown();
    port_a.close();
}

// Scenario: a 200ms lifetime triggers break-before-make rekeying; the old
// SA is removed before the replacement SA is installed.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rekey_is_break_before_make() {
    let (port_a, port_b) = port_pair(ADDR_A, ADDR_B);
    let mut config_a = psk_config();
    config_a.lifetime = Duration::from_millis(200);
    let peers = start_peers(config_a, psk_config(), port_a, port_b);
    peers.server_a.connect(ADDR_B.parse().unwrap());

    let recorder_a = peers.recorder_a.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            recorder_a.installed_sas().len() >= 2
        })
        .await,
        "the supervisor should establish a replacement SA"
    );

    let events = peers.recorder_a.events.lock().unwrap().clone();
    let first_install = events
        .iter()
        .position(|e| matches!(e, Callback::InstallSa(_)))
        .expect("first install");
    let first_remove = events
        .iter()
        .position(|e| matches!(e, Callback::RemoveSa(_)))
        .expect("remove after rekey");
    let second_install = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, Callback::InstallSa(_)))
        .map(|(i, _)| i)
        .nth(1)
        .expect("second install");
    assert!(first_install < first_remove);
    assert!(first_remove < second_install);

    // The replacement SA negotiated fresh SPIs.
    let sas = peers.recorder_a.installed_sas();
    assert_ne!(sas[0].spi_initiator, sas[1].spi_initiator);

    peers.shutdown();
}
