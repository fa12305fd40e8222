use std::{
    fs,
    net::{IpAddr, SocketAddr},
    process,
    sync::Arc,
};

use log::warn;

use ikev2d::ike::{
    self,
    identity::{CertIdentity, Identity, PskIdentity},
    message::{SaTransform, TransformType},
    Config, Server, UdpPacketPort,
};
use ikev2d::logger;
use ikev2d::platform::SessionCallbacks;

const USAGE: &str = "Usage: ikev2d [OPTIONS]

Options:
      --local <ADDR>      address to bind to (default 0.0.0.0:4500)
      --remote <ADDR>     address to connect to (responder-only if omitted)
      --localnet <CIDR>   local tunnel network
      --remotenet <CIDR>  remote tunnel network
      --ca <FILE>         PEM encoded CA certificate
      --cert <FILE>       PEM encoded peer certificate
      --key <FILE>        PEM encoded peer key
      --peerid <NAME>     expected peer identity
      --esn               use extended sequence numbers for ESP
      --cookies           challenge new initiators with cookies
      --debug             debug logs";

struct Args {
    local: SocketAddr,
    remote: Option<SocketAddr>,
    localnet: Option<(IpAddr, u8)>,
    remotenet: Option<(IpAddr, u8)>,
    ca: Option<String>,
    cert: Option<String>,
    key: Option<String>,
    peer_id: Option<String>,
    esn: bool,
    cookies: bool,
    debug: bool,
}

impl Args {
    fn parse() -> Result<Args, String> {
        let mut args = Args {
            local: "0.0.0.0:4500"
                .parse()
                .expect("default listen address is valid"),
            remote: None,
            localnet: None,
            remotenet: None,
            ca: None,
            cert: None,
            key: None,
            peer_id: None,
            esn: false,
            cookies: false,
            debug: false,
        };
        let mut iter = std::env::args().skip(1);
        while let Some(flag) = iter.next() {
            let mut value = || {
                iter.next()
                    .ok_or_else(|| format!("{} requires a value", flag))
            };
            match flag.as_str() {
                "--local" => args.local = parse_addr(&value()?)?,
                "--remote" => args.remote = Some(parse_addr(&value()?)?),
                "--localnet" => args.localnet = Some(parse_cidr(&value()?)?),
                "--remotenet" => args.remotenet = Some(parse_cidr(&value()?)?),
                "--ca" => args.ca = Some(value()?),
                "--cert" => args.cert = Some(value()?),
                "--key" => args.key = Some(value()?),
                "--peerid" => args.peer_id = Some(value()?),
                "--esn" => args.esn = true,
                "--cookies" => args.cookies = true,
                "--debug" => args.debug = true,
                "--help" | "-h" => return Err(USAGE.to_string()),
                _ => return Err(format!("Unknown option {}\n{}", flag, USAGE)),
            }
        }
        Ok(args)
    }
}

fn parse_addr(value: &str) -> Result<SocketAddr, String> {
    value
        .parse()
        .map_err(|err| format!("Invalid address {}: {}", value, err))
}

fn parse_cidr(value: &str) -> Result<(IpAddr, u8), String> {
    let (addr, prefix) = value
        .split_once('/')
        .ok_or_else(|| format!("Invalid network {}: missing prefix", value))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|err| format!("Invalid network {}: {}", value, err))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|err| format!("Invalid prefix {}: {}", value, err))?;
    Ok((addr, prefix))
}

fn load_config(args: &Args) -> Result<Config, String> {
    let mut remote_id = None;
    let mut local_id = None;
    if let (Some(ca), Some(peer_id)) = (&args.ca, &args.peer_id) {
        let root_ca = fs::read_to_string(ca).map_err(|err| format!("Reading {}: {}", ca, err))?;
        let identity = CertIdentity::remote(&root_ca, peer_id)
            .map_err(|err| format!("Loading {}: {}", ca, err))?;
        remote_id = Some(Identity::Cert(identity));
    }
    if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
        let cert_pem =
            fs::read_to_string(cert).map_err(|err| format!("Reading {}: {}", cert, err))?;
        let key_pem = fs::read_to_string(key).map_err(|err| format!("Reading {}: {}", key, err))?;
        let identity = CertIdentity::local(&cert_pem, &key_pem)
            .map_err(|err| format!("Loading {}: {}", cert, err))?;
        local_id = Some(Identity::Cert(identity));
    }
    let (local_id, remote_id) = match (local_id, remote_id) {
        (Some(local_id), Some(remote_id)) => (local_id, remote_id),
        _ => (
            Identity::Psk(PskIdentity::new("ak@msgbox.io", b"foo")),
            Identity::Psk(PskIdentity::new("ak@msgbox.io", b"foo")),
        ),
    };

    let mut config = Config::new(Arc::new(local_id), Arc::new(remote_id));
    match (args.localnet, args.remotenet) {
        (Some(localnet), Some(remotenet)) => {
            config.add_network_selectors(localnet, remotenet, args.remote.is_some());
        }
        (None, None) => config.is_transport_mode = true,
        _ => return Err("--localnet and --remotenet must be given together".to_string()),
    }
    if args.esn {
        config
            .proposal_esp
            .replace(SaTransform::new(TransformType::ESN));
    }
    config.throttle_init_requests = args.cookies;
    Ok(config)
}

fn main() {
    let args = match Args::parse() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(2);
        }
    };
    if let Err(err) = logger::setup_logger(args.debug) {
        eprintln!("Failed to set up logger, error is {}", err);
    }
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(2);
        }
    };

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("Failed to start runtime, error is {}", err);
            process::exit(1);
        }
    };
    let result: Result<(), ike::IkeError> = rt.block_on(async {
        let port = UdpPacketPort::bind(args.local).await?;
        let server = Server::new(config, port, SessionCallbacks::logging());
        let shutdown = server.handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received interrupt, shutting down");
                shutdown.shutdown();
            }
        });
        if let Some(remote_addr) = args.remote {
            server.connect(remote_addr);
        }
        server.run().await
    });
    if let Err(err) = result {
        eprintln!("Failed to run server, error is {}", err);
        process::exit(1);
    }
}
