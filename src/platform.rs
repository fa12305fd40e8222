use std::{error, fmt, io, net::IpAddr, net::SocketAddr, sync::Arc};

use crate::ike::message::TransformType;

// Contracts between the IKE engine and the host data plane. The engine only
// calls these; installing XFRM/PF_KEY state is the host's job.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("in"),
            Self::Outbound => f.write_str("out"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PolicyAction {
    Protect,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IpsecMode {
    Transport,
    Tunnel,
}

// One direction of the IPsec policy pair installed before (and removed
// after) the child SA.
#[derive(Clone, Debug)]
pub struct PolicyParams {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub direction: Direction,
    pub action: PolicyAction,
    pub ipsec_mode: IpsecMode,
}

// Keying material for a full child SA: both SPIs and both directional key
// sets, so the host can install the inbound and outbound kernel states from
// one call. `is_initiator` tells the host which end it is.
#[derive(Clone, Debug)]
pub struct SaParams {
    pub spi_initiator: u32,
    pub spi_responder: u32,
    pub enc_alg: TransformType,
    pub auth_alg: Option<TransformType>,
    pub enc_key_initiator: Vec<u8>,
    pub auth_key_initiator: Vec<u8>,
    pub enc_key_responder: Vec<u8>,
    pub auth_key_responder: Vec<u8>,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub reqid: u32,
    pub is_initiator: bool,
    pub is_transport: bool,
}

// Read-only session facts handed to every callback.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub initiator_spi: u64,
    pub responder_spi: u64,
    pub is_initiator: bool,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

pub type PolicyFn =
    dyn Fn(&SessionInfo, &PolicyParams) -> Result<(), PlatformError> + Send + Sync;
pub type SaFn = dyn Fn(&SessionInfo, &SaParams) -> Result<(), PlatformError> + Send + Sync;

// The four host callbacks. install_policy strictly precedes install_child_sa;
// remove_child_sa strictly precedes remove_policy. All run on the session's
// own task and must not block the multiplexer.
pub struct SessionCallbacks {
    pub install_policy: Arc<PolicyFn>,
    pub remove_policy: Arc<PolicyFn>,
    pub install_child_sa: Arc<SaFn>,
    pub remove_child_sa: Arc<SaFn>,
}

impl SessionCallbacks {
    // A callback set that only logs, for hosts without a data plane.
    pub fn logging() -> SessionCallbacks {
        SessionCallbacks {
            install_policy: Arc::new(|session, pol| {
                log::info!(
                    "[{:x}] install policy {} {}=>{}",
                    session.initiator_spi,
                    pol.direction,
                    pol.src,
                    pol.dst
                );
                Ok(())
            }),
            remove_policy: Arc::new(|session, pol| {
                log::info!(
                    "[{:x}] remove policy {} {}=>{}",
                    session.initiator_spi,
                    pol.direction,
                    pol.src,
                    pol.dst
                );
                Ok(())
            }),
            install_child_sa: Arc::new(|session, sa| {
                log::info!(
                    "[{:x}] install child SA 0x{:x}/0x{:x} {}=>{}",
                    session.initiator_spi,
                    sa.spi_initiator,
                    sa.spi_responder,
                    sa.src,
                    sa.dst
                );
                Ok(())
            }),
            remove_child_sa: Arc::new(|session, sa| {
                log::info!(
                    "[{:x}] remove child SA 0x{:x}/0x{:x} {}=>{}",
                    session.initiator_spi,
                    sa.spi_initiator,
                    sa.spi_responder,
                    sa.src,
                    sa.dst
                );
                Ok(())
            }),
        }
    }
}

impl Clone for SessionCallbacks {
    fn clone(&self) -> SessionCallbacks {
        SessionCallbacks {
            install_policy: self.install_policy.clone(),
            remove_policy: self.remove_policy.clone(),
            install_child_sa: self.install_child_sa.clone(),
            remove_child_sa: self.remove_child_sa.clone(),
        }
    }
}

pub struct PlatformError {
    msg: String,
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl fmt::Debug for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for PlatformError {}

impl From<&'static str> for PlatformError {
    fn from(msg: &'static str) -> PlatformError {
        PlatformError {
            msg: msg.to_string(),
        }
    }
}

impl From<String> for PlatformError {
    fn from(msg: String) -> PlatformError {
        PlatformError { msg }
    }
}

impl From<io::Error> for PlatformError {
    fn from(err: io::Error) -> PlatformError {
        PlatformError {
            msg: err.to_string(),
        }
    }
}
