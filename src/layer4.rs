//! UDP activation listener.
//!
//! Waits for the registry, binds the configured endpoint and handles magic
//! packets strictly one at a time in arrival order. Power-on calls are not
//! pipelined, so a slow hypervisor command delays the next datagram.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pnet::util::MacAddr;
use tokio_util::sync::CancellationToken;

use crate::common::{self, canonical_mac};
use crate::config::ListenerConfig;
use crate::error::ListenerError;
use crate::gate::ReadinessGate;
use crate::hypervisor::PowerController;
use crate::registry::{Registry, RegistryStore, RetryPolicy};

/// Largest possible UDP payload, so no datagram is ever truncated.
const RECV_BUF_LEN: usize = 65536;

/// Windows reports a datagram larger than the buffer as an error.
const WSAEMSGSIZE: i32 = 10040;

#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    pub readiness_timeout: Duration,
    pub cooldown: Duration,
    /// Receive timeout, only used to notice cancellation.
    pub poll_interval: Duration,
    pub load_retry: RetryPolicy,
}

impl From<&ListenerConfig> for ListenerSettings {
    fn from(cfg: &ListenerConfig) -> Self {
        Self {
            readiness_timeout: cfg.readiness_timeout(),
            cooldown: cfg.cooldown(),
            poll_interval: cfg.poll_interval(),
            load_retry: RetryPolicy::default(),
        }
    }
}

/// How the receive loop reacts to a failed `recv_from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvAction {
    /// No data yet.
    Retry,
    /// The error belongs to one datagram; drop it and keep serving.
    Discard,
    Fatal,
}

fn classify_recv_error(e: &std::io::Error) -> RecvAction {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => RecvAction::Retry,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused => RecvAction::Discard,
        _ if e.raw_os_error() == Some(WSAEMSGSIZE) && cfg!(windows) => RecvAction::Discard,
        _ => RecvAction::Fatal,
    }
}

/// What happened to a single datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Invalid,
    Miss,
    Cooldown(String),
    PoweredOn(String),
    PowerFailed(String),
}

pub struct Layer4Listener<P> {
    store: Arc<RegistryStore>,
    gate: Arc<ReadinessGate>,
    power: P,
    settings: ListenerSettings,
    token: CancellationToken,
    cooldown_list: HashMap<MacAddr, Instant>,
}

impl<P: PowerController> Layer4Listener<P> {
    pub fn new(
        store: Arc<RegistryStore>,
        gate: Arc<ReadinessGate>,
        power: P,
        settings: ListenerSettings,
        token: CancellationToken,
    ) -> Self {
        Self {
            store,
            gate,
            power,
            settings,
            token,
            cooldown_list: HashMap::new(),
        }
    }

    /// Runs until cancelled (`Ok`) or a fatal error.
    pub fn run(mut self) -> Result<(), ListenerError> {
        log::info!("[listener] waiting for registry");
        if !self.gate.wait(self.settings.readiness_timeout) {
            log::error!("[listener] registry not ready after {:?}", self.settings.readiness_timeout);
            return Err(ListenerError::ReadinessTimeout(self.settings.readiness_timeout));
        }
        if self.token.is_cancelled() { return Ok(()); }
        log::info!("[listener] registry ready");

        let registry = self.store.load(&self.settings.load_retry)?;
        let addr = resolve_bind_addr(&registry)?;

        let socket = UdpSocket::bind(addr)
            .and_then(|s| s.set_read_timeout(Some(self.settings.poll_interval)).map(|_| s))
            .map_err(|source| ListenerError::Bind { addr: addr.to_string(), source })?;
        log::info!("[listener] listening on {} for {} VMs", addr, registry.len());

        self.serve(&socket, &registry)
    }

    fn serve(&mut self, socket: &UdpSocket, registry: &Registry) -> Result<(), ListenerError> {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            if self.token.is_cancelled() { log::trace!("[listener] exit"); return Ok(()); }

            let (len, src) = match socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) => match classify_recv_error(&e) {
                    RecvAction::Retry => continue,
                    RecvAction::Discard => {
                        log::debug!("[listener] discarding datagram: {}", e);
                        continue;
                    }
                    RecvAction::Fatal => {
                        log::error!("[listener] receive failed: {}", e);
                        return Err(ListenerError::Receive(e));
                    }
                },
            };

            self.handle_datagram(registry, &buf[..len], src);
        }
    }

    pub fn handle_datagram(&mut self, registry: &Registry, payload: &[u8], src: SocketAddr) -> Dispatch {
        let pkt = match common::parse_magic_packet(payload) {
            Ok(pkt) => pkt,
            Err(e) => {
                log::debug!("[listener] discarding {} byte datagram from {}: {}", payload.len(), src, e);
                return Dispatch::Invalid;
            }
        };

        let mac = canonical_mac(&pkt.target);
        if let Some(password) = &pkt.password {
            log::trace!("[listener] ignoring {} byte password for {}", password.len(), mac);
        }
        let Some(vm) = registry.resolve(&pkt.target) else {
            log::debug!("[listener] magic packet from {} for unknown MAC {}", src, mac);
            return Dispatch::Miss;
        };
        let vm = vm.to_string();

        if let Some(t) = self.cooldown_list.get(&pkt.target) {
            if t.elapsed() < self.settings.cooldown {
                log::debug!("[listener] '{}' ({}) was just woken, ignoring repeat from {}", vm, mac, src);
                return Dispatch::Cooldown(vm);
            }
            self.cooldown_list.remove(&pkt.target);
        }

        log::info!("[listener] magic packet from {} for {}, starting VM '{}'", src, mac, vm);
        match self.power.power_on(&vm, registry.operation_timeout) {
            Ok(()) => {
                self.cooldown_list.insert(pkt.target, Instant::now());
                log::info!("[listener] started VM '{}'", vm);
                Dispatch::PoweredOn(vm)
            }
            Err(e) => {
                log::error!("[listener] failed to start VM '{}' ({}): {}", vm, mac, e);
                Dispatch::PowerFailed(vm)
            }
        }
    }
}

fn resolve_bind_addr(registry: &Registry) -> Result<SocketAddr, ListenerError> {
    let addr = registry.bind_addr();
    log::info!("[listener] resolving UDP address {}", addr);
    let mut addrs = addr
        .to_socket_addrs()
        .map_err(|e| ListenerError::Resolve { addr: addr.clone(), reason: e.to_string() })?;
    addrs.next().ok_or_else(|| ListenerError::Resolve { addr, reason: "no addresses".to_string() })
}
