//! Async front end
//!
//! [`P2pService`] moves a [`P2pContext`] onto a tokio task. Requests and
//! driver events arrive over an mpsc channel and are handled one at a time,
//! and the loop clock follows `tokio::time`, so the context keeps its
//! single-threaded model while callers stay async.

use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::context::{ConnectRequest, DriverEvent, GroupTarget, InviteTarget, P2pContext, PdMode};
use crate::error::P2pResult;
use crate::types::{DiscoveryType, IfaceId, InvitationDecision, InvitationRequest, MacAddr};

/// Command queue depth of the service task
pub const DEFAULT_COMMAND_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<P2pResult<T>>;

enum Command {
    Connect(ConnectRequest, Reply<IfaceId>),
    GroupAdd {
        persistent: bool,
        freq: u32,
        reply: Reply<IfaceId>,
    },
    GroupAddPersistent {
        id: u32,
        freq: u32,
        bssid: Option<MacAddr>,
        reply: Reply<IfaceId>,
    },
    GroupRemove(GroupTarget, Reply<usize>),
    StartDiscovery {
        timeout: Option<Duration>,
        kind: DiscoveryType,
        req_dev_types: Vec<[u8; 8]>,
        reply: Reply<()>,
    },
    StopFind(oneshot::Sender<()>),
    Invite {
        peer: MacAddr,
        target: InviteTarget,
        reply: Reply<()>,
    },
    ProvisionDiscovery {
        peer: MacAddr,
        config_methods: u16,
        mode: PdMode,
        reply: Reply<()>,
    },
    SdRequest {
        dst: Option<MacAddr>,
        tlvs: Vec<u8>,
        reply: Reply<u64>,
    },
    SdCancel(u64, Reply<()>),
    Cancel(Reply<()>),
    RemoveClient {
        peer: MacAddr,
        iface_addr: bool,
        reply: Reply<usize>,
    },
    InvitationRequest(InvitationRequest, oneshot::Sender<InvitationDecision>),
    Event(DriverEvent),
    Shutdown(oneshot::Sender<()>),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Connect(..) => "connect",
            Command::GroupAdd { .. } => "group-add",
            Command::GroupAddPersistent { .. } => "group-add-persistent",
            Command::GroupRemove(..) => "group-remove",
            Command::StartDiscovery { .. } => "find",
            Command::StopFind(_) => "stop-find",
            Command::Invite { .. } => "invite",
            Command::ProvisionDiscovery { .. } => "prov-disc",
            Command::SdRequest { .. } => "sd-request",
            Command::SdCancel(..) => "sd-cancel",
            Command::Cancel(_) => "cancel",
            Command::RemoveClient { .. } => "remove-client",
            Command::InvitationRequest(..) => "invitation-request",
            Command::Event(event) => event.name(),
            Command::Shutdown(_) => "shutdown",
        }
    }
}

/// Cloneable handle to a running P2P service task
#[derive(Debug, Clone)]
pub struct P2pService {
    tx: mpsc::Sender<Command>,
}

impl P2pService {
    /// Move `ctx` onto a new task
    pub fn spawn(ctx: P2pContext) -> (Self, JoinHandle<()>) {
        Self::spawn_with_capacity(ctx, DEFAULT_COMMAND_CAPACITY)
    }

    pub fn spawn_with_capacity(ctx: P2pContext, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let task = tokio::spawn(run(ctx, rx));
        (Self { tx }, task)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow!("P2P service is not running"))
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        let result = rx.await.context("P2P service dropped the request")?;
        Ok(result?)
    }

    pub async fn connect(&self, req: ConnectRequest) -> Result<IfaceId> {
        self.request(|reply| Command::Connect(req, reply)).await
    }

    pub async fn group_add(&self, persistent: bool, freq: u32) -> Result<IfaceId> {
        self.request(|reply| Command::GroupAdd {
            persistent,
            freq,
            reply,
        })
        .await
    }

    pub async fn group_add_persistent(&self, id: u32, freq: u32, bssid: Option<MacAddr>) -> Result<IfaceId> {
        self.request(|reply| Command::GroupAddPersistent {
            id,
            freq,
            bssid,
            reply,
        })
        .await
    }

    pub async fn group_remove(&self, target: GroupTarget) -> Result<usize> {
        self.request(|reply| Command::GroupRemove(target, reply)).await
    }

    pub async fn start_discovery(
        &self,
        timeout: Option<Duration>,
        kind: DiscoveryType,
        req_dev_types: Vec<[u8; 8]>,
    ) -> Result<()> {
        self.request(|reply| Command::StartDiscovery {
            timeout,
            kind,
            req_dev_types,
            reply,
        })
        .await
    }

    pub async fn stop_find(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::StopFind(tx)).await?;
        rx.await.context("P2P service dropped the request")
    }

    pub async fn invite(&self, peer: MacAddr, target: InviteTarget) -> Result<()> {
        self.request(|reply| Command::Invite {
            peer,
            target,
            reply,
        })
        .await
    }

    pub async fn provision_discovery(&self, peer: MacAddr, config_methods: u16, mode: PdMode) -> Result<()> {
        self.request(|reply| Command::ProvisionDiscovery {
            peer,
            config_methods,
            mode,
            reply,
        })
        .await
    }

    pub async fn service_discovery_request(&self, dst: Option<MacAddr>, tlvs: Vec<u8>) -> Result<u64> {
        self.request(|reply| Command::SdRequest { dst, tlvs, reply }).await
    }

    pub async fn cancel_request(&self, handle: u64) -> Result<()> {
        self.request(|reply| Command::SdCancel(handle, reply)).await
    }

    pub async fn cancel(&self) -> Result<()> {
        self.request(Command::Cancel).await
    }

    pub async fn remove_client(&self, peer: MacAddr, iface_addr: bool) -> Result<usize> {
        self.request(|reply| Command::RemoveClient {
            peer,
            iface_addr,
            reply,
        })
        .await
    }

    /// Ask the service how to answer an Invitation Request
    pub async fn invitation_request(&self, req: InvitationRequest) -> Result<InvitationDecision> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::InvitationRequest(req, tx)).await?;
        rx.await.context("P2P service dropped the request")
    }

    /// Feed a driver event; does not wait for it to be handled
    pub async fn driver_event(&self, event: DriverEvent) -> Result<()> {
        self.send(Command::Event(event)).await
    }

    /// Tear the context down and stop the task
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx)).await?;
        rx.await.context("P2P service exited before confirming shutdown")
    }
}

async fn run(mut ctx: P2pContext, mut rx: mpsc::Receiver<Command>) {
    let start = Instant::now();
    info!("P2P service started");
    loop {
        let deadline = ctx.next_deadline().map(|d| start + d);
        let command = tokio::select! {
            command = rx.recv() => command,
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                ctx.advance_to(start.elapsed());
                continue;
            }
        };
        let Some(command) = command else {
            debug!("All P2P service handles dropped");
            break;
        };
        ctx.advance_to(start.elapsed());
        if !handle(&mut ctx, command) {
            break;
        }
    }
    ctx.shutdown();
    info!("P2P service stopped");
}

/// Apply one command; false stops the loop
fn handle(ctx: &mut P2pContext, command: Command) -> bool {
    debug!(command = command.name(), "P2P service command");
    // a caller that stopped waiting is not an error
    match command {
        Command::Connect(req, reply) => {
            let _ = reply.send(ctx.connect(req));
        }
        Command::GroupAdd {
            persistent,
            freq,
            reply,
        } => {
            let _ = reply.send(ctx.group_add(persistent, freq));
        }
        Command::GroupAddPersistent {
            id,
            freq,
            bssid,
            reply,
        } => {
            let _ = reply.send(ctx.group_add_persistent(id, freq, bssid));
        }
        Command::GroupRemove(target, reply) => {
            let _ = reply.send(ctx.group_remove(target));
        }
        Command::StartDiscovery {
            timeout,
            kind,
            req_dev_types,
            reply,
        } => {
            let _ = reply.send(ctx.start_discovery(timeout, kind, req_dev_types));
        }
        Command::StopFind(reply) => {
            ctx.stop_find();
            let _ = reply.send(());
        }
        Command::Invite {
            peer,
            target,
            reply,
        } => {
            let _ = reply.send(ctx.invite(peer, target));
        }
        Command::ProvisionDiscovery {
            peer,
            config_methods,
            mode,
            reply,
        } => {
            let _ = reply.send(ctx.provision_discovery(peer, config_methods, mode));
        }
        Command::SdRequest { dst, tlvs, reply } => {
            let _ = reply.send(ctx.service_discovery_request(dst, tlvs));
        }
        Command::SdCancel(handle, reply) => {
            let _ = reply.send(ctx.cancel_request(handle));
        }
        Command::Cancel(reply) => {
            let _ = reply.send(ctx.cancel());
        }
        Command::RemoveClient {
            peer,
            iface_addr,
            reply,
        } => {
            let _ = reply.send(ctx.remove_client(peer, iface_addr));
        }
        Command::InvitationRequest(req, reply) => {
            let _ = reply.send(ctx.on_invitation_request(&req));
        }
        Command::Event(event) => ctx.on_driver_event(event),
        Command::Shutdown(reply) => {
            ctx.shutdown();
            let _ = reply.send(());
            return false;
        }
    }
    true
}
