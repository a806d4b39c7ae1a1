// src/core/cluster/bus.rs

//! The cluster bus: a TCP listener on `client_port + bus_port_offset`, one
//! outbound link per peer with reconnects driven by the cron, and the
//! 100 ms tick that powers pinging, failure detection, elections, and the
//! before-sleep persistence hook.

use crate::core::PeridotError;
use crate::core::cluster::codec::BusCodec;
use crate::core::cluster::gossip::{self, LinkAction, PacketSource, now_ms};
use crate::core::cluster::message::MsgType;
use crate::core::cluster::node::{ClusterNode, LinkHandle, NodeFlags};
use crate::core::cluster::state::ClusterState;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// The cluster tick: ten iterations per second.
const CRON_PERIOD: Duration = Duration::from_millis(100);

/// Bound on connections drained per accept wakeup, so a connect storm never
/// starves the cron.
const MAX_ACCEPTS_PER_CYCLE: usize = 32;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs the cluster bus until shutdown. A bind failure is fatal; so is a
/// persistence failure surfacing from the before-sleep hook.
pub async fn run(
    state: Arc<ClusterState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PeridotError> {
    let listener = TcpListener::bind(&state.bus_bind_addr).await.map_err(|e| {
        PeridotError::Internal(format!(
            "Failed to bind cluster bus on {}: {e}",
            state.bus_bind_addr
        ))
    })?;
    info!("Cluster bus listening on {}", state.bus_bind_addr);

    let mut cron = time::interval(CRON_PERIOD);
    cron.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Cluster bus shutting down.");
                return Ok(());
            }
            _ = cron.tick() => {
                let now = now_ms();
                for node_id in gossip::cluster_cron(&state, now) {
                    spawn_outbound_link(&state, &node_id, now);
                }
                state.before_sleep(now)?;
            }
            res = listener.accept() => {
                match res {
                    Ok((socket, peer)) => {
                        tokio::spawn(run_inbound_link(state.clone(), socket, peer));
                        // Drain a bounded burst of queued connects.
                        for _ in 1..MAX_ACCEPTS_PER_CYCLE {
                            match listener.accept().now_or_never() {
                                Some(Ok((socket, peer))) => {
                                    tokio::spawn(run_inbound_link(state.clone(), socket, peer));
                                }
                                Some(Err(e)) => {
                                    warn!("Error accepting bus connection: {e}");
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                    Err(e) => warn!("Error accepting bus connection: {e}"),
                }
            }
        }
    }
}

/// Installs a fresh link handle on the node and spawns the connect task.
/// The initial PING (or MEET, while the MEET flag holds) is enqueued before
/// anything else can be, so it is always the first frame on the wire.
fn spawn_outbound_link(state: &Arc<ClusterState>, node_id: &str, now: u64) {
    let Some(node) = state.nodes.get(node_id) else {
        return;
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = LinkHandle {
        id: state.next_link_id(),
        tx,
        established: now,
    };
    {
        let mut n = node.write();
        if n.link.is_some() {
            return;
        }
        n.link = Some(handle.clone());
    }
    let mtype = if node.read().flags.contains(NodeFlags::MEET) {
        MsgType::Meet
    } else {
        MsgType::Ping
    };
    gossip::send_ping(state, &node, mtype, now);
    tokio::spawn(run_outbound_link(state.clone(), node, handle, rx));
}

async fn run_outbound_link(
    state: Arc<ClusterState>,
    node: Arc<RwLock<ClusterNode>>,
    handle: LinkHandle,
    mut rx: mpsc::UnboundedReceiver<crate::core::cluster::message::ClusterMessage>,
) {
    let (addr, peer_ip) = {
        let n = node.read();
        (n.bus_addr(), n.ip.parse().ok())
    };
    let stream = match time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("Could not connect to cluster bus {addr}: {e}");
            clear_link(&node, handle.id);
            return;
        }
        Err(_) => {
            debug!("Connect to cluster bus {addr} timed out");
            clear_link(&node, handle.id);
            return;
        }
    };
    debug!("Outbound bus link to {addr} established");

    let (mut sink, mut frames) = Framed::new(stream, BusCodec).split();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(msg) => {
                let src = PacketSource {
                    reply: &handle,
                    peer_ip,
                    link_node: Some(&node),
                };
                if gossip::process_packet(&state, msg, src, now_ms()) == LinkAction::Close {
                    break;
                }
            }
            Err(e) => {
                debug!("Bus link to {addr} broken: {e}");
                break;
            }
        }
    }
    clear_link(&node, handle.id);
    drop(handle);
    writer.abort();
}

/// Serves one accepted bus connection. Inbound links carry requests from
/// peers; replies go back on the same connection, while our own view of the
/// peer lives on the outbound link only.
async fn run_inbound_link(state: Arc<ClusterState>, socket: TcpStream, peer: SocketAddr) {
    debug!("Accepted bus connection from {peer}");
    let (mut sink, mut frames) = Framed::new(socket, BusCodec).split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = LinkHandle {
        id: state.next_link_id(),
        tx,
        established: now_ms(),
    };
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(msg) => {
                let src = PacketSource {
                    reply: &handle,
                    peer_ip: Some(peer.ip()),
                    link_node: None,
                };
                if gossip::process_packet(&state, msg, src, now_ms()) == LinkAction::Close {
                    break;
                }
            }
            Err(e) => {
                debug!("Inbound bus link from {peer} broken: {e}");
                break;
            }
        }
    }
    drop(handle);
    let _ = writer.await;
}

/// Detaches the link from its node, but only if the node still points at
/// this very handle; a newer link must not be clobbered.
fn clear_link(node: &Arc<RwLock<ClusterNode>>, link_id: u64) {
    let mut n = node.write();
    if n.link.as_ref().is_some_and(|l| l.id == link_id) {
        n.link = None;
    }
}
