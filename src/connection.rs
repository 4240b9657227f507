//! Connection plumbing
//!
//! One TLS link carries one [`Connection`]: a reader task that decodes cells
//! and fans them out to circuits, and a writer task that drains per-circuit
//! outbound queues back onto the socket. The link handshake runs first on
//! the intact stream; only its terminal state unlocks circuit traffic.
//!
//! Backpressure: every circuit has a bounded inbox and a bounded outbound
//! queue. A slow circuit blocks its own producers; the writer keeps serving
//! the other circuits on the link.

use crate::circuit::{Circuit, CircuitRole, CircuitTable};
use crate::error::{RelayError, Result};
use crate::keys::RelayKeys;
use crate::protocol::cell::{
    read_cell, write_cell, Cell, CellCommand, CircId, DestroyReason, LinkVersion,
};
use crate::protocol::extend::LinkSpec;
use crate::protocol::handshake::{LinkEstablished, LinkHandshake, LinkSecrets, PeerIdentity};
use futures::stream::SelectAll;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

/// Budget for the whole link handshake.
pub const LINK_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cells queued per circuit toward the writer before backpressure.
pub const OUT_QUEUE_CAPACITY: usize = 32;

/// Opens (or reuses) authenticated links to other relays, for EXTEND2.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn open_link(self: Arc<Self>, specs: &[LinkSpec]) -> Result<LinkHandle>;
}

/// What every connection needs from the rest of the relay.
#[derive(Clone)]
pub struct ConnContext {
    pub keys: Arc<RelayKeys>,
    pub dialer: Arc<dyn Dialer>,
    pub local_addr: SocketAddr,
}

/// Cloneable handle to an established link, used by circuits to attach
/// themselves and queue outbound cells.
#[derive(Clone)]
pub struct LinkHandle {
    version: LinkVersion,
    peer: PeerIdentity,
    table: Arc<CircuitTable>,
    reg_tx: mpsc::Sender<mpsc::Receiver<Cell>>,
    control: mpsc::Sender<Cell>,
}

impl LinkHandle {
    fn new(version: LinkVersion, peer: PeerIdentity) -> (Self, mpsc::Receiver<mpsc::Receiver<Cell>>) {
        let (reg_tx, reg_rx) = mpsc::channel(16);
        let (control, control_rx) = mpsc::channel(OUT_QUEUE_CAPACITY);
        reg_tx
            .try_send(control_rx)
            .expect("fresh registration channel has capacity");
        let handle = Self {
            version,
            peer,
            table: Arc::new(CircuitTable::new(version)),
            reg_tx,
            control,
        };
        (handle, reg_rx)
    }

    /// A handle with no writer behind it, for circuit unit tests.
    #[cfg(test)]
    pub(crate) fn detached(version: LinkVersion) -> (Self, mpsc::Receiver<mpsc::Receiver<Cell>>) {
        Self::new(version, PeerIdentity::Client)
    }

    pub fn version(&self) -> LinkVersion {
        self.version
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn table(&self) -> &Arc<CircuitTable> {
        &self.table
    }

    /// Register a fresh outbound queue with the writer.
    async fn new_out_queue(&self) -> Result<mpsc::Sender<Cell>> {
        let (tx, rx) = mpsc::channel(OUT_QUEUE_CAPACITY);
        self.reg_tx
            .send(rx)
            .await
            .map_err(|_| RelayError::Internal("connection writer is gone".into()))?;
        Ok(tx)
    }

    /// Allocate an id for a circuit we originate on this link and wire up
    /// its queues.
    pub async fn attach_allocated(
        &self,
        role: CircuitRole,
        handle: crate::circuit::CircuitHandle,
    ) -> Result<(CircId, mpsc::Sender<Cell>)> {
        let id = self.table.allocate(role, handle)?;
        match self.new_out_queue().await {
            Ok(out) => Ok((id, out)),
            Err(e) => {
                self.table.remove(id);
                Err(e)
            }
        }
    }

    /// Register a circuit under a peer-chosen id.
    pub async fn attach_existing(
        &self,
        id: CircId,
        handle: crate::circuit::CircuitHandle,
    ) -> Result<mpsc::Sender<Cell>> {
        self.table.insert(id, handle)?;
        match self.new_out_queue().await {
            Ok(out) => Ok(out),
            Err(e) => {
                self.table.remove(id);
                Err(e)
            }
        }
    }

    /// Drop a circuit's table entry.
    pub fn detach(&self, id: CircId) {
        self.table.remove(id);
    }

    /// Queue a connection-scoped cell (DESTROY replies and the like).
    pub async fn send_control(&self, cell: Cell) {
        let _ = self.control.send(cell).await;
    }
}

/// A live link and its two pump tasks.
pub struct Connection;

impl Connection {
    /// Accept side: run the responder handshake, then pump cells until the
    /// link dies. Returns when the connection is finished.
    pub async fn run_responder<S>(
        mut stream: S,
        secrets: LinkSecrets,
        peer_addr: SocketAddr,
        ctx: ConnContext,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handshake = LinkHandshake::new(&ctx.keys, secrets, ctx.local_addr, peer_addr);
        let established = timeout(LINK_HANDSHAKE_TIMEOUT, handshake.respond(&mut stream))
            .await
            .map_err(|_| RelayError::HandshakeTimeout)??;

        let (_, reader) = Self::start(stream, established, peer_addr, CircuitRole::Initiator, ctx);
        reader.await.map_err(|e| RelayError::Internal(e.to_string()))?
    }

    /// Dial side: run the initiator handshake and hand back the link for
    /// circuit attachment. The pumps keep running in the background.
    pub async fn run_initiator<S>(
        mut stream: S,
        secrets: LinkSecrets,
        peer_addr: SocketAddr,
        ctx: ConnContext,
    ) -> Result<LinkHandle>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handshake = LinkHandshake::new(&ctx.keys, secrets, ctx.local_addr, peer_addr);
        let established = timeout(LINK_HANDSHAKE_TIMEOUT, handshake.initiate(&mut stream))
            .await
            .map_err(|_| RelayError::HandshakeTimeout)??;

        let (link, _reader) =
            Self::start(stream, established, peer_addr, CircuitRole::Responder, ctx);
        Ok(link)
    }

    /// Split the stream and spawn the reader and writer tasks.
    fn start<S>(
        stream: S,
        established: LinkEstablished,
        peer_addr: SocketAddr,
        peer_role: CircuitRole,
        ctx: ConnContext,
    ) -> (LinkHandle, JoinHandle<Result<()>>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let version = established.version;
        let (read_half, write_half) = tokio::io::split(stream);
        let (link, reg_rx) = LinkHandle::new(version, established.peer);

        tokio::spawn(async move {
            if let Err(e) = write_loop(write_half, version, reg_rx).await {
                log::debug!("writer for {}: {}", peer_addr, e);
            }
        });

        let reader_link = link.clone();
        let reader = tokio::spawn(async move {
            let result = read_loop(read_half, reader_link.clone(), peer_role, ctx).await;
            if let Err(e) = &result {
                log::info!("connection to {} closed: {}", peer_addr, e);
            }
            // Connection loss cascades to every circuit; no DESTROY cells go
            // out since the link itself is gone.
            for (_, handle) in reader_link.table.drain() {
                handle.notify_closed().await;
            }
            result
        });

        (link, reader)
    }
}

/// Decode cells and dispatch them until the link fails or closes.
async fn read_loop<R>(
    mut reader: ReadHalf<R>,
    link: LinkHandle,
    peer_role: CircuitRole,
    ctx: ConnContext,
) -> Result<()>
where
    R: AsyncRead + AsyncWrite,
{
    loop {
        let cell = read_cell(&mut reader, link.version).await?;
        match cell.command {
            // Connection-scoped chatter.
            CellCommand::Padding
            | CellCommand::Vpadding
            | CellCommand::PaddingNegotiate
            | CellCommand::Authorize
            | CellCommand::Unknown(_) => continue,

            // NETINFO refreshes after the handshake carry nothing we use.
            CellCommand::Netinfo => continue,

            // Handshake cells after Established are a protocol breach.
            CellCommand::Versions
            | CellCommand::Certs
            | CellCommand::AuthChallenge
            | CellCommand::Authenticate => {
                return Err(RelayError::NegotiationViolation {
                    command: format!("{:?}", cell.command),
                    state: "Established".into(),
                });
            }

            // TAP is not supported.
            CellCommand::Create | CellCommand::CreateFast => {
                link.send_control(Cell::destroy(cell.circ_id, DestroyReason::Protocol))
                    .await;
            }
            CellCommand::Created | CellCommand::CreatedFast => continue,

            CellCommand::Create2 => {
                handle_create2(&link, peer_role, &ctx, cell).await?;
            }

            CellCommand::Relay | CellCommand::RelayEarly | CellCommand::Created2 => {
                let circ_id = cell.circ_id;
                match link.table.lookup(circ_id) {
                    Some(handle) => {
                        // Await = backpressure from this circuit only.
                        if !handle.deliver(cell).await {
                            // Reactor already gone; forget the entry.
                            link.table.remove(circ_id);
                        }
                    }
                    None => {
                        log::trace!("dropping cell for unknown circuit {}", circ_id);
                    }
                }
            }

            CellCommand::Destroy => {
                // DESTROY for an unknown circuit is ignored.
                if let Some(handle) = link.table.remove(cell.circ_id) {
                    handle.deliver(cell).await;
                }
            }
        }
    }
}

/// Spawn a reactor for a fresh CREATE2.
async fn handle_create2(
    link: &LinkHandle,
    peer_role: CircuitRole,
    ctx: &ConnContext,
    cell: Cell,
) -> Result<()> {
    let circ_id = cell.circ_id;
    if circ_id == 0 || !link.table.msb_matches(circ_id, peer_role) {
        log::info!("rejecting CREATE2 with bad circuit id {:#x}", circ_id);
        link.send_control(Cell::destroy(circ_id, DestroyReason::Protocol))
            .await;
        return Ok(());
    }
    if link.table.lookup(circ_id).is_some() {
        log::info!("rejecting CREATE2 reusing live circuit id {:#x}", circ_id);
        link.send_control(Cell::destroy(circ_id, DestroyReason::Protocol))
            .await;
        return Ok(());
    }

    let client_out = link.new_out_queue().await?;
    let (circuit, handle) = Circuit::new(
        circ_id,
        link.clone(),
        client_out,
        ctx.keys.ntor_secret_shared(),
        ctx.keys.rsa_identity_digest(),
        ctx.dialer.clone(),
    );
    link.table.insert(circ_id, handle.clone())?;
    tokio::spawn(circuit.run());
    handle.deliver(cell).await;
    Ok(())
}

/// Serialize outbound cells from every circuit queue onto the socket.
///
/// `SelectAll` polls the registered queues fairly, so one saturated circuit
/// cannot starve the others; its bounded queue pushes back on its producers
/// instead.
async fn write_loop<W>(
    mut writer: WriteHalf<W>,
    version: LinkVersion,
    mut reg_rx: mpsc::Receiver<mpsc::Receiver<Cell>>,
) -> Result<()>
where
    W: AsyncRead + AsyncWrite,
{
    let mut queues: SelectAll<ReceiverStream<Cell>> = SelectAll::new();
    loop {
        tokio::select! {
            registration = reg_rx.recv() => match registration {
                Some(rx) => queues.push(ReceiverStream::new(rx)),
                // Every handle is gone: the connection is shutting down.
                None => break,
            },
            cell = queues.next(), if !queues.is_empty() => {
                if let Some(cell) = cell {
                    write_cell(&mut writer, &cell, version).await?;
                    writer.flush().await?;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}
