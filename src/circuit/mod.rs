//! Circuits and their reactors
//!
//! A circuit is one onion-routing hop through this relay: the link it was
//! created on (its client side), the per-hop crypto negotiated by CREATE2,
//! an optional neighbor circuit toward the next relay, and the streams
//! multiplexed inside it. Each circuit runs as one task that owns all of
//! this state exclusively and consumes cells from a bounded inbox, so
//! progress within a circuit is serialized while circuits on the same
//! connection proceed in parallel.

pub mod flow;
pub mod stream;
pub mod table;

pub use flow::{CircuitWindows, StreamWindows};
pub use stream::{BeginTarget, EndReason, StreamState, StreamTable};
pub use table::{CircuitRole, CircuitTable};

use crate::connection::{Dialer, LinkHandle};
use crate::error::{RelayError, Result};
use crate::protocol::cell::{
    Cell, CellCommand, CircId, DestroyReason, RelayCell, RelayCommand, CELL_BODY_LEN,
};
use crate::protocol::crypto::HopCrypto;
use crate::protocol::extend::Extend2;
use crate::protocol::ntor::{ServerHandshake, NTOR_HANDSHAKE_TYPE, SERVER_REPLY_LEN};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use x25519_dalek::StaticSecret;

/// Cells queued per circuit inbox before backpressure reaches the reader.
pub const CIRCUIT_QUEUE_CAPACITY: usize = 32;

/// Budget for a partial circuit handshake (dial + CREATED2).
pub const CIRCUIT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// RELAY_EARLY cells a circuit may carry before it is torn down.
const RELAY_EARLY_LIMIT: u8 = 8;

/// Which of a circuit's two links a cell arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSide {
    /// The connection the circuit was created on
    Client,
    /// The onward connection opened by EXTEND2
    Neighbor,
}

/// What a connection delivers into a circuit's inbox.
#[derive(Debug)]
pub enum CircuitMsg {
    Client(Cell),
    Neighbor(Cell),
    ClientClosed,
    NeighborClosed,
}

/// Queue handle a connection holds for one circuit.
#[derive(Debug, Clone)]
pub struct CircuitHandle {
    pub tx: mpsc::Sender<CircuitMsg>,
    pub side: LinkSide,
}

impl CircuitHandle {
    /// Deliver a cell, tagged with the side this handle represents.
    /// Returns false when the circuit task is gone.
    pub async fn deliver(&self, cell: Cell) -> bool {
        let msg = match self.side {
            LinkSide::Client => CircuitMsg::Client(cell),
            LinkSide::Neighbor => CircuitMsg::Neighbor(cell),
        };
        self.tx.send(msg).await.is_ok()
    }

    /// Tell the circuit its link went away.
    pub async fn notify_closed(&self) {
        let msg = match self.side {
            LinkSide::Client => CircuitMsg::ClientClosed,
            LinkSide::Neighbor => CircuitMsg::NeighborClosed,
        };
        let _ = self.tx.send(msg).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    New,
    Open,
    Dead,
}

#[derive(Debug)]
enum Flow {
    Continue,
    Stop,
}

/// The onward half of an extended circuit.
struct NeighborLink {
    link: LinkHandle,
    id: CircId,
    out: mpsc::Sender<Cell>,
}

/// One circuit's state, owned by its reactor task.
pub struct Circuit {
    client_id: CircId,
    client_link: LinkHandle,
    client_out: mpsc::Sender<Cell>,
    inbox: mpsc::Receiver<CircuitMsg>,
    self_tx: mpsc::Sender<CircuitMsg>,

    onion_secret: Arc<StaticSecret>,
    identity_digest: [u8; 20],
    dialer: Arc<dyn Dialer>,

    state: CircuitState,
    crypto: Option<HopCrypto>,
    neighbor: Option<NeighborLink>,
    pending_extend: bool,
    windows: CircuitWindows,
    streams: StreamTable,
    relay_early_budget: u8,
}

impl Circuit {
    /// Build a circuit for a CREATE2 that arrived on `client_link` with id
    /// `client_id`. Returns the circuit and the handle the connection should
    /// register under that id.
    pub fn new(
        client_id: CircId,
        client_link: LinkHandle,
        client_out: mpsc::Sender<Cell>,
        onion_secret: Arc<StaticSecret>,
        identity_digest: [u8; 20],
        dialer: Arc<dyn Dialer>,
    ) -> (Self, CircuitHandle) {
        let (tx, inbox) = mpsc::channel(CIRCUIT_QUEUE_CAPACITY);
        let handle = CircuitHandle {
            tx: tx.clone(),
            side: LinkSide::Client,
        };
        let circuit = Self {
            client_id,
            client_link,
            client_out,
            inbox,
            self_tx: tx,
            onion_secret,
            identity_digest,
            dialer,
            state: CircuitState::New,
            crypto: None,
            neighbor: None,
            pending_extend: false,
            windows: CircuitWindows::new(),
            streams: StreamTable::new(),
            relay_early_budget: RELAY_EARLY_LIMIT,
        };
        (circuit, handle)
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Reactor loop: consume the inbox until the circuit dies.
    pub async fn run(mut self) {
        loop {
            // While an extension is outstanding the next event must arrive
            // within the circuit handshake budget.
            let msg = if self.pending_extend {
                match timeout(CIRCUIT_HANDSHAKE_TIMEOUT, self.inbox.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => {
                        log::info!("circuit {}: extension timed out", self.client_id);
                        if let Err(e) = self.abort_extend(DestroyReason::Timeout).await {
                            log::debug!("circuit {}: {}", self.client_id, e);
                            break;
                        }
                        continue;
                    }
                }
            } else {
                self.inbox.recv().await
            };

            let Some(msg) = msg else { break };
            match self.handle(msg).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => {
                    log::info!("circuit {}: {}", self.client_id, e);
                    self.destroy(destroy_reason_for(&e)).await;
                    break;
                }
            }
        }
    }

    async fn handle(&mut self, msg: CircuitMsg) -> Result<Flow> {
        if self.state == CircuitState::Dead {
            return Ok(Flow::Stop);
        }
        match msg {
            CircuitMsg::Client(cell) => match cell.command {
                CellCommand::Create2 => self.on_create2(&cell.payload).await,
                CellCommand::Relay | CellCommand::RelayEarly => {
                    self.on_relay_forward(cell).await
                }
                CellCommand::Destroy => {
                    let reason = DestroyReason::from_u8(cell.payload.first().copied().unwrap_or(0));
                    self.on_destroy(reason).await;
                    Ok(Flow::Stop)
                }
                other => {
                    log::debug!("circuit {}: dropping {:?}", self.client_id, other);
                    Ok(Flow::Continue)
                }
            },
            CircuitMsg::Neighbor(cell) => match cell.command {
                CellCommand::Created2 => self.on_created2(&cell.payload).await,
                CellCommand::Relay | CellCommand::RelayEarly => {
                    self.on_relay_backward(cell).await
                }
                CellCommand::Destroy => {
                    let reason = DestroyReason::from_u8(cell.payload.first().copied().unwrap_or(0));
                    self.on_neighbor_destroy(reason).await;
                    Ok(Flow::Stop)
                }
                other => {
                    log::debug!("circuit {}: dropping {:?} from neighbor", self.client_id, other);
                    Ok(Flow::Continue)
                }
            },
            CircuitMsg::ClientClosed => {
                self.state = CircuitState::Dead;
                self.teardown_neighbor(DestroyReason::ChannelClosed).await;
                Ok(Flow::Stop)
            }
            CircuitMsg::NeighborClosed => {
                self.state = CircuitState::Dead;
                self.neighbor = None;
                self.pending_extend = false;
                let _ = self
                    .client_out
                    .send(Cell::destroy(self.client_id, DestroyReason::ChannelClosed))
                    .await;
                self.client_link.detach(self.client_id);
                Ok(Flow::Stop)
            }
        }
    }

    /// Answer a CREATE2: run the ntor server side and install the hop keys.
    async fn on_create2(&mut self, payload: &[u8]) -> Result<Flow> {
        if self.state != CircuitState::New {
            return Err(RelayError::HandshakeFailed(
                "CREATE2 on an open circuit".into(),
            ));
        }
        if payload.len() < 4 {
            return Err(RelayError::BadRelayCell("CREATE2 too short".into()));
        }
        let htype = u16::from_be_bytes([payload[0], payload[1]]);
        let hlen = u16::from_be_bytes([payload[2], payload[3]]) as usize;
        if htype != NTOR_HANDSHAKE_TYPE {
            return Err(RelayError::BadHandshakeType(htype));
        }
        if 4 + hlen > payload.len() {
            return Err(RelayError::BadRelayCell("CREATE2 data truncated".into()));
        }

        let server = ServerHandshake::new(&self.onion_secret, self.identity_digest);
        let (reply, material) = server.respond(&payload[4..4 + hlen])?;

        let mut created = Vec::with_capacity(2 + SERVER_REPLY_LEN);
        created.extend_from_slice(&(SERVER_REPLY_LEN as u16).to_be_bytes());
        created.extend_from_slice(&reply);
        self.to_client(Cell::new(self.client_id, CellCommand::Created2, created))
            .await?;

        self.crypto = Some(HopCrypto::from_material(&material));
        self.state = CircuitState::Open;
        log::debug!("circuit {}: open", self.client_id);
        Ok(Flow::Continue)
    }

    /// A RELAY / RELAY_EARLY moving away from the originator.
    async fn on_relay_forward(&mut self, cell: Cell) -> Result<Flow> {
        if self.state != CircuitState::Open {
            return Err(RelayError::HandshakeFailed("RELAY before CREATE2".into()));
        }
        let mut payload: [u8; CELL_BODY_LEN] = cell
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| RelayError::BadRelayCell("relay payload not 509 bytes".into()))?;

        let is_early = cell.command == CellCommand::RelayEarly;
        if is_early {
            if self.relay_early_budget == 0 {
                return Err(RelayError::BadRelayCell("RELAY_EARLY budget exceeded".into()));
            }
            self.relay_early_budget -= 1;
        }

        let crypto = self.crypto.as_mut().expect("open circuit has crypto");
        if crypto.decrypt_forward(&mut payload) {
            let rc = RelayCell::decode(&payload)?;
            self.on_recognized(rc, is_early).await
        } else if let Some(neighbor) = &self.neighbor {
            // Not for us: onward in its remaining ciphertext form, keeping
            // the RELAY_EARLY marking.
            let onward = Cell::new(neighbor.id, cell.command, payload.to_vec());
            if neighbor.out.send(onward).await.is_err() {
                return Err(RelayError::ExtendFailed("neighbor link closed".into()));
            }
            Ok(Flow::Continue)
        } else {
            Err(RelayError::RecognitionFailed)
        }
    }

    /// A RELAY moving toward the originator: add our layer and pass it on.
    async fn on_relay_backward(&mut self, cell: Cell) -> Result<Flow> {
        if self.state != CircuitState::Open {
            return Ok(Flow::Continue);
        }
        let mut payload: [u8; CELL_BODY_LEN] = cell
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| RelayError::BadRelayCell("relay payload not 509 bytes".into()))?;

        let crypto = self.crypto.as_mut().expect("open circuit has crypto");
        crypto.encrypt_backward(&mut payload);
        self.to_client(Cell::new(self.client_id, CellCommand::Relay, payload.to_vec()))
            .await?;
        Ok(Flow::Continue)
    }

    async fn on_recognized(&mut self, rc: RelayCell, is_early: bool) -> Result<Flow> {
        match rc.command {
            RelayCommand::Extend2 => {
                if !is_early {
                    return Err(RelayError::BadRelayCell(
                        "EXTEND2 outside RELAY_EARLY".into(),
                    ));
                }
                if self.neighbor.is_some() || self.pending_extend {
                    return Err(RelayError::BadRelayCell(
                        "EXTEND2 on an extended circuit".into(),
                    ));
                }
                self.on_extend2(&rc.data).await
            }
            RelayCommand::Begin => self.on_begin(rc).await,
            RelayCommand::BeginDir => {
                self.send_end(rc.stream_id, EndReason::NotDirectory).await?;
                Ok(Flow::Continue)
            }
            RelayCommand::Resolve => {
                self.send_end(rc.stream_id, EndReason::Misc).await?;
                Ok(Flow::Continue)
            }
            RelayCommand::Data => self.on_data(rc).await,
            RelayCommand::Sendme => self.on_sendme(rc).await,
            RelayCommand::End => {
                self.streams.close(rc.stream_id);
                Ok(Flow::Continue)
            }
            RelayCommand::Truncate => self.on_truncate().await,
            RelayCommand::Drop => Ok(Flow::Continue),
            other => {
                log::debug!(
                    "circuit {}: dropping recognized {:?}",
                    self.client_id,
                    other
                );
                Ok(Flow::Continue)
            }
        }
    }

    /// BEGIN under the default refuse-all exit policy.
    async fn on_begin(&mut self, rc: RelayCell) -> Result<Flow> {
        let target = match BeginTarget::decode(&rc.data) {
            Ok(target) => target,
            Err(e) => {
                log::debug!("circuit {}: bad BEGIN: {}", self.client_id, e);
                self.send_end(rc.stream_id, EndReason::TorProtocol).await?;
                return Ok(Flow::Continue);
            }
        };
        if let Err(e) = self.streams.begin(rc.stream_id) {
            log::debug!("circuit {}: {}", self.client_id, e);
            self.send_end(rc.stream_id, EndReason::TorProtocol).await?;
            return Ok(Flow::Continue);
        }

        log::info!(
            "circuit {}: refusing stream {} to {}:{} (exit policy)",
            self.client_id,
            rc.stream_id,
            target.host,
            target.port
        );
        self.send_end(rc.stream_id, EndReason::ExitPolicy).await?;
        self.streams.close(rc.stream_id);
        Ok(Flow::Continue)
    }

    async fn on_data(&mut self, rc: RelayCell) -> Result<Flow> {
        if self.windows.on_deliver()? {
            self.send_backward(RelayCell::new(RelayCommand::Sendme, 0, Vec::new()))
                .await?;
        }
        // Resolve the stream-window outcome before touching the queues: a
        // window underflow closes just this stream.
        let outcome = self
            .streams
            .get_mut(rc.stream_id)
            .map(|stream| stream.windows.on_deliver());
        match outcome {
            // DATA for a stream we never opened: drop.
            None => {}
            Some(Ok(false)) => {}
            Some(Ok(true)) => {
                self.send_backward(RelayCell::new(
                    RelayCommand::Sendme,
                    rc.stream_id,
                    Vec::new(),
                ))
                .await?;
            }
            Some(Err(e)) => {
                log::debug!("circuit {}: {}", self.client_id, e);
                self.streams.close(rc.stream_id);
                self.send_end(rc.stream_id, EndReason::TorProtocol).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_sendme(&mut self, rc: RelayCell) -> Result<Flow> {
        if rc.stream_id == 0 {
            self.windows.on_sendme()?;
            return Ok(Flow::Continue);
        }
        let outcome = self
            .streams
            .get_mut(rc.stream_id)
            .map(|stream| stream.windows.on_sendme());
        if let Some(Err(e)) = outcome {
            log::debug!("circuit {}: {}", self.client_id, e);
            self.streams.close(rc.stream_id);
            self.send_end(rc.stream_id, EndReason::TorProtocol).await?;
        }
        Ok(Flow::Continue)
    }

    /// EXTEND2: open (or reuse) a link to the named relay and forward the
    /// handshake block as CREATE2 on a freshly allocated circuit.
    async fn on_extend2(&mut self, data: &[u8]) -> Result<Flow> {
        let extend = Extend2::decode(data)?;
        if extend.handshake_type() != NTOR_HANDSHAKE_TYPE {
            return Err(RelayError::BadHandshakeType(extend.handshake_type()));
        }
        if extend.target_addr().is_none() {
            return Err(RelayError::BadLinkSpec(
                "EXTEND2 names no reachable address".into(),
            ));
        }

        let link = match timeout(
            CIRCUIT_HANDSHAKE_TIMEOUT,
            Arc::clone(&self.dialer).open_link(&extend.link_specs),
        )
        .await
        {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                log::info!("circuit {}: extend dial failed: {}", self.client_id, e);
                self.send_truncated(DestroyReason::ConnectFailed).await?;
                return Ok(Flow::Continue);
            }
            Err(_) => {
                log::info!("circuit {}: extend dial timed out", self.client_id);
                self.send_truncated(DestroyReason::Timeout).await?;
                return Ok(Flow::Continue);
            }
        };

        let handle = CircuitHandle {
            tx: self.self_tx.clone(),
            side: LinkSide::Neighbor,
        };
        let (neighbor_id, out) = link.attach_allocated(CircuitRole::Initiator, handle).await?;
        let create = Cell::new(neighbor_id, CellCommand::Create2, extend.handshake.clone());
        if out.send(create).await.is_err() {
            link.detach(neighbor_id);
            self.send_truncated(DestroyReason::ConnectFailed).await?;
            return Ok(Flow::Continue);
        }

        log::debug!(
            "circuit {}: extending on neighbor circuit {}",
            self.client_id,
            neighbor_id
        );
        self.neighbor = Some(NeighborLink {
            link,
            id: neighbor_id,
            out,
        });
        self.pending_extend = true;
        Ok(Flow::Continue)
    }

    /// CREATED2 from the next hop completes an extension: relay it backward
    /// as EXTENDED2.
    async fn on_created2(&mut self, payload: &[u8]) -> Result<Flow> {
        if !self.pending_extend {
            log::debug!("circuit {}: unexpected CREATED2", self.client_id);
            return Ok(Flow::Continue);
        }
        self.pending_extend = false;

        if payload.len() < 2 {
            return Err(RelayError::BadRelayCell("CREATED2 too short".into()));
        }
        let hlen = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        if 2 + hlen > payload.len() {
            return Err(RelayError::BadRelayCell("CREATED2 data truncated".into()));
        }

        // EXTENDED2 carries the CREATED2 body unchanged.
        let body = payload[..2 + hlen].to_vec();
        self.send_backward(RelayCell::new(RelayCommand::Extended2, 0, body))
            .await?;
        log::debug!("circuit {}: extension complete", self.client_id);
        Ok(Flow::Continue)
    }

    async fn on_truncate(&mut self) -> Result<Flow> {
        self.teardown_neighbor(DestroyReason::Requested).await;
        self.pending_extend = false;
        self.send_truncated(DestroyReason::None).await?;
        Ok(Flow::Continue)
    }

    /// DESTROY from the client side. A second DESTROY for a dead circuit is
    /// a no-op.
    pub async fn on_destroy(&mut self, reason: DestroyReason) {
        if self.state == CircuitState::Dead {
            return;
        }
        log::debug!(
            "circuit {}: destroyed by client, reason {:?}",
            self.client_id,
            reason
        );
        self.state = CircuitState::Dead;
        self.teardown_neighbor(reason).await;
        self.client_link.detach(self.client_id);
    }

    async fn on_neighbor_destroy(&mut self, reason: DestroyReason) {
        if self.state == CircuitState::Dead {
            return;
        }
        self.state = CircuitState::Dead;
        self.neighbor = None;
        self.pending_extend = false;
        let _ = self
            .client_out
            .send(Cell::destroy(self.client_id, reason))
            .await;
        self.client_link.detach(self.client_id);
    }

    /// Local failure: tell the client side and cascade outward.
    async fn destroy(&mut self, reason: DestroyReason) {
        if self.state == CircuitState::Dead {
            return;
        }
        self.state = CircuitState::Dead;
        let _ = self
            .client_out
            .send(Cell::destroy(self.client_id, reason))
            .await;
        self.teardown_neighbor(reason).await;
        self.client_link.detach(self.client_id);
    }

    async fn teardown_neighbor(&mut self, reason: DestroyReason) {
        if let Some(neighbor) = self.neighbor.take() {
            let _ = neighbor
                .out
                .send(Cell::destroy(neighbor.id, reason))
                .await;
            neighbor.link.detach(neighbor.id);
        }
        self.pending_extend = false;
    }

    /// An extension that cannot complete: drop the half-built neighbor and
    /// report TRUNCATED backward.
    async fn abort_extend(&mut self, reason: DestroyReason) -> Result<()> {
        self.teardown_neighbor(reason).await;
        self.send_truncated(reason).await
    }

    async fn send_end(&mut self, stream_id: u16, reason: EndReason) -> Result<()> {
        self.send_backward(RelayCell::new(
            RelayCommand::End,
            stream_id,
            vec![reason.to_u8()],
        ))
        .await
    }

    async fn send_truncated(&mut self, reason: DestroyReason) -> Result<()> {
        self.send_backward(RelayCell::new(
            RelayCommand::Truncated,
            0,
            vec![reason.to_u8()],
        ))
        .await
    }

    /// Originate a backward relay cell at this hop.
    async fn send_backward(&mut self, rc: RelayCell) -> Result<()> {
        let crypto = self
            .crypto
            .as_mut()
            .ok_or_else(|| RelayError::Internal("backward cell before CREATE2".into()))?;
        let mut payload = rc.encode()?;
        crypto.seal_backward(&mut payload);
        self.to_client(Cell::new(self.client_id, CellCommand::Relay, payload.to_vec()))
            .await
    }

    async fn to_client(&self, cell: Cell) -> Result<()> {
        self.client_out
            .send(cell)
            .await
            .map_err(|_| RelayError::Internal("client link closed".into()))
    }
}

fn destroy_reason_for(error: &RelayError) -> DestroyReason {
    match error {
        RelayError::CircuitTimeout => DestroyReason::Timeout,
        RelayError::CircuitIdExhausted | RelayError::QueueOverflow => DestroyReason::ResourceLimit,
        RelayError::ExtendFailed(_) => DestroyReason::ConnectFailed,
        RelayError::Crypto(_) | RelayError::Internal(_) => DestroyReason::Internal,
        _ => DestroyReason::Protocol,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LinkHandle;
    use crate::protocol::crypto::OriginCrypto;
    use crate::protocol::ntor::ClientHandshake;
    use x25519_dalek::PublicKey;

    struct NoDialer;

    #[async_trait::async_trait]
    impl Dialer for NoDialer {
        async fn open_link(
            self: Arc<Self>,
            _specs: &[crate::protocol::extend::LinkSpec],
        ) -> Result<LinkHandle> {
            Err(RelayError::ExtendFailed("no dialer in this test".into()))
        }
    }

    struct TestCircuit {
        circuit: Circuit,
        client_rx: mpsc::Receiver<Cell>,
        identity: [u8; 20],
        onion_public: PublicKey,
    }

    fn test_circuit(client_id: CircId) -> TestCircuit {
        let onion_secret = Arc::new(StaticSecret::from([0x51u8; 32]));
        let onion_public = PublicKey::from(onion_secret.as_ref());
        let identity = [0xc7u8; 20];

        let (link, _reg_rx) = LinkHandle::detached(4);
        let (client_tx, client_rx) = mpsc::channel(16);
        let (circuit, _handle) = Circuit::new(
            client_id,
            link,
            client_tx,
            onion_secret,
            identity,
            Arc::new(NoDialer),
        );
        TestCircuit {
            circuit,
            client_rx,
            identity,
            onion_public,
        }
    }

    /// Drive CREATE2 through the circuit and return the originator-side
    /// crypto mirroring the installed hop keys.
    async fn open_circuit(tc: &mut TestCircuit) -> OriginCrypto {
        let client = ClientHandshake::new(tc.identity, tc.onion_public);
        let data = client.handshake_data();

        let mut payload = Vec::with_capacity(4 + data.len());
        payload.extend_from_slice(&NTOR_HANDSHAKE_TYPE.to_be_bytes());
        payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
        payload.extend_from_slice(&data);

        let flow = tc
            .circuit
            .on_create2(&payload)
            .await
            .expect("CREATE2 succeeds");
        assert!(matches!(flow, Flow::Continue));
        assert_eq!(tc.circuit.state(), CircuitState::Open);

        let created = tc.client_rx.try_recv().expect("CREATED2 queued");
        assert_eq!(created.command, CellCommand::Created2);
        let hlen = u16::from_be_bytes([created.payload[0], created.payload[1]]) as usize;
        assert_eq!(hlen, SERVER_REPLY_LEN);

        let material = client.complete(&created.payload[2..2 + hlen]).unwrap();
        OriginCrypto::new(vec![HopCrypto::from_material(&material)])
    }

    fn forward_cell(
        origin: &mut OriginCrypto,
        client_id: CircId,
        command: RelayCommand,
        stream_id: u16,
        data: &[u8],
        early: bool,
    ) -> Cell {
        let mut payload = RelayCell::new(command, stream_id, data.to_vec())
            .encode()
            .unwrap();
        origin.encrypt_forward(0, &mut payload);
        let cmd = if early {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        Cell::new(client_id, cmd, payload.to_vec())
    }

    fn read_backward(origin: &mut OriginCrypto, cell: Cell) -> RelayCell {
        assert_eq!(cell.command, CellCommand::Relay);
        let mut payload: [u8; CELL_BODY_LEN] = cell.payload.as_slice().try_into().unwrap();
        assert_eq!(origin.decrypt_backward(&mut payload), Some(0));
        RelayCell::decode(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_create2_then_begin_is_refused_by_policy() {
        let mut tc = test_circuit(9);
        let mut origin = open_circuit(&mut tc).await;

        let begin = forward_cell(
            &mut origin,
            9,
            RelayCommand::Begin,
            7,
            b"example.com:80\0",
            false,
        );
        tc.circuit
            .handle(CircuitMsg::Client(begin))
            .await
            .unwrap();

        let end = read_backward(&mut origin, tc.client_rx.try_recv().unwrap());
        assert_eq!(end.command, RelayCommand::End);
        assert_eq!(end.stream_id, 7);
        assert_eq!(end.data, vec![EndReason::ExitPolicy.to_u8()]);
        assert!(tc.circuit.streams.is_empty());
    }

    #[tokio::test]
    async fn test_create2_bad_handshake_type() {
        let mut tc = test_circuit(3);
        let payload = [0x00, 0x01, 0x00, 0x00]; // TAP
        let err = tc.circuit.on_create2(&payload).await.unwrap_err();
        assert!(matches!(err, RelayError::BadHandshakeType(1)));
    }

    #[tokio::test]
    async fn test_relay_before_create2_is_fatal() {
        let mut tc = test_circuit(4);
        let cell = Cell::new(4, CellCommand::Relay, vec![0; CELL_BODY_LEN]);
        let err = tc
            .circuit
            .handle(CircuitMsg::Client(cell))
            .await
            .unwrap_err();
        assert!(err.is_circuit_fatal());
    }

    #[tokio::test]
    async fn test_unrecognized_without_neighbor_is_fatal() {
        let mut tc = test_circuit(5);
        let _origin = open_circuit(&mut tc).await;

        // Garbage ciphertext: decrypts to an unrecognized payload and there
        // is no next hop to forward to.
        let cell = Cell::new(5, CellCommand::Relay, vec![0x5c; CELL_BODY_LEN]);
        let err = tc
            .circuit
            .handle(CircuitMsg::Client(cell))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::RecognitionFailed));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let mut tc = test_circuit(6);
        let _origin = open_circuit(&mut tc).await;

        tc.circuit.on_destroy(DestroyReason::Requested).await;
        assert_eq!(tc.circuit.state(), CircuitState::Dead);

        // A second DESTROY for a dead circuit changes nothing.
        tc.circuit.on_destroy(DestroyReason::Protocol).await;
        assert_eq!(tc.circuit.state(), CircuitState::Dead);
        assert!(tc.client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_extend2_requires_relay_early() {
        let mut tc = test_circuit(8);
        let mut origin = open_circuit(&mut tc).await;

        let extend = Extend2::new(
            vec![crate::protocol::extend::LinkSpec::tcp(
                "127.0.0.1".parse().unwrap(),
                9001,
            )],
            NTOR_HANDSHAKE_TYPE,
            &[0; 84],
        );
        let cell = forward_cell(
            &mut origin,
            8,
            RelayCommand::Extend2,
            0,
            &extend.encode(),
            false,
        );
        let err = tc
            .circuit
            .handle(CircuitMsg::Client(cell))
            .await
            .unwrap_err();
        assert!(err.is_circuit_fatal());
    }

    #[tokio::test]
    async fn test_extend2_dial_failure_reports_truncated() {
        let mut tc = test_circuit(10);
        let mut origin = open_circuit(&mut tc).await;

        let extend = Extend2::new(
            vec![crate::protocol::extend::LinkSpec::tcp(
                "127.0.0.1".parse().unwrap(),
                9001,
            )],
            NTOR_HANDSHAKE_TYPE,
            &[0; 84],
        );
        let cell = forward_cell(
            &mut origin,
            10,
            RelayCommand::Extend2,
            0,
            &extend.encode(),
            true,
        );
        tc.circuit.handle(CircuitMsg::Client(cell)).await.unwrap();

        let truncated = read_backward(&mut origin, tc.client_rx.try_recv().unwrap());
        assert_eq!(truncated.command, RelayCommand::Truncated);
        assert_eq!(truncated.data, vec![DestroyReason::ConnectFailed.to_u8()]);
        assert_eq!(tc.circuit.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_data_triggers_circuit_sendme_after_increment() {
        let mut tc = test_circuit(11);
        let mut origin = open_circuit(&mut tc).await;

        for _ in 0..CircuitWindows::INCREMENT {
            let data = forward_cell(&mut origin, 11, RelayCommand::Data, 0, b"x", false);
            tc.circuit.handle(CircuitMsg::Client(data)).await.unwrap();
        }

        let sendme = read_backward(&mut origin, tc.client_rx.try_recv().unwrap());
        assert_eq!(sendme.command, RelayCommand::Sendme);
        assert_eq!(sendme.stream_id, 0);
        assert!(tc.client_rx.try_recv().is_err());
    }
}
