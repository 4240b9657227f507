//! End-to-end circuit flows over real TCP + TLS links between relays.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tor_relay::circuit::{CircuitHandle, CircuitMsg, CircuitRole, LinkSide};
use tor_relay::config::RelayConfig;
use tor_relay::connection::{Dialer, LinkHandle};
use tor_relay::protocol::cell::{Cell, CellCommand, RelayCell, RelayCommand, CELL_BODY_LEN};
use tor_relay::protocol::crypto::{HopCrypto, OriginCrypto};
use tor_relay::protocol::extend::{Extend2, LinkSpec};
use tor_relay::protocol::handshake::PeerIdentity;
use tor_relay::protocol::ntor::{ClientHandshake, NTOR_HANDSHAKE_TYPE};
use tor_relay::router::Router;
use x25519_dalek::PublicKey;

const WAIT: Duration = Duration::from_secs(30);

/// Start a relay listening on an ephemeral port.
async fn start_relay(nickname: &str) -> (Arc<Router>, SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = RelayConfig {
        nickname: nickname.into(),
        or_port: 1,
        contact: None,
        platform: "tor-relay test".into(),
        data_dir: dir.path().to_path_buf(),
    };
    let router = Router::new(config).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = Arc::clone(&router);
    tokio::spawn(async move {
        let _ = accept.accept_loop(listener).await;
    });
    (router, addr, dir)
}

/// A relay with no listener, used as the dialing side.
fn client_relay() -> (Arc<Router>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = RelayConfig {
        nickname: "client".into(),
        or_port: 1,
        contact: None,
        platform: "tor-relay test".into(),
        data_dir: dir.path().to_path_buf(),
    };
    (Router::new(config).unwrap(), dir)
}

/// Attach a raw circuit endpoint to a link and run CREATE2 against the relay
/// behind it. Returns the circuit id, the outbound queue, our inbox, and the
/// originator-side crypto for the new hop.
async fn open_circuit(
    link: &LinkHandle,
    target: &Arc<Router>,
) -> (
    u32,
    mpsc::Sender<Cell>,
    mpsc::Receiver<CircuitMsg>,
    OriginCrypto,
) {
    let descriptor = target.descriptor();
    let handshake = ClientHandshake::new(
        descriptor.fingerprint,
        PublicKey::from(descriptor.ntor_onion_key),
    );

    let (tx, mut inbox) = mpsc::channel(16);
    let endpoint = CircuitHandle {
        tx,
        side: LinkSide::Neighbor,
    };
    let (circ_id, out) = link
        .attach_allocated(CircuitRole::Initiator, endpoint)
        .await
        .unwrap();
    assert!(circ_id & 0x8000_0000 != 0, "initiator ids carry the MSB");

    let data = handshake.handshake_data();
    let mut payload = Vec::with_capacity(4 + data.len());
    payload.extend_from_slice(&NTOR_HANDSHAKE_TYPE.to_be_bytes());
    payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
    payload.extend_from_slice(&data);
    out.send(Cell::new(circ_id, CellCommand::Create2, payload))
        .await
        .unwrap();

    let created = match timeout(WAIT, inbox.recv()).await.unwrap().unwrap() {
        CircuitMsg::Neighbor(cell) => cell,
        other => panic!("expected CREATED2, got {:?}", other),
    };
    assert_eq!(created.command, CellCommand::Created2);
    let hlen = u16::from_be_bytes([created.payload[0], created.payload[1]]) as usize;
    let material = handshake.complete(&created.payload[2..2 + hlen]).unwrap();

    let origin = OriginCrypto::new(vec![HopCrypto::from_material(&material)]);
    (circ_id, out, inbox, origin)
}

/// Receive one backward relay cell and peel it.
async fn recv_backward(
    inbox: &mut mpsc::Receiver<CircuitMsg>,
    origin: &mut OriginCrypto,
) -> (usize, RelayCell) {
    let cell = match timeout(WAIT, inbox.recv()).await.unwrap().unwrap() {
        CircuitMsg::Neighbor(cell) => cell,
        other => panic!("expected a relay cell, got {:?}", other),
    };
    assert_eq!(cell.command, CellCommand::Relay);
    let mut payload: [u8; CELL_BODY_LEN] = cell.payload.as_slice().try_into().unwrap();
    let hop = origin
        .decrypt_backward(&mut payload)
        .expect("backward cell recognized");
    (hop, RelayCell::decode(&payload).unwrap())
}

fn forward(
    origin: &mut OriginCrypto,
    circ_id: u32,
    target_hop: usize,
    command: RelayCommand,
    stream_id: u16,
    data: &[u8],
    early: bool,
) -> Cell {
    let mut payload = RelayCell::new(command, stream_id, data.to_vec())
        .encode()
        .unwrap();
    origin.encrypt_forward(target_hop, &mut payload);
    let cmd = if early {
        CellCommand::RelayEarly
    } else {
        CellCommand::Relay
    };
    Cell::new(circ_id, cmd, payload.to_vec())
}

#[tokio::test]
async fn create2_and_exit_policy_over_real_link() {
    let (relay, relay_addr, _relay_dir) = start_relay("alpha").await;
    let (client, _client_dir) = client_relay();

    let specs = vec![
        LinkSpec::tcp(relay_addr.ip(), relay_addr.port()),
        LinkSpec::LegacyId(relay.descriptor().fingerprint),
    ];
    let link = Arc::clone(&client).open_link(&specs).await.unwrap();

    match link.peer() {
        PeerIdentity::Relay {
            rsa_identity_digest,
            ..
        } => assert_eq!(*rsa_identity_digest, relay.descriptor().fingerprint),
        PeerIdentity::Client => panic!("responder must authenticate"),
    }

    let (circ_id, out, mut inbox, mut origin) = open_circuit(&link, &relay).await;

    // The default exit policy refuses every BEGIN.
    let begin = forward(
        &mut origin,
        circ_id,
        0,
        RelayCommand::Begin,
        3,
        b"example.com:80\0",
        false,
    );
    out.send(begin).await.unwrap();

    let (hop, end) = recv_backward(&mut inbox, &mut origin).await;
    assert_eq!(hop, 0);
    assert_eq!(end.command, RelayCommand::End);
    assert_eq!(end.stream_id, 3);
    assert_eq!(end.data, vec![4]); // exit policy
}

#[tokio::test]
async fn extend2_builds_a_two_hop_circuit() {
    let (entry, entry_addr, _entry_dir) = start_relay("entry").await;
    let (exit, exit_addr, _exit_dir) = start_relay("exit").await;
    let (client, _client_dir) = client_relay();

    let link = Arc::clone(&client)
        .open_link(&[LinkSpec::tcp(entry_addr.ip(), entry_addr.port())])
        .await
        .unwrap();
    let (circ_id, out, mut inbox, mut origin) = open_circuit(&link, &entry).await;

    // Ask the entry relay to extend to the exit.
    let exit_descriptor = exit.descriptor();
    let exit_handshake = ClientHandshake::new(
        exit_descriptor.fingerprint,
        PublicKey::from(exit_descriptor.ntor_onion_key),
    );
    let extend = Extend2::new(
        vec![
            LinkSpec::tcp(exit_addr.ip(), exit_addr.port()),
            LinkSpec::LegacyId(exit_descriptor.fingerprint),
        ],
        NTOR_HANDSHAKE_TYPE,
        &exit_handshake.handshake_data(),
    );
    let cell = forward(
        &mut origin,
        circ_id,
        0,
        RelayCommand::Extend2,
        0,
        &extend.encode(),
        true,
    );
    out.send(cell).await.unwrap();

    let (hop, extended) = recv_backward(&mut inbox, &mut origin).await;
    assert_eq!(hop, 0);
    assert_eq!(extended.command, RelayCommand::Extended2);

    let hlen = u16::from_be_bytes([extended.data[0], extended.data[1]]) as usize;
    let material = exit_handshake
        .complete(&extended.data[2..2 + hlen])
        .unwrap();
    origin.push_hop(HopCrypto::from_material(&material));

    // A BEGIN addressed to the exit traverses the entry unrecognized and is
    // refused by the exit's policy.
    let begin = forward(
        &mut origin,
        circ_id,
        1,
        RelayCommand::Begin,
        7,
        b"example.com:443\0",
        false,
    );
    out.send(begin).await.unwrap();

    let (hop, end) = recv_backward(&mut inbox, &mut origin).await;
    assert_eq!(hop, 1, "END originates at the exit hop");
    assert_eq!(end.command, RelayCommand::End);
    assert_eq!(end.stream_id, 7);
    assert_eq!(end.data, vec![4]);
}

#[tokio::test]
async fn destroy_cascades_to_the_next_hop() {
    let (entry, entry_addr, _entry_dir) = start_relay("entry2").await;
    let (exit, exit_addr, _exit_dir) = start_relay("exit2").await;
    let (client, _client_dir) = client_relay();

    let link = Arc::clone(&client)
        .open_link(&[LinkSpec::tcp(entry_addr.ip(), entry_addr.port())])
        .await
        .unwrap();
    let (circ_id, out, mut inbox, mut origin) = open_circuit(&link, &entry).await;

    let exit_descriptor = exit.descriptor();
    let exit_handshake = ClientHandshake::new(
        exit_descriptor.fingerprint,
        PublicKey::from(exit_descriptor.ntor_onion_key),
    );
    let extend = Extend2::new(
        vec![LinkSpec::tcp(exit_addr.ip(), exit_addr.port())],
        NTOR_HANDSHAKE_TYPE,
        &exit_handshake.handshake_data(),
    );
    let cell = forward(
        &mut origin,
        circ_id,
        0,
        RelayCommand::Extend2,
        0,
        &extend.encode(),
        true,
    );
    out.send(cell).await.unwrap();
    let (_, extended) = recv_backward(&mut inbox, &mut origin).await;
    assert_eq!(extended.command, RelayCommand::Extended2);

    // Tearing down at the client side must destroy the entry's circuit; a
    // later cell for the same id is dropped as unknown rather than answered.
    out.send(Cell::destroy(
        circ_id,
        tor_relay::protocol::cell::DestroyReason::Requested,
    ))
    .await
    .unwrap();

    let probe = forward(&mut origin, circ_id, 0, RelayCommand::Drop, 0, &[], false);
    out.send(probe).await.unwrap();
    let quiet = timeout(Duration::from_secs(2), inbox.recv()).await;
    assert!(quiet.is_err(), "no reply for a destroyed circuit");
}
