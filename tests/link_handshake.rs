//! Link handshake integration: both roles driven over an in-memory duplex
//! stream with injected TLS session material.

use tor_relay::keys::RelayKeys;
use tor_relay::protocol::cell::{read_cell, write_cell, Cell, CellCommand};
use tor_relay::protocol::handshake::{LinkHandshake, LinkSecrets, PeerIdentity};
use tor_relay::protocol::netinfo::Netinfo;

fn addr(port: u16) -> std::net::SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn secrets_between(local: &RelayKeys, peer: &RelayKeys) -> LinkSecrets {
    // Both ends of one TLS session see the same exporter value.
    LinkSecrets {
        exporter: [0x42; 32],
        master_secret_binding: None,
        local_cert_der: local.link_cert_der().to_vec(),
        peer_cert_der: Some(peer.link_cert_der().to_vec()),
    }
}

#[tokio::test]
async fn relay_to_relay_handshake_authenticates_both_sides() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let keys_a = RelayKeys::load_or_create(dir_a.path()).unwrap();
    let keys_b = RelayKeys::load_or_create(dir_b.path()).unwrap();

    let a_digest = keys_a.rsa_identity_digest();
    let b_digest = keys_b.rsa_identity_digest();
    let secrets_a = secrets_between(&keys_a, &keys_b);
    let secrets_b = secrets_between(&keys_b, &keys_a);

    let (mut side_a, mut side_b) = tokio::io::duplex(256 * 1024);

    let responder = tokio::spawn(async move {
        let handshake = LinkHandshake::new(&keys_a, secrets_a, addr(9001), addr(9002));
        handshake.respond(&mut side_a).await
    });
    let initiator = tokio::spawn(async move {
        let handshake = LinkHandshake::new(&keys_b, secrets_b, addr(9002), addr(9001));
        handshake.initiate(&mut side_b).await
    });

    let responder_view = responder.await.unwrap().expect("responder side completes");
    let initiator_view = initiator.await.unwrap().expect("initiator side completes");

    assert_eq!(responder_view.version, 5);
    assert_eq!(initiator_view.version, 5);

    match responder_view.peer {
        PeerIdentity::Relay {
            rsa_identity_digest,
            ed25519_identity,
        } => {
            assert_eq!(rsa_identity_digest, b_digest);
            assert!(ed25519_identity.is_some());
        }
        PeerIdentity::Client => panic!("initiator should have authenticated"),
    }
    match initiator_view.peer {
        PeerIdentity::Relay {
            rsa_identity_digest,
            ..
        } => assert_eq!(rsa_identity_digest, a_digest),
        PeerIdentity::Client => panic!("responder is always a relay"),
    }
}

#[tokio::test]
async fn unauthenticated_client_completes_with_bare_netinfo() {
    let dir = tempfile::tempdir().unwrap();
    let keys = RelayKeys::load_or_create(dir.path()).unwrap();
    let secrets = LinkSecrets {
        exporter: [0x42; 32],
        master_secret_binding: None,
        local_cert_der: keys.link_cert_der().to_vec(),
        peer_cert_der: None,
    };

    let (mut relay_side, mut client_side) = tokio::io::duplex(256 * 1024);
    let responder = tokio::spawn(async move {
        let handshake = LinkHandshake::new(&keys, secrets, addr(9001), addr(9002));
        handshake.respond(&mut relay_side).await
    });

    // A minimal client: negotiate, read the responder's three cells, answer
    // with NETINFO alone.
    write_cell(&mut client_side, &Cell::versions(&[3, 4, 5]), 3)
        .await
        .unwrap();
    let versions = read_cell(&mut client_side, 3).await.unwrap();
    assert_eq!(versions.command, CellCommand::Versions);
    let version = *Cell::parse_versions(&versions.payload)
        .unwrap()
        .iter()
        .max()
        .unwrap();
    assert_eq!(version, 5);

    let certs = read_cell(&mut client_side, version).await.unwrap();
    assert_eq!(certs.command, CellCommand::Certs);
    let challenge = read_cell(&mut client_side, version).await.unwrap();
    assert_eq!(challenge.command, CellCommand::AuthChallenge);
    let netinfo = read_cell(&mut client_side, version).await.unwrap();
    assert_eq!(netinfo.command, CellCommand::Netinfo);

    let reply = Netinfo::for_link("127.0.0.1".parse().unwrap(), &[]);
    write_cell(
        &mut client_side,
        &Cell::new(0, CellCommand::Netinfo, reply.encode()),
        version,
    )
    .await
    .unwrap();

    let established = responder.await.unwrap().expect("handshake completes");
    assert_eq!(established.peer, PeerIdentity::Client);
}

#[tokio::test]
async fn out_of_sequence_cell_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let keys = RelayKeys::load_or_create(dir.path()).unwrap();
    let secrets = LinkSecrets {
        exporter: [0x42; 32],
        master_secret_binding: None,
        local_cert_der: keys.link_cert_der().to_vec(),
        peer_cert_der: None,
    };

    let (mut relay_side, mut client_side) = tokio::io::duplex(256 * 1024);
    let responder = tokio::spawn(async move {
        let handshake = LinkHandshake::new(&keys, secrets, addr(9001), addr(9002));
        handshake.respond(&mut relay_side).await
    });

    // NETINFO before VERSIONS must kill the connection.
    let netinfo = Netinfo::for_link("127.0.0.1".parse().unwrap(), &[]);
    write_cell(
        &mut client_side,
        &Cell::new(0, CellCommand::Netinfo, netinfo.encode()),
        3,
    )
    .await
    .unwrap();

    let result = responder.await.unwrap();
    assert!(result.is_err());
}
