//! Connected [`Connection`] pairs for tests and benchmarks.
use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Context;
use s2n_quic::{
    Client, Server,
    client::Connect,
    provider::{io::Default as DefaultIo, limits::Limits},
};

use crate::Connection;

// self-signed localhost certificate, only usable for local tests
static CERT_PEM: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/certs/cert.pem"));
static KEY_PEM: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/certs/key.pem"));

const MIB: usize = 1024 * 1024;
/// Socket and QUIC send buffers. A silent OT run with 2^24 OTs sends several
/// hundred MiB of PPRF transcript in a short burst.
const BUFFER_SIZE: usize = 200 * MIB;

/// Two connected parties over in-memory pipes, with spawned stream managers.
#[tracing::instrument]
pub async fn local_conn() -> anyhow::Result<(Connection, Connection)> {
    let ((conn1, sm1), (conn2, sm2)) = Connection::new_in_memory_pair();
    tokio::spawn(sm1.start());
    tokio::spawn(sm2.start());
    Ok((conn1, conn2))
}

/// Every sub-connection opens unidirectional streams, so the stream limits
/// are effectively lifted.
fn quic_limits() -> anyhow::Result<Limits> {
    let max_streams = 1 << 59;
    Ok(Limits::new()
        .with_max_send_buffer_size((BUFFER_SIZE + 100 * MIB) as u32)?
        .with_max_open_local_unidirectional_streams(max_streams)?
        .with_max_open_remote_unidirectional_streams(max_streams)?)
}

fn quic_io() -> anyhow::Result<DefaultIo> {
    let addr: SocketAddr = (Ipv4Addr::LOCALHOST, 0).into();
    Ok(DefaultIo::builder()
        .with_receive_address(addr)?
        .with_max_mtu(9000)?
        .with_recv_buffer_size(BUFFER_SIZE)?
        .with_send_buffer_size(BUFFER_SIZE)?
        .with_internal_recv_buffer_size(BUFFER_SIZE)?
        .with_internal_send_buffer_size(BUFFER_SIZE)?
        .build()?)
}

/// Two connected parties over a QUIC connection on localhost. The first
/// connection is the server side.
#[tracing::instrument]
pub async fn local_quic_conn() -> anyhow::Result<(Connection, Connection)> {
    let mut server: Server = Server::builder()
        .with_tls((CERT_PEM, KEY_PEM))?
        .with_io(quic_io()?)?
        .with_limits(quic_limits()?)?
        .start()?;
    let client = Client::builder()
        .with_tls(CERT_PEM)?
        .with_io(quic_io()?)?
        .with_limits(quic_limits()?)?
        .start()?;

    let server_addr: SocketAddr = (Ipv4Addr::LOCALHOST, server.local_addr()?.port()).into();
    let connect = Connect::new(server_addr).with_server_name("localhost");
    let (server_conn, client_conn) = tokio::join!(server.accept(), client.connect(connect));
    let server_conn = server_conn.context("server closed before accepting")?;
    let client_conn = client_conn.context("client failed to connect")?;

    let (server_conn, server_sm) = Connection::new_quic(server_conn);
    let (client_conn, client_sm) = Connection::new_quic(client_conn);
    tokio::spawn(server_sm.start());
    tokio::spawn(client_sm.start());
    Ok((server_conn, client_conn))
}
