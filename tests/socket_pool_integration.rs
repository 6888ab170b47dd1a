//! Integration tests for the shared-port socket pool behind MultiConn::bind.

use rtcd_integration_tests::TEST_TIMEOUT;
use rtcd_transport::transport::Transport;
use rtcd_transport::{MultiConn, TransportConfig, TransportError};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::timeout;

fn pool_config(addr: &str, sockets: usize) -> TransportConfig {
    TransportConfig::new(addr.parse::<SocketAddr>().unwrap()).with_sockets(sockets)
}

#[tokio::test]
async fn test_bind_pool_shares_one_port() {
    let mc = MultiConn::bind(&pool_config("127.0.0.1:0", 4)).unwrap();
    assert_eq!(mc.conn_count(), 4);

    let port = mc.local_addr().unwrap().port();
    assert_ne!(port, 0);
    assert!(mc.local_addrs().iter().all(|a| a.port() == port));

    mc.close().await.unwrap();
}

#[tokio::test]
async fn test_bind_rejects_invalid_config() {
    let mut config = pool_config("127.0.0.1:0", 2);
    config.receive_mtu = 0;
    assert!(matches!(
        MultiConn::bind(&config),
        Err(TransportError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_pool_serves_many_clients() {
    const CLIENTS: usize = 8;
    const PER_CLIENT: usize = 5;

    let mc = MultiConn::bind(&pool_config("127.0.0.1:0", 4)).unwrap();
    let server = mc.local_addr().unwrap();

    let mut clients = Vec::new();
    for i in 0..CLIENTS {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for j in 0..PER_CLIENT {
            client.send_to(&[i as u8, j as u8], server).await.unwrap();
        }
        clients.push(client);
    }

    let mut per_peer: HashMap<SocketAddr, usize> = HashMap::new();
    let mut buf = vec![0u8; 1500];
    for _ in 0..CLIENTS * PER_CLIENT {
        let (n, peer) = timeout(TEST_TIMEOUT, mc.recv_from(&mut buf))
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(n, 2);
        *per_peer.entry(peer).or_default() += 1;
    }

    assert_eq!(per_peer.len(), CLIENTS);
    assert!(per_peer.values().all(|c| *c == PER_CLIENT));
    for client in &clients {
        assert!(per_peer.contains_key(&client.local_addr().unwrap()));
    }

    mc.close().await.unwrap();
}

/// Every address in 127.0.0.0/8 is local on Linux, so a pool bound to the
/// wildcard address sees datagrams for 127.0.0.2 and must answer from it
/// even though the kernel would pick 127.0.0.1 on its own.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_replies_leave_from_address_peer_reached() {
    let mc = MultiConn::bind(&pool_config("0.0.0.0:0", 3)).unwrap();
    let port = mc.local_addr().unwrap().port();
    let target: SocketAddr = SocketAddr::from(([127, 0, 0, 2], port));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"hello", target).await.unwrap();

    let mut buf = vec![0u8; 1500];
    let (n, peer) = timeout(TEST_TIMEOUT, mc.recv_from(&mut buf))
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(mc.affinity().lookup(&peer), Some(target.ip()));

    // Every socket of the pool takes a turn; all must keep the affinity.
    for _ in 0..mc.conn_count() {
        mc.send_to(&buf[..n], peer).await.unwrap();
    }

    let mut reply = [0u8; 16];
    for _ in 0..mc.conn_count() {
        let (n, from) = timeout(TEST_TIMEOUT, client.recv_from(&mut reply))
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(&reply[..n], b"hello");
        assert_eq!(from, target);
    }

    mc.close().await.unwrap();
}
