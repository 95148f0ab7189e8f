// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery integration over real multicast sockets.
//!
//! Two discovery services with distinct process UUIDs stand in for two
//! processes; with port reuse both receive the group's datagrams on the
//! same host. Each test uses its own port pair so parallel tests (and a
//! live fabric on the default ports) never interfere.
//!
//! Environments without a multicast route (some containers) are
//! detected up front and the tests turn into no-ops rather than false
//! failures.

use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::time::Duration;
use uuid::Uuid;
use weft::config::Settings;
use weft::discovery::{Discovery, Publisher};
use weft::Scope;

const GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 7);

/// Check whether multicast loopback actually works here.
fn multicast_available(probe_port: u16) -> bool {
    use std::net::UdpSocket;

    let Ok(sender) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) else {
        return false;
    };
    let receiver = match socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    ) {
        Ok(socket) => socket,
        Err(_) => return false,
    };
    if receiver.set_reuse_address(true).is_err() {
        return false;
    }
    #[cfg(unix)]
    let _ = receiver.set_reuse_port(true);
    if receiver
        .bind(&std::net::SocketAddr::from((Ipv4Addr::UNSPECIFIED, probe_port)).into())
        .is_err()
    {
        return false;
    }
    let receiver: UdpSocket = receiver.into();
    if receiver.join_multicast_v4(&GROUP, &Ipv4Addr::UNSPECIFIED).is_err() {
        return false;
    }
    let _ = receiver.set_read_timeout(Some(Duration::from_millis(500)));
    let _ = sender.set_multicast_loop_v4(true);

    if sender.send_to(b"probe", (GROUP, probe_port)).is_err() {
        return false;
    }
    let mut buf = [0u8; 16];
    receiver.recv_from(&mut buf).is_ok()
}

fn settings(partition: &str, msg_port: u16, srv_port: u16) -> Settings {
    Settings {
        partition: partition.to_string(),
        group: GROUP,
        msg_port,
        srv_port,
        verbose: false,
        ip_override: None,
    }
}

fn publisher(topic: &str, node: &str, puuid: Uuid) -> Publisher {
    Publisher {
        topic: topic.to_string(),
        scope: Scope::All,
        address: "127.0.0.1:4100".to_string(),
        ctrl_address: "127.0.0.1:4101".to_string(),
        process_uuid: puuid,
        node_uuid: node.to_string(),
    }
}

#[test]
fn peers_find_each_other() {
    if !multicast_available(23418) {
        eprintln!("multicast unavailable, skipping");
        return;
    }

    let p1_uuid = Uuid::new_v4();
    let p2_uuid = Uuid::new_v4();
    let d1 = Discovery::start(settings("disc-test", 23419, 23420), p1_uuid).expect("d1");
    let d2 = Discovery::start(settings("disc-test", 23419, 23420), p2_uuid).expect("d2");

    d1.advertise(publisher("/disc/foo", "n1", p1_uuid));

    let (tx, rx) = mpsc::channel();
    d2.set_publisher_callbacks(
        std::sync::Arc::new(move |topic: &str, publisher: &Publisher| {
            let _ = tx.send((topic.to_string(), publisher.address.clone()));
        }),
        std::sync::Arc::new(|_, _| {}),
    );
    d2.discover("/disc/foo");

    // The SUBSCRIBE triggers an immediate ADVERTISE; the heartbeat
    // would also converge within a period.
    let (topic, address) = rx
        .recv_timeout(Duration::from_secs(3))
        .expect("publisher discovered");
    assert_eq!(topic, "/disc/foo");
    assert_eq!(address, "127.0.0.1:4100");
    assert_eq!(d2.publishers("/disc/foo").len(), 1);
}

#[test]
fn partitions_are_isolated() {
    if !multicast_available(23428) {
        eprintln!("multicast unavailable, skipping");
        return;
    }

    let p1_uuid = Uuid::new_v4();
    let p2_uuid = Uuid::new_v4();
    let d1 = Discovery::start(settings("partition-a", 23429, 23430), p1_uuid).expect("d1");
    let d2 = Discovery::start(settings("partition-b", 23429, 23430), p2_uuid).expect("d2");

    d1.advertise(publisher("/disc/isolated", "n1", p1_uuid));

    let (tx, rx) = mpsc::channel();
    d2.set_publisher_callbacks(
        std::sync::Arc::new(move |topic: &str, _publisher: &Publisher| {
            let _ = tx.send(topic.to_string());
        }),
        std::sync::Arc::new(|_, _| {}),
    );
    d2.discover("/disc/isolated");

    // Long enough for a SUBSCRIBE reply and one heartbeat round.
    assert!(
        rx.recv_timeout(Duration::from_millis(1500)).is_err(),
        "publisher leaked across partitions"
    );
    assert!(d2.publishers("/disc/isolated").is_empty());
    assert!(!d2.topic_list().contains(&"/disc/isolated".to_string()));
}

#[test]
fn dropped_peer_disconnects_via_bye() {
    if !multicast_available(23438) {
        eprintln!("multicast unavailable, skipping");
        return;
    }

    let p1_uuid = Uuid::new_v4();
    let p2_uuid = Uuid::new_v4();
    let d2 = Discovery::start(settings("disc-bye", 23439, 23440), p2_uuid).expect("d2");

    let (conn_tx, conn_rx) = mpsc::channel();
    let (disc_tx, disc_rx) = mpsc::channel();
    d2.set_publisher_callbacks(
        std::sync::Arc::new(move |topic: &str, _publisher: &Publisher| {
            let _ = conn_tx.send(topic.to_string());
        }),
        std::sync::Arc::new(move |topic: &str, _publisher: &Publisher| {
            let _ = disc_tx.send(topic.to_string());
        }),
    );
    d2.discover("/disc/bye");

    {
        let d1 = Discovery::start(settings("disc-bye", 23439, 23440), p1_uuid).expect("d1");
        d1.advertise(publisher("/disc/bye", "n1", p1_uuid));

        conn_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("publisher discovered");
        // d1 drops here and sends BYE.
    }

    disc_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("disconnection after BYE");
    assert!(d2.publishers("/disc/bye").is_empty());
}
