// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Basic pub/sub example.
//!
//! Run two instances (same machine or same LAN):
//!
//! ```text
//! cargo run --example basic_pubsub -- sub
//! cargo run --example basic_pubsub -- pub
//! ```
//!
//! Both sides must share the same `PARTITION` (the default derives from
//! hostname and username, so two shells on one machine just work).

use std::time::Duration;
use weft::messages::StringMsg;
use weft::{Node, Scope};

fn main() -> weft::Result<()> {
    env_logger::init();

    let role = std::env::args().nth(1).unwrap_or_else(|| "pub".to_string());
    let node = Node::new()?;

    match role.as_str() {
        "sub" => {
            node.subscribe("/chatter", |topic: &str, msg: &StringMsg| {
                println!("[{}] {}", topic, msg.data);
            })?;
            println!("subscribed to /chatter, waiting for messages...");
            loop {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        _ => {
            node.advertise("/chatter", Scope::All)?;
            println!("publishing on /chatter every second...");
            let mut count = 0u64;
            loop {
                count += 1;
                node.publish("/chatter", &StringMsg::new(format!("hello #{}", count)))?;
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
}
