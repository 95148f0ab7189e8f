// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/reply example: an echo service.
//!
//! ```text
//! cargo run --example service_echo -- serve
//! cargo run --example service_echo -- call 42
//! ```

use std::time::Duration;
use weft::messages::Int32;
use weft::{Node, Scope};

fn main() -> weft::Result<()> {
    env_logger::init();

    let role = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());
    let node = Node::new()?;

    match role.as_str() {
        "call" => {
            let value: i32 = std::env::args()
                .nth(2)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(42);

            match node.request_blocking::<Int32, Int32>(
                "/echo",
                &Int32::new(value),
                Duration::from_millis(2000),
            )? {
                Some(reply) => println!("echo replied: {}", reply.data),
                None => println!("echo refused the call"),
            }
            Ok(())
        }
        _ => {
            node.advertise_service(
                "/echo",
                |_topic: &str, req: &Int32| {
                    println!("echoing {}", req.data);
                    Some(*req)
                },
                Scope::All,
            )?;
            println!("serving /echo...");
            loop {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
}
