//! Property-Based Tests for the protocol codec

use kfs_client::ServerLocation;
use proptest::prelude::*;

/// Metaserver Allocate reply text naming `master` and listing `replicas`
/// in the given order.
pub fn allocate_reply_text(master: &ServerLocation, replicas: &[ServerLocation]) -> String {
    let list = replicas
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "OK\r\nCseq: 1\r\nStatus: 0\r\nChunk-handle: 9\r\nChunk-version: 2\r\n\
         Master: {}\r\nNum-replicas: {}\r\nReplicas: {}\r\n\r\n",
        master,
        replicas.len(),
        list
    )
}

/// Distinct chunk server locations.
pub fn hosts() -> impl Strategy<Value = Vec<ServerLocation>> {
    prop::collection::hash_set("[a-z][a-z0-9.-]{0,11}", 1..7).prop_flat_map(|names| {
        let len = names.len();
        (
            Just(names.into_iter().collect::<Vec<_>>()),
            prop::collection::vec(1i32..65536, len),
        )
            .prop_map(|(names, ports)| {
                names
                    .into_iter()
                    .zip(ports)
                    .map(|(h, p)| ServerLocation::new(h, p))
                    .collect()
            })
    })
}

pub fn name() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_.-]{1,32}"
}
