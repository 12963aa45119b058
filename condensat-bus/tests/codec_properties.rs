//! Property-based tests for the payload codec and correlation ids

#![allow(clippy::unwrap_used)]

use condensat_bus::{BusError, Message, decode, encode, generate_correlation_id};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Sample {
    app_name: String,
    hostname: String,
    pid: u32,
    cpu_usage: f64,
    memory_rss: u64,
    custom: BTreeMap<String, i64>,
    tags: Vec<String>,
    parent: Option<u32>,
}

fn sample_strategy() -> impl Strategy<Value = Sample> {
    (
        "[a-zA-Z0-9_-]{0,32}",
        "[a-z0-9.-]{0,32}",
        any::<u32>(),
        -1.0e6f64..1.0e6f64,
        any::<u64>(),
        prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..8),
        prop::collection::vec(".{0,16}", 0..8),
        prop::option::of(any::<u32>()),
    )
        .prop_map(
            |(app_name, hostname, pid, cpu_usage, memory_rss, custom, tags, parent)| Sample {
                app_name,
                hostname,
                pid,
                cpu_usage,
                memory_rss,
                custom,
                tags,
                parent,
            },
        )
}

proptest! {
    #[test]
    fn test_structured_payload_roundtrip(sample in sample_strategy()) {
        let bytes = encode(&sample).unwrap();
        prop_assert_eq!(decode::<Sample>(&bytes).unwrap(), sample);
    }

    #[test]
    fn test_opaque_bytes_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let message = Message::new("Example.Request", payload.clone());
        let restored = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(restored.payload, payload);
    }

    #[test]
    fn test_truncated_input_never_panics(sample in sample_strategy(), cut in 1usize..16) {
        let bytes = encode(&sample).unwrap();
        let cut = cut.min(bytes.len());
        let result = decode::<Sample>(&bytes[..bytes.len() - cut]);
        prop_assert!(matches!(result, Err(BusError::Decode(_))));
    }
}

#[test]
fn test_correlation_ids_are_unique() {
    let ids: HashSet<String> = (0..10_000).map(|_| generate_correlation_id()).collect();
    assert_eq!(ids.len(), 10_000);
}

#[tokio::test]
async fn test_correlation_ids_unique_across_tasks() {
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            tokio::spawn(async {
                (0..625)
                    .map(|_| generate_correlation_id())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for task in tasks {
        ids.extend(task.await.unwrap());
    }
    assert_eq!(ids.len(), 10_000);
}
