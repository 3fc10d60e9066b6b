//! JSON snapshots of runtime state, for RPC-style introspection.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use sbr_queue::{BufferId, GroupSet};

use crate::backfill::BackfillWindow;
use crate::dribble::TxnDribbleStats;

/// Per-group, per-buffer transmit counters.
#[must_use]
pub fn queue_info(groups: &GroupSet) -> Value {
    let mut out = Map::new();
    for (group_id, group) in groups.iter() {
        let mut buffers = Map::new();
        for buffer in BufferId::ALL {
            let stats = group.buffer_stats(buffer);
            buffers.insert(
                format!("buffer_{}", buffer as usize),
                json!({
                    "tx_bytes": stats.tx_bytes,
                    "tx_pkts": stats.tx_packets,
                }),
            );
        }
        out.insert(format!("group_{group_id}"), Value::Object(buffers));
    }
    Value::Object(out)
}

/// Summary of one backfill window: extent, size, and its largest block.
#[must_use]
pub fn window_info(name: &str, window: &Arc<BackfillWindow>) -> Value {
    let snapshot = window.snapshot();
    let min = snapshot.iter().map(|(h, _, _)| *h).min();
    let max = snapshot.iter().map(|(h, _, _)| *h).max();
    let largest = snapshot
        .iter()
        .max_by_key(|(_, _, total)| *total)
        .map(|(h, _, _)| *h);
    json!({
        "stream": name,
        "size_mb": window.bytes() as f64 / (1024.0 * 1024.0),
        "min": min,
        "max": max,
        "largest": largest,
        "blocks": snapshot
            .iter()
            .map(|(h, idx, total)| json!({"height": h, "index": idx, "total": total}))
            .collect::<Vec<_>>(),
    })
}

/// Dribbled-transaction counters per stream.
#[must_use]
pub fn txn_info(name: &str, stats: &Arc<TxnDribbleStats>) -> Value {
    json!({
        "stream": name,
        "tx_count": stats.tx_count.load(std::sync::atomic::Ordering::Relaxed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbr_queue::QueueSignal;

    #[test]
    fn queue_info_shape() {
        let signal = QueueSignal::new();
        let groups = GroupSet::new(signal);
        let value = queue_info(&groups);
        assert!(value.as_object().unwrap().is_empty());
    }

    #[test]
    fn window_info_reports_extent() {
        let window = Arc::new(BackfillWindow::new());
        let value = window_info("0-0", &window);
        assert_eq!(value["stream"], "0-0");
        assert!(value["min"].is_null());
        assert_eq!(value["blocks"].as_array().unwrap().len(), 0);
    }
}
