//! Outbound packet queues and the single sender task.
//!
//! Every output group owns four bounded ring buffers in strict priority
//! order (high, best-effort, background transactions, background block
//! backfill) and a token bucket sized at twice its byte rate. One
//! scheduler thread drains all groups: per group it picks the
//! highest-priority non-empty buffer, sends a bounded burst, charges the
//! bucket, and paces itself on the earliest per-group deadline, the
//! sockets' writability, or the shared non-empty signal — whichever
//! applies.

mod group;
mod ring;
mod sender;
mod throttle;

pub use group::{BufferId, GroupSet, QueueError, QueueSignal, TxQueueGroup, BUFFER_COUNT};
pub use ring::{OutboundPacket, PacketRing, RingStats, RING_CAPACITY};
pub use sender::{SendScheduler, MAX_CONSECUTIVE_TX};
pub use throttle::Throttle;
