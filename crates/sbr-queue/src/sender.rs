//! The single sender task.
//!
//! One thread drains every output group. Per group and round it transmits
//! a burst from the highest-priority non-empty buffer, re-selecting when a
//! buffer runs dry, until the burst cap, the byte bucket, or socket
//! backpressure stops it. Frames are sealed here, at drain time, so the
//! same queued frame content can carry per-destination magics. Pacing:
//! sleep until the earliest per-group deadline; when every socket pushed
//! back, poll for writability; when every queue is empty, park on the
//! shared signal.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::AsFd;

use sbr_wire::{seal, MsgType, PACKET_SIZE};

use crate::group::{BufferId, GroupSet, TxQueueGroup};
use crate::ring::OutboundPacket;

/// Burst cap per group round, bounding how long one buffer can starve the
/// rest of the system.
pub const MAX_CONSECUTIVE_TX: usize = 10;

struct GroupRun {
    group_id: usize,
    group: Arc<TxQueueGroup>,
    next_send: Instant,
    /// Popped but unsent (socket pushed back); retried first next round.
    pending: Option<(BufferId, OutboundPacket)>,
}

/// Owns the send loop over a [`GroupSet`].
pub struct SendScheduler {
    groups: Arc<GroupSet>,
}

impl SendScheduler {
    #[must_use]
    pub fn new(groups: Arc<GroupSet>) -> Self {
        Self { groups }
    }

    /// Spawn the sender thread.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a thread.
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("relay-send".into())
            .spawn(move || self.run())
            .expect("spawn sender thread")
    }

    /// Run the send loop on the current thread until shutdown.
    pub fn run(self) {
        elevate_priority();
        let signal = Arc::clone(self.groups.signal());
        let now = Instant::now();
        let mut runs: Vec<GroupRun> = self
            .groups
            .iter()
            .map(|(group_id, group)| GroupRun {
                group_id,
                group: Arc::clone(group),
                next_send: now,
                pending: None,
            })
            .collect();

        loop {
            if signal.is_stopped() {
                return;
            }
            let mut t_next = Instant::now() + Duration::from_secs(3600);
            let mut maybe_all_empty = true;
            let mut maybe_all_full = !runs.is_empty();

            for run in &mut runs {
                let now = Instant::now();
                if run.next_send > now {
                    t_next = t_next.min(run.next_send);
                    continue;
                }

                let mut consecutive = 0;
                let mut wouldblock = false;
                let mut hard_error = false;
                loop {
                    if consecutive >= MAX_CONSECUTIVE_TX {
                        break;
                    }
                    if !run.group.is_unlimited()
                        && !run.group.throttle().lock().has_quota(PACKET_SIZE)
                    {
                        break;
                    }
                    let (buffer, mut pkt) = match run.pending.take() {
                        Some(p) => p,
                        None => match run.group.next_buffer() {
                            Some(b) => match run.group.buffer(b).pop() {
                                Some(p) => (b, p),
                                None => break,
                            },
                            None => break,
                        },
                    };
                    if !pkt.msg.is_sealed() {
                        if run.group.is_multicast() {
                            // Multicast sources only ever carry content kinds.
                            debug_assert!(pkt.msg.msg_type().is_some_and(MsgType::is_content));
                        }
                        seal(pkt.magic, pkt.msg.as_bytes_mut());
                    }
                    match run.group.socket().send_to(pkt.msg.as_bytes(), pkt.dest) {
                        Ok(sent) => {
                            consecutive += 1;
                            if !run.group.is_unlimited() {
                                run.group.throttle().lock().use_quota(sent);
                            }
                            run.group.buffer(buffer).record_drain(sent);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            run.pending = Some((buffer, pkt));
                            wouldblock = true;
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(group = run.group_id, error = %e, "sendto failed");
                            run.pending = Some((buffer, pkt));
                            hard_error = true;
                            break;
                        }
                    }
                }

                if !wouldblock {
                    maybe_all_full = false;
                }
                if run.pending.is_some() || !run.group.is_empty() {
                    maybe_all_empty = false;
                }

                let wait = if run.group.is_unlimited() {
                    Duration::ZERO
                } else {
                    run.group.throttle().lock().estimate_wait(PACKET_SIZE)
                };
                run.next_send = Instant::now() + wait;
                if hard_error {
                    // Back off instead of hammering a broken socket.
                    run.next_send = Instant::now() + Duration::from_millis(100);
                }
                t_next = t_next.min(run.next_send);
            }

            if signal.is_stopped() {
                return;
            }
            if maybe_all_full {
                poll_writable(&runs);
            }
            if maybe_all_empty && !self.groups.any_ready() {
                let groups = &self.groups;
                signal.wait_unless(|| groups.any_ready());
            } else {
                // Sleep out the earliest per-group deadline; queued but
                // rate-limited traffic lands here rather than spinning.
                let now = Instant::now();
                if t_next > now {
                    std::thread::sleep(t_next - now);
                }
            }
        }
    }
}

/// Wait (bounded) for any group socket to become writable again.
fn poll_writable(runs: &[GroupRun]) {
    loop {
        let mut fds: Vec<PollFd> = runs
            .iter()
            .map(|r| PollFd::new(r.group.socket().as_fd(), PollFlags::POLLOUT))
            .collect();
        match poll(&mut fds, PollTimeout::from(1000u16)) {
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "poll on send sockets failed");
                return;
            }
            Ok(_) => return,
        }
    }
}

#[cfg(unix)]
fn elevate_priority() {
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_RR);
        let param = libc::sched_param {
            sched_priority: max,
        };
        if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param) == 0 {
            tracing::info!("sender thread scheduled as round-robin realtime");
        } else {
            let nice = libc::nice(-20);
            tracing::info!(nice, "realtime scheduling unavailable, adjusted niceness");
        }
    }
}

#[cfg(not(unix))]
fn elevate_priority() {}
