//! The two runtime loops: periodic stat snapshots and FIFO-drain trace
//! capture (§4.8). Both take a `Clock` so tests can drive them with virtual
//! time instead of real sleeps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::event::Event;
use crate::packet::{PacketBuffer, PACKET_SIZE};
use crate::pmu::{dtm, PmuContext};

/// Monotonic time source for the profiler loops. `now()` returns elapsed
/// time since the loop started; `sleep()` suspends for a duration. A
/// virtual implementation can advance `now()` without actually blocking,
/// letting tests exercise deadline logic deterministically.
pub trait Clock {
    fn now(&self) -> Duration;
    fn sleep(&self, dur: Duration);
}

/// Wall-clock implementation backed by `Instant`.
pub struct RealClock {
    start: Instant,
}

impl RealClock {
    pub fn new() -> Self {
        RealClock { start: Instant::now() }
    }
}

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RealClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// Runs the stat loop: sleep until the next interval deadline, snapshot
/// every event, invoke `on_snapshot`, repeat. If the clock has already
/// passed the deadline when checked, logs a warning and resyncs rather than
/// sleeping for a negative duration. Resets every touched mesh before
/// returning, whether the loop ended cleanly, by timeout, by signal, or by
/// error.
pub fn run_stat<C: Clock>(
    ctx: &mut PmuContext,
    events: &[Event],
    interval: Duration,
    timeout: Option<Duration>,
    clock: &C,
    stop: &AtomicBool,
    mut on_snapshot: impl FnMut(Duration, &[(String, u64)]),
) -> Result<()> {
    let body = (|| -> Result<()> {
        let mut next = interval;
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            if let Some(t) = timeout {
                if clock.now() >= t {
                    break;
                }
            }
            let now = clock.now();
            if now < next {
                clock.sleep(next - now);
            } else if now > next {
                log::warn!("stat loop missed deadline by {:?}, resyncing", now - next);
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let snapshot = ctx.snapshot(events)?;
            on_snapshot(clock.now(), &snapshot);
            next += interval;
        }
        Ok(())
    })();
    let reset_result = ctx.reset();
    body.and(reset_result)
}

/// Drains the first, stale FIFO entry for each event's watchpoint slot, per
/// §4.6. Waits briefly for it to appear but does not fail if it never does
/// — some slots may simply not have matched yet.
fn discard_initial_stale_packet(ctx: &PmuContext, events: &[Event]) -> Result<()> {
    const WAIT: Duration = Duration::from_millis(50);
    for event in events {
        let pmu_info = match event.pmu_info {
            Some(p) => p,
            None => continue,
        };
        let mesh = ctx.meshes.get(&event.mesh_index).unwrap();
        let xp = mesh.xp(pmu_info.xp_node_id).unwrap();
        let deadline = Instant::now() + WAIT;
        while !dtm::fifo_entry_ready(xp, &mesh.mmio, pmu_info.wp_index)? && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        if dtm::fifo_entry_ready(xp, &mesh.mmio, pmu_info.wp_index)? {
            dtm::fifo_ack(xp, &mesh.mmio, pmu_info.wp_index)?;
        }
    }
    Ok(())
}

/// Runs the trace loop: discards the stale first packet per event, then
/// busy-polls the FIFO until each interval deadline, emitting per-event
/// deltas through `on_interval`. Stops when accumulated packet bytes reach
/// `max_size_mb * 10^6`, the configured timeout elapses, or `stop` is set.
/// Returns one `PacketBuffer` per event, in the same order as `events`.
pub fn run_trace<C: Clock>(
    ctx: &mut PmuContext,
    events: &[Event],
    interval: Duration,
    timeout: Option<Duration>,
    max_size_mb: u64,
    clock: &C,
    stop: &AtomicBool,
    mut on_interval: impl FnMut(Duration, &[u64]),
) -> Result<Vec<PacketBuffer>> {
    let mut buffers: Vec<PacketBuffer> = events.iter().map(|_| PacketBuffer::new()).collect();
    let max_bytes = max_size_mb * 1_000_000;

    let body = (|| -> Result<()> {
        discard_initial_stale_packet(ctx, events)?;
        let mut total_packets: u64 = 0;
        let mut next = interval;
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            if let Some(t) = timeout {
                if clock.now() >= t {
                    break;
                }
            }
            if total_packets * PACKET_SIZE as u64 >= max_bytes {
                break;
            }

            let mut deltas = vec![0u64; events.len()];
            while clock.now() < next {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                for (i, event) in events.iter().enumerate() {
                    let pmu_info = match event.pmu_info {
                        Some(p) => p,
                        None => continue,
                    };
                    let mesh = ctx.meshes.get(&event.mesh_index).unwrap();
                    let xp = mesh.xp(pmu_info.xp_node_id).unwrap();
                    if dtm::fifo_entry_ready(xp, &mesh.mmio, pmu_info.wp_index)? {
                        let slot = buffers[i].next_slot_ptr() as *mut u64;
                        unsafe {
                            dtm::fifo_read_into(xp, &mesh.mmio, pmu_info.wp_index, slot)?;
                        }
                        dtm::fifo_ack(xp, &mesh.mmio, pmu_info.wp_index)?;
                        deltas[i] += 1;
                        total_packets += 1;
                    }
                }
                if total_packets * PACKET_SIZE as u64 >= max_bytes {
                    break;
                }
            }
            on_interval(clock.now(), &deltas);
            next += interval;
        }
        Ok(())
    })();
    let reset_result = ctx.reset();
    body.and(reset_result)?;
    Ok(buffers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// A clock whose `now()` only advances when `sleep()` is called,
    /// letting a test run a full interval loop without wall-clock delay.
    struct VirtualClock {
        elapsed: RefCell<Duration>,
    }

    impl VirtualClock {
        fn new() -> Self {
            VirtualClock {
                elapsed: RefCell::new(Duration::ZERO),
            }
        }
    }

    impl Clock for VirtualClock {
        fn now(&self) -> Duration {
            *self.elapsed.borrow()
        }

        fn sleep(&self, dur: Duration) {
            *self.elapsed.borrow_mut() += dur;
        }
    }

    #[test]
    fn virtual_clock_resyncs_without_negative_sleep() {
        let clock = VirtualClock::new();
        clock.sleep(Duration::from_millis(250));
        assert_eq!(clock.now(), Duration::from_millis(250));
        // simulate the overrun branch: now() already past next deadline
        let next = Duration::from_millis(100);
        assert!(clock.now() > next);
    }
}
