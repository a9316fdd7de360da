//! Rotary encoder input.
//!
//! The encoder's quadrature decoding happens below us (kernel interrupt
//! handlers feeding an evdev device); this module only accumulates relative
//! steps into an atomic counter that the engine drains read-and-clear once
//! per tick. All policy lives in the engine loop. The push button doubles as
//! the provisioning trigger on a long press.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::engine::EngineEvent;

/// Hold the button this long to start provisioning.
pub const LONG_PRESS: Duration = Duration::from_secs(3);

const EV_KEY: u16 = 0x01;
const EV_REL: u16 = 0x02;

/// struct input_event on 64-bit: two u64 time words, type, code, value.
const EVENT_SIZE: usize = 24;

/// Shared position counter. The reader task only adds; the engine drains.
#[derive(Debug, Default)]
pub struct EncoderCounter {
    steps: AtomicI32,
}

impl EncoderCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: i32) {
        self.steps.fetch_add(n, Ordering::AcqRel);
    }

    /// Atomic read-and-clear, called once per engine tick.
    pub fn take(&self) -> i32 {
        self.steps.swap(0, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

/// Parse complete evdev records from `buf`, returning the events and the
/// number of bytes consumed.
pub fn parse_events(buf: &[u8]) -> (Vec<InputEvent>, usize) {
    let mut events = Vec::new();
    let mut consumed = 0;
    while buf.len() - consumed >= EVENT_SIZE {
        let rec = &buf[consumed..consumed + EVENT_SIZE];
        let kind = u16::from_ne_bytes([rec[16], rec[17]]);
        let code = u16::from_ne_bytes([rec[18], rec[19]]);
        let value = i32::from_ne_bytes([rec[20], rec[21], rec[22], rec[23]]);
        events.push(InputEvent { kind, code, value });
        consumed += EVENT_SIZE;
    }
    (events, consumed)
}

/// Read the encoder device forever, feeding the counter and watching for the
/// provisioning long-press. Exits (logged) if the device goes away.
pub fn spawn_reader(
    device: String,
    counter: Arc<EncoderCounter>,
    event_tx: mpsc::Sender<EngineEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&device).await {
            Ok(f) => f,
            Err(e) => {
                warn!("encoder device {} unavailable: {}", device, e);
                return;
            }
        };
        info!("encoder: reading {}", device);

        let mut buf = [0u8; EVENT_SIZE * 16];
        let mut pending = Vec::new();
        let mut pressed_at: Option<Instant> = None;

        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => {
                    warn!("encoder device {} closed", device);
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("encoder read error: {}", e);
                    return;
                }
            };
            pending.extend_from_slice(&buf[..n]);
            let (events, consumed) = parse_events(&pending);
            pending.drain(..consumed);

            for ev in events {
                match ev.kind {
                    EV_REL => counter.add(ev.value),
                    EV_KEY => match ev.value {
                        1 => pressed_at = Some(Instant::now()),
                        0 => {
                            if let Some(at) = pressed_at.take() {
                                if at.elapsed() >= LONG_PRESS {
                                    info!("encoder: long press, requesting provisioning");
                                    let _ = event_tx.send(EngineEvent::StartProvisioning).await;
                                }
                            }
                        }
                        _ => {} // key repeat
                    },
                    _ => {}
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: u16, code: u16, value: i32) -> [u8; EVENT_SIZE] {
        let mut rec = [0u8; EVENT_SIZE];
        rec[16..18].copy_from_slice(&kind.to_ne_bytes());
        rec[18..20].copy_from_slice(&code.to_ne_bytes());
        rec[20..24].copy_from_slice(&value.to_ne_bytes());
        rec
    }

    #[test]
    fn test_parse_rel_and_key_events() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&record(EV_REL, 0, 2));
        buf.extend_from_slice(&record(EV_REL, 0, -1));
        buf.extend_from_slice(&record(EV_KEY, 28, 1));

        let (events, consumed) = parse_events(&buf);
        assert_eq!(consumed, 3 * EVENT_SIZE);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].value, 2);
        assert_eq!(events[1].value, -1);
        assert_eq!(events[2].kind, EV_KEY);
    }

    #[test]
    fn test_parse_keeps_partial_record() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&record(EV_REL, 0, 1));
        buf.extend_from_slice(&record(EV_REL, 0, 1)[..10]);

        let (events, consumed) = parse_events(&buf);
        assert_eq!(events.len(), 1);
        assert_eq!(consumed, EVENT_SIZE);
    }

    #[test]
    fn test_counter_take_clears() {
        let c = EncoderCounter::new();
        c.add(3);
        c.add(-1);
        assert_eq!(c.take(), 2);
        assert_eq!(c.take(), 0);
    }
}
