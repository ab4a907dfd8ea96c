//! VSOCK Channel (spec §4.12): length-prefixed binary framing between a
//! host-side handle and the guest it addresses.
//!
//! The transport itself is out of scope for this spec (opaque to the
//! core's contract); what's modeled here is the framing, the
//! `task_id`-keyed multiplexing of outstanding tasks, and the channel
//! API (`send`/`receive`/`is_connected`/`close`). `pair()` wires two
//! channel handles to a loopback transport so the rest of the workspace
//! (and its tests) can drive a realistic host/guest conversation without
//! a real VSOCK device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("length prefix {declared} does not match payload length {actual}")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("channel disconnected")]
    Disconnected,
    #[error("task `{task_id}` timed out after {waited_ms}ms")]
    Timeout { task_id: String, waited_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub task_id: String,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
}

/// A typed discriminant so acknowledgements and results can share one
/// stream safely (spec §6 "VSOCK wire format").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Task(TaskEnvelope),
    Result(ResultEnvelope),
}

impl Frame {
    pub fn task_id(&self) -> &str {
        match self {
            Frame::Task(t) => &t.task_id,
            Frame::Result(r) => &r.task_id,
        }
    }
}

/// Encodes `frame` as a 4-byte big-endian length prefix followed by its
/// compact binary payload.
pub fn serialize(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(frame).map_err(|e| FrameError::Encode(e.to_string()))?;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decodes a single length-prefixed frame from `bytes`; the prefix must
/// account for exactly the remaining bytes (one frame per call).
pub fn deserialize(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < 4 {
        return Err(FrameError::Decode("buffer shorter than the length prefix".to_string()));
    }
    let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let payload = &bytes[4..];
    if declared as usize != payload.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    bincode::deserialize(payload).map_err(|e| FrameError::Decode(e.to_string()))
}

struct Pending {
    results: HashMap<String, ResultEnvelope>,
}

/// One end of a loopback VSOCK pair. `send`/`receive` are the
/// caller-facing names from spec §4.12; internally frames pass through
/// an `mpsc` channel rather than a real socket.
pub struct VsockChannel {
    connected: AtomicBool,
    next_seq: AtomicU64,
    outbound: Sender<Vec<u8>>,
    inbound: Mutex<Receiver<Vec<u8>>>,
    pending: Mutex<Pending>,
}

impl VsockChannel {
    /// Builds a connected host/guest pair sharing one loopback transport.
    pub fn pair() -> (VsockChannel, VsockChannel) {
        let (host_tx, guest_rx) = std::sync::mpsc::channel();
        let (guest_tx, host_rx) = std::sync::mpsc::channel();
        let host = VsockChannel {
            connected: AtomicBool::new(true),
            next_seq: AtomicU64::new(0),
            outbound: host_tx,
            inbound: Mutex::new(host_rx),
            pending: Mutex::new(Pending { results: HashMap::new() }),
        };
        let guest = VsockChannel {
            connected: AtomicBool::new(true),
            next_seq: AtomicU64::new(0),
            outbound: guest_tx,
            inbound: Mutex::new(guest_rx),
            pending: Mutex::new(Pending { results: HashMap::new() }),
        };
        (host, guest)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), FrameError> {
        if !self.is_connected() {
            return Err(FrameError::Disconnected);
        }
        let bytes = serialize(frame)?;
        self.outbound.send(bytes).map_err(|_| FrameError::Disconnected)
    }

    /// Sends a task envelope and returns its `task_id` as the ack (spec
    /// §4.12: `send(payload) -> task_id_ack`).
    pub fn send(&self, task: TaskEnvelope) -> Result<String, FrameError> {
        let task_id = task.task_id.clone();
        self.send_frame(&Frame::Task(task))?;
        Ok(task_id)
    }

    /// The guest side's counterpart: sends a completed task's result
    /// back to whichever peer is waiting on its `task_id`.
    pub fn respond(&self, result: ResultEnvelope) -> Result<(), FrameError> {
        self.send_frame(&Frame::Result(result))
    }

    /// Pulls the next incoming task, blocking up to `timeout`. Used by
    /// the guest-side executor loop.
    pub fn recv_task(&self, timeout: Duration) -> Result<TaskEnvelope, FrameError> {
        let bytes = self
            .inbound
            .lock()
            .unwrap()
            .recv_timeout(timeout)
            .map_err(|e| match e {
                RecvTimeoutError::Timeout => FrameError::Timeout {
                    task_id: String::new(),
                    waited_ms: timeout.as_millis() as u64,
                },
                RecvTimeoutError::Disconnected => FrameError::Disconnected,
            })?;
        match deserialize(&bytes)? {
            Frame::Task(t) => Ok(t),
            Frame::Result(_) => Err(FrameError::Decode("expected a task frame, got a result frame".to_string())),
        }
    }

    /// Waits (up to `timeout`) for the result of `task_id`. Out-of-order
    /// results for other in-flight tasks are buffered in `pending` so
    /// that independent tasks complete independently — a caller waiting
    /// on task A never blocks behind task B's result arriving first.
    pub fn receive(&self, task_id: &str, timeout: Duration) -> Result<ResultEnvelope, FrameError> {
        if let Some(result) = self.pending.lock().unwrap().results.remove(task_id) {
            return Ok(result);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FrameError::Timeout {
                    task_id: task_id.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            let bytes = self
                .inbound
                .lock()
                .unwrap()
                .recv_timeout(remaining)
                .map_err(|e| match e {
                    RecvTimeoutError::Timeout => FrameError::Timeout {
                        task_id: task_id.to_string(),
                        waited_ms: timeout.as_millis() as u64,
                    },
                    RecvTimeoutError::Disconnected => FrameError::Disconnected,
                })?;
            match deserialize(&bytes)? {
                Frame::Result(r) if r.task_id == task_id => return Ok(r),
                Frame::Result(r) => {
                    self.pending.lock().unwrap().results.insert(r.task_id.clone(), r);
                }
                Frame::Task(_) => {
                    tracing::debug!("ignoring stray task frame while waiting on a result");
                }
            }
        }
    }

    /// A locally-unique id for the next task this side originates.
    pub fn next_task_id(&self, prefix: &str) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{seq}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> TaskEnvelope {
        TaskEnvelope {
            task_id: id.to_string(),
            command: "run".to_string(),
            args: vec!["--flag".to_string()],
            env: HashMap::new(),
            timeout_ms: 1000,
        }
    }

    fn result(id: &str, exit_code: i32) -> ResultEnvelope {
        ResultEnvelope {
            task_id: id.to_string(),
            exit_code,
            stdout: b"ok".to_vec(),
            stderr: Vec::new(),
            duration_ms: 5,
        }
    }

    #[test]
    fn l6_round_trip_for_task_and_result_frames() {
        let t = Frame::Task(task("t1"));
        assert_eq!(deserialize(&serialize(&t).unwrap()).unwrap(), t);
        let r = Frame::Result(result("t1", 0));
        assert_eq!(deserialize(&serialize(&r).unwrap()).unwrap(), r);
    }

    #[test]
    fn send_then_receive_round_trips_a_task() {
        let (host, guest) = VsockChannel::pair();
        let ack = host.send(task("t1")).unwrap();
        assert_eq!(ack, "t1");
        let received = guest.recv_task(Duration::from_millis(200)).unwrap();
        assert_eq!(received.task_id, "t1");
        guest.respond(result("t1", 0)).unwrap();
        let r = host.receive("t1", Duration::from_millis(200)).unwrap();
        assert_eq!(r.exit_code, 0);
    }

    #[test]
    fn independent_tasks_complete_independently_out_of_order() {
        let (host, guest) = VsockChannel::pair();
        host.send(task("t1")).unwrap();
        host.send(task("t2")).unwrap();
        guest.recv_task(Duration::from_millis(200)).unwrap();
        guest.recv_task(Duration::from_millis(200)).unwrap();

        // t2 finishes first.
        guest.respond(result("t2", 0)).unwrap();
        guest.respond(result("t1", 1)).unwrap();

        let r1 = host.receive("t1", Duration::from_millis(200)).unwrap();
        assert_eq!(r1.exit_code, 1);
        let r2 = host.receive("t2", Duration::from_millis(200)).unwrap();
        assert_eq!(r2.exit_code, 0);
    }

    #[test]
    fn receive_times_out_when_no_result_arrives() {
        let (host, _guest) = VsockChannel::pair();
        let err = host.receive("ghost", Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, FrameError::Timeout { .. }));
    }

    #[test]
    fn send_after_close_is_disconnected() {
        let (host, _guest) = VsockChannel::pair();
        host.close();
        assert!(!host.is_connected());
        let err = host.send(task("t1")).unwrap_err();
        assert!(matches!(err, FrameError::Disconnected));
    }

    #[test]
    fn length_prefix_mismatch_is_a_decode_error() {
        let mut bytes = serialize(&Frame::Task(task("t1"))).unwrap();
        bytes[3] ^= 0xFF;
        let err = deserialize(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::LengthMismatch { .. }));
    }

    proptest::proptest! {
        #[test]
        fn l6_prop_round_trip(exit_code in -10i32..10, duration_ms in 0u64..10_000) {
            let mut r = result("prop-task", exit_code);
            r.duration_ms = duration_ms;
            let frame = Frame::Result(r);
            proptest::prop_assert_eq!(deserialize(&serialize(&frame).unwrap()).unwrap(), frame);
        }
    }
}
