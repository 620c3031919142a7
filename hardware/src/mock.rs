//! Mock channel backend for testing
//!
//! Channels are declared up front with a model describing what `get` returns.
//! Every operation is recorded in order so tests can assert on exactly which
//! setpoints were commanded and which monitors were sampled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::channel::{
    ChannelBackend, ChannelError, ChannelResult, ChannelSession, HardwareChannel,
};

/// A recorded channel operation
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOp {
    /// A value was read
    Get { name: String, value: f64 },
    /// A value was commanded
    Put { name: String, value: f64 },
}

impl ChannelOp {
    /// Name of the channel the operation touched
    pub fn name(&self) -> &str {
        match self {
            ChannelOp::Get { name, .. } | ChannelOp::Put { name, .. } => name,
        }
    }
}

/// Monitor response as a function of the linked setpoint
pub type ResponseFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Hook run after each recorded operation, with the operation and its ordinal (1-based)
pub type OpHook = Arc<dyn Fn(&ChannelOp, usize) + Send + Sync>;

/// How a readback channel relates to its setpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadbackMode {
    /// Reads back the last commanded value
    Follow,
    /// Reads back the last commanded value plus a fixed offset
    Offset(f64),
    /// Never moves from this value
    Stuck(f64),
}

#[derive(Clone)]
enum ChannelModel {
    Setpoint,
    Readback { source: String, mode: ReadbackMode },
    Response { source: String, response: ResponseFn },
}

#[derive(Debug, Clone, Copy)]
struct GetFault {
    after_reads: usize,
}

#[derive(Default)]
struct MockState {
    models: HashMap<String, ChannelModel>,
    values: HashMap<String, f64>,
    get_faults: HashMap<String, GetFault>,
    put_faults: HashMap<String, f64>,
    reads: HashMap<String, usize>,
    ops: Vec<ChannelOp>,
    hook: Option<OpHook>,
    fail_connect: bool,
    sessions_opened: usize,
    sessions_released: usize,
}

/// Scripted in-memory channel backend
///
/// Cloning shares the underlying state, so a test can keep one handle for
/// inspection while the scan worker owns another.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    /// Create an empty backend with no channels
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a setpoint channel; `get` returns the last value put (0.0 initially)
    pub fn with_setpoint(self, name: &str) -> Self {
        self.lock()
            .models
            .insert(name.to_string(), ChannelModel::Setpoint);
        self
    }

    /// Declare a readback channel that tracks `source`
    pub fn with_readback(self, name: &str, source: &str, mode: ReadbackMode) -> Self {
        self.lock().models.insert(
            name.to_string(),
            ChannelModel::Readback {
                source: source.to_string(),
                mode,
            },
        );
        self
    }

    /// Declare a monitor channel whose value is `response(setpoint of source)`
    pub fn with_response<F>(self, name: &str, source: &str, response: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        self.lock().models.insert(
            name.to_string(),
            ChannelModel::Response {
                source: source.to_string(),
                response: Arc::new(response),
            },
        );
        self
    }

    /// Make every read of `name` after the first `after_reads` fail with a timeout
    pub fn with_get_fault(self, name: &str, after_reads: usize) -> Self {
        self.lock()
            .get_faults
            .insert(name.to_string(), GetFault { after_reads });
        self
    }

    /// Make every put of exactly `value` to `name` fail as rejected
    pub fn with_put_fault(self, name: &str, value: f64) -> Self {
        self.lock().put_faults.insert(name.to_string(), value);
        self
    }

    /// Install a hook that runs after every operation (outside the backend lock)
    pub fn with_hook<F>(self, hook: F) -> Self
    where
        F: Fn(&ChannelOp, usize) + Send + Sync + 'static,
    {
        self.lock().hook = Some(Arc::new(hook));
        self
    }

    /// Make `connect` fail
    pub fn failing_connect(self) -> Self {
        self.lock().fail_connect = true;
        self
    }

    /// All operations recorded so far, in order
    pub fn ops(&self) -> Vec<ChannelOp> {
        self.lock().ops.clone()
    }

    /// Number of operations recorded so far
    pub fn op_count(&self) -> usize {
        self.lock().ops.len()
    }

    /// Values put to `name`, in order
    pub fn puts_to(&self, name: &str) -> Vec<f64> {
        self.lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                ChannelOp::Put { name: n, value } if n == name => Some(*value),
                _ => None,
            })
            .collect()
    }

    /// Number of reads from `name`
    pub fn reads_from(&self, name: &str) -> usize {
        self.lock().reads.get(name).copied().unwrap_or(0)
    }

    /// Last value commanded to a setpoint channel
    pub fn value(&self, name: &str) -> Option<f64> {
        self.lock().values.get(name).copied()
    }

    /// Number of sessions created
    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    /// Number of sessions dropped
    pub fn sessions_released(&self) -> usize {
        self.lock().sessions_released
    }

    /// Record an operation and run the hook without holding the lock
    fn record(&self, op: ChannelOp) {
        let (hook, ordinal) = {
            let mut state = self.lock();
            state.ops.push(op.clone());
            (state.hook.clone(), state.ops.len())
        };
        if let Some(hook) = hook {
            hook(&op, ordinal);
        }
    }

    fn read(&self, name: &str) -> ChannelResult<f64> {
        let value = {
            let mut state = self.lock();
            let count = {
                let reads = state.reads.entry(name.to_string()).or_insert(0);
                *reads += 1;
                *reads
            };
            if let Some(fault) = state.get_faults.get(name) {
                if count > fault.after_reads {
                    return Err(ChannelError::ReadTimeout {
                        name: name.to_string(),
                    });
                }
            }

            let setpoint = |source: &str| state.values.get(source).copied().unwrap_or(0.0);
            match state.models.get(name) {
                Some(ChannelModel::Setpoint) => setpoint(name),
                Some(ChannelModel::Readback { source, mode }) => match mode {
                    ReadbackMode::Follow => setpoint(source),
                    ReadbackMode::Offset(offset) => setpoint(source) + offset,
                    ReadbackMode::Stuck(value) => *value,
                },
                Some(ChannelModel::Response { source, response }) => response(setpoint(source)),
                None => return Err(ChannelError::UnknownChannel(name.to_string())),
            }
        };

        self.record(ChannelOp::Get {
            name: name.to_string(),
            value,
        });
        Ok(value)
    }

    fn write(&self, name: &str, value: f64) -> ChannelResult<()> {
        {
            let mut state = self.lock();
            let writable = match state.models.get(name) {
                Some(model) => matches!(model, ChannelModel::Setpoint),
                None => return Err(ChannelError::UnknownChannel(name.to_string())),
            };
            let refused = state.put_faults.get(name) == Some(&value);
            if !writable || refused {
                return Err(ChannelError::PutRejected {
                    name: name.to_string(),
                    value,
                });
            }
            state.values.insert(name.to_string(), value);
        }

        self.record(ChannelOp::Put {
            name: name.to_string(),
            value,
        });
        Ok(())
    }
}

impl ChannelBackend for MockBackend {
    fn connect(&self) -> ChannelResult<Box<dyn ChannelSession>> {
        let mut state = self.lock();
        if state.fail_connect {
            return Err(ChannelError::Context("mock context refused".to_string()));
        }
        state.sessions_opened += 1;
        Ok(Box::new(MockSession {
            backend: self.clone(),
        }))
    }
}

struct MockSession {
    backend: MockBackend,
}

impl ChannelSession for MockSession {
    fn open(&mut self, name: &str) -> ChannelResult<Box<dyn HardwareChannel>> {
        if !self.backend.lock().models.contains_key(name) {
            return Err(ChannelError::UnknownChannel(name.to_string()));
        }
        Ok(Box::new(MockChannel {
            name: name.to_string(),
            backend: self.backend.clone(),
        }))
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.backend.lock().sessions_released += 1;
    }
}

struct MockChannel {
    name: String,
    backend: MockBackend,
}

impl HardwareChannel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&mut self) -> ChannelResult<f64> {
        self.backend.read(&self.name)
    }

    fn put(&mut self, value: f64) -> ChannelResult<()> {
        self.backend.write(&self.name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn backend() -> MockBackend {
        MockBackend::new()
            .with_setpoint("CAV:SET")
            .with_readback("CAV:RB", "CAV:SET", ReadbackMode::Offset(1.5))
            .with_response("BPM", "CAV:SET", |phase| phase * 2.0)
    }

    #[test]
    fn test_response_tracks_setpoint() {
        let backend = backend();
        let mut session = backend.connect().unwrap();
        let mut set = session.open("CAV:SET").unwrap();
        let mut bpm = session.open("BPM").unwrap();
        let mut rb = session.open("CAV:RB").unwrap();

        set.put(10.0).unwrap();
        assert_abs_diff_eq!(bpm.get().unwrap(), 20.0);
        assert_abs_diff_eq!(rb.get().unwrap(), 11.5);
        assert_eq!(backend.puts_to("CAV:SET"), vec![10.0]);
        assert_eq!(backend.reads_from("BPM"), 1);
    }

    #[test]
    fn test_unknown_channel() {
        let backend = backend();
        let mut session = backend.connect().unwrap();
        assert!(matches!(
            session.open("NOPE"),
            Err(ChannelError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_put_to_monitor_rejected() {
        let backend = backend();
        let mut session = backend.connect().unwrap();
        let mut bpm = session.open("BPM").unwrap();
        assert!(matches!(
            bpm.put(1.0),
            Err(ChannelError::PutRejected { .. })
        ));
        assert_eq!(backend.op_count(), 0);
    }

    #[test]
    fn test_put_fault_refuses_one_value() {
        let backend = backend().with_put_fault("CAV:SET", 12.5);
        let mut session = backend.connect().unwrap();
        let mut set = session.open("CAV:SET").unwrap();
        set.put(10.0).unwrap();
        assert!(matches!(
            set.put(12.5),
            Err(ChannelError::PutRejected { value, .. }) if value == 12.5
        ));
        assert_eq!(backend.value("CAV:SET"), Some(10.0));
        assert_eq!(backend.puts_to("CAV:SET"), vec![10.0]);
    }

    #[test]
    fn test_get_fault_after_reads() {
        let backend = backend().with_get_fault("BPM", 2);
        let mut session = backend.connect().unwrap();
        let mut bpm = session.open("BPM").unwrap();
        assert!(bpm.get().is_ok());
        assert!(bpm.get().is_ok());
        assert!(matches!(bpm.get(), Err(ChannelError::ReadTimeout { .. })));
    }

    #[test]
    fn test_session_release_counted() {
        let backend = backend();
        {
            let _session = backend.connect().unwrap();
            assert_eq!(backend.sessions_opened(), 1);
            assert_eq!(backend.sessions_released(), 0);
        }
        assert_eq!(backend.sessions_released(), 1);
    }

    #[test]
    fn test_hook_sees_ordinal() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let backend = backend().with_hook(move |_op, ordinal| {
            seen_clone.store(ordinal, Ordering::SeqCst);
        });
        let mut session = backend.connect().unwrap();
        let mut set = session.open("CAV:SET").unwrap();
        set.put(1.0).unwrap();
        set.put(2.0).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
