//! Scripted device for exercising the loop without hardware.
//!
//! Every driver call is recorded in a shared log, reads are filled from a
//! configurable source, and any call can be made to fail on its nth occurrence.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use super::*;

/// What a read delivers on the first input channel. Other channels read zero.
#[derive(Clone, Debug, PartialEq)]
pub enum ReadSource {
    /// The same value for every sample
    Constant(f64),

    /// The `k`th read (from zero) fills with `k + 1`
    BlockIndex,

    /// The command channel of the most recent write, or zeros before any write
    Loopback,

    /// Consecutive samples across reads, then zeros once exhausted
    Sequence(Vec<f64>),
}

/// A driver call, as recorded in the log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateOutput,
    CreateInput,
    ConfigureOutput,
    ConfigureInput,
    RegisterDone,
    StartOutput,
    StartInput,
    Write,
    Read,
    StopOutput,
    StopInput,
    ClearOutput,
    ClearInput,
}

impl MockOp {
    fn injected(&self, task: &str) -> DaqError {
        let task = task.to_owned();
        let reason = format!("injected failure on {self:?}");
        match self {
            Self::CreateOutput | Self::CreateInput => DaqError::Create { task, reason },
            Self::ConfigureOutput | Self::ConfigureInput => DaqError::Configure { task, reason },
            Self::RegisterDone => DaqError::Register { task, reason },
            Self::StartOutput | Self::StartInput => DaqError::Start { task, reason },
            Self::Write => DaqError::Write { task, reason },
            Self::Read => DaqError::Read { task, reason },
            Self::StopOutput | Self::StopInput => DaqError::Stop { task, reason },
            Self::ClearOutput | Self::ClearInput => DaqError::Clear { task, reason },
        }
    }
}

/// Everything the device has been asked to do
#[derive(Clone, Debug, Default)]
pub struct MockLog {
    pub ops: Vec<MockOp>,

    /// Every accepted write, in order
    pub writes: Vec<Vec<f64>>,

    /// Number of completed reads
    pub reads: usize,
}

impl MockLog {
    pub fn count(&self, op: MockOp) -> usize {
        self.ops.iter().filter(|o| **o == op).count()
    }

    /// Position of the first occurrence of `op`
    pub fn position(&self, op: MockOp) -> Option<usize> {
        self.ops.iter().position(|o| *o == op)
    }
}

struct MockShared {
    log: MockLog,
    source: ReadSource,
    cursor: usize,
    fail_on: Option<(MockOp, usize)>,
    async_fault_on_write: Option<usize>,
    callback: Option<DoneCallback>,
}

impl MockShared {
    /// Log a call and fail it if it is the scripted failure
    fn record(&mut self, op: MockOp, task: &str) -> Result<(), DaqError> {
        let nth = self.log.count(op);
        self.log.ops.push(op);
        match self.fail_on {
            Some((f, n)) if f == op && n == nth => Err(op.injected(task)),
            _ => Ok(()),
        }
    }

    fn fill(&mut self, first: &mut [f64]) {
        match &self.source {
            ReadSource::Constant(v) => first.fill(*v),
            ReadSource::BlockIndex => first.fill((self.log.reads + 1) as f64),
            ReadSource::Loopback => match self.log.writes.last() {
                Some(w) if w.len() == 2 * first.len() => {
                    first.copy_from_slice(&w[first.len()..]);
                }
                _ => first.fill(0.0),
            },
            ReadSource::Sequence(values) => {
                for v in first.iter_mut() {
                    *v = values.get(self.cursor).copied().unwrap_or(0.0);
                    self.cursor += 1;
                }
            }
        }
    }
}

/// Device whose tasks succeed instantly, log every call, and fail on request
pub struct MockDevice {
    shared: Arc<Mutex<MockShared>>,
}

impl MockDevice {
    pub fn new(source: ReadSource) -> Self {
        Self {
            shared: Arc::new(Mutex::new(MockShared {
                log: MockLog::default(),
                source,
                cursor: 0,
                fail_on: None,
                async_fault_on_write: None,
                callback: None,
            })),
        }
    }

    /// Fail the `nth` call (from zero) of `op`
    pub fn fail_on(self, op: MockOp, nth: usize) -> Self {
        if let Ok(mut shared) = self.shared.lock() {
            shared.fail_on = Some((op, nth));
        }
        self
    }

    /// Fire the completion callback with a failure, from another thread,
    /// while the `n`th write (from one, counting the initial zero block) is in progress.
    /// I/O keeps succeeding afterward.
    pub fn async_fault_on_write(self, n: usize) -> Self {
        if let Ok(mut shared) = self.shared.lock() {
            shared.async_fault_on_write = Some(n);
        }
        self
    }

    /// Snapshot of the call log
    pub fn log(&self) -> MockLog {
        match self.shared.lock() {
            Ok(shared) => shared.log.clone(),
            Err(poisoned) => poisoned.into_inner().log.clone(),
        }
    }

    fn create(
        &mut self,
        op: MockOp,
        name: &str,
        channel: &ChannelConfig,
    ) -> Result<MockTask, DaqError> {
        lock(&self.shared, name)?.record(op, name)?;
        Ok(MockTask {
            name: name.to_owned(),
            output: op == MockOp::CreateOutput,
            n_channels: channel.n_channels,
            block_size: None,
            started: false,
            shared: self.shared.clone(),
        })
    }
}

impl Device for MockDevice {
    fn create_output_task(
        &mut self,
        name: &str,
        channel: &ChannelConfig,
    ) -> Result<Box<dyn OutputTask>, DaqError> {
        Ok(Box::new(self.create(MockOp::CreateOutput, name, channel)?))
    }

    fn create_input_task(
        &mut self,
        name: &str,
        channel: &ChannelConfig,
    ) -> Result<Box<dyn InputTask>, DaqError> {
        Ok(Box::new(self.create(MockOp::CreateInput, name, channel)?))
    }
}

fn lock<'a>(
    shared: &'a Mutex<MockShared>,
    task: &str,
) -> Result<MutexGuard<'a, MockShared>, DaqError> {
    shared.lock().map_err(|_| DaqError::Driver {
        task: task.to_owned(),
        code: -1,
        message: "mock device state is poisoned".to_owned(),
    })
}

/// One mock task serves as either direction
struct MockTask {
    name: String,
    output: bool,
    n_channels: usize,
    block_size: Option<usize>,
    started: bool,
    shared: Arc<Mutex<MockShared>>,
}

impl MockTask {
    fn op(&self, output: MockOp, input: MockOp) -> MockOp {
        if self.output { output } else { input }
    }

    fn check_len(&self, len: usize) -> Result<(), String> {
        match self.block_size {
            Some(n) if n * self.n_channels == len => Ok(()),
            Some(n) => Err(format!(
                "expected a block of {} samples, got {len}",
                n * self.n_channels
            )),
            None => Err("timing is not configured".to_owned()),
        }
    }
}

impl Task for MockTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure_timing(&mut self, timing: &TaskTiming) -> Result<(), DaqError> {
        let op = self.op(MockOp::ConfigureOutput, MockOp::ConfigureInput);
        lock(&self.shared, &self.name)?.record(op, &self.name)?;
        self.block_size = Some(timing.samples_per_channel);
        Ok(())
    }

    fn start(&mut self) -> Result<(), DaqError> {
        let op = self.op(MockOp::StartOutput, MockOp::StartInput);
        lock(&self.shared, &self.name)?.record(op, &self.name)?;
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DaqError> {
        let op = self.op(MockOp::StopOutput, MockOp::StopInput);
        self.started = false;
        lock(&self.shared, &self.name)?.record(op, &self.name)
    }

    fn clear(&mut self) -> Result<(), DaqError> {
        let op = self.op(MockOp::ClearOutput, MockOp::ClearInput);
        lock(&self.shared, &self.name)?.record(op, &self.name)
    }
}

impl OutputTask for MockTask {
    fn register_done_event(&mut self, callback: DoneCallback) -> Result<(), DaqError> {
        let mut shared = lock(&self.shared, &self.name)?;
        shared.record(MockOp::RegisterDone, &self.name)?;
        shared.callback = Some(callback);
        Ok(())
    }

    fn write(&mut self, data: &[f64], _timeout_s: f64) -> Result<(), DaqError> {
        let mut shared = lock(&self.shared, &self.name)?;
        shared.record(MockOp::Write, &self.name)?;
        self.check_len(data.len()).map_err(|reason| DaqError::Write {
            task: self.name.clone(),
            reason,
        })?;
        shared.log.writes.push(data.to_vec());

        if shared.async_fault_on_write == Some(shared.log.writes.len()) {
            shared.async_fault_on_write = None;
            if let Some(callback) = shared.callback.as_mut() {
                // Completion events arrive on a driver thread
                thread::scope(|s| {
                    s.spawn(move || {
                        callback(CompletionStatus::Failed {
                            code: -200_018,
                            message: "injected asynchronous fault".to_owned(),
                        })
                    });
                });
            }
        }
        Ok(())
    }
}

impl InputTask for MockTask {
    fn read(&mut self, data: &mut [f64], _timeout_s: f64) -> Result<(), DaqError> {
        let mut shared = lock(&self.shared, &self.name)?;
        shared.record(MockOp::Read, &self.name)?;
        if !self.started {
            return Err(DaqError::Read {
                task: self.name.clone(),
                reason: "task is not running".to_owned(),
            });
        }
        self.check_len(data.len()).map_err(|reason| DaqError::Read {
            task: self.name.clone(),
            reason,
        })?;

        let block_size = data.len() / self.n_channels;
        let (first, rest) = data.split_at_mut(block_size);
        shared.fill(first);
        rest.fill(0.0);
        shared.log.reads += 1;
        Ok(())
    }
}
