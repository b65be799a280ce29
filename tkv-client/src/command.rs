//! # Command Lifecycle
//!
//! Purpose: Drive one logical read from node selection to a single terminal
//! callback, across however many attempts it takes.
//!
//! ## Design Principles
//! 1. **Capability Trait**: `Command` is implemented per request kind; the
//!    executor only sees the trait.
//! 2. **Shared Parameters**: Attempts share immutable `ReadParams` through an
//!    `Arc`; only per-attempt state is fresh on `clone_attempt`.
//! 3. **Exactly Once**: The `Completion` flag lives in the shared parameters,
//!    so no pair of attempts can both reach the listener.
//! 4. **Clean Release**: A connection goes back to the pool only after its
//!    response was consumed in full.
//!
//! ## Attempt State Machine
//!
//! ```text
//! Created ─► NodeSelected ─► Sent ─► AwaitingResponse ─► Decoded ─► SuccessDispatched
//!    │            │            │             │               │
//!    └────────────┴────────────┴─────────────┴───────────────┴─► Failed ─► FailureDispatched
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tkv_common::protocol::{ProtoHeader, PROTO_HEADER_SIZE};
use tkv_common::{ClientError, ClientResult, Key, Partition, ReadOutcome, Record};
use tracing::{debug, warn};

use crate::cluster::{self, Node, PartitionMap, Replica};
use crate::decoder::{decode_header, decode_record, ResponseBuffer};
use crate::encoder::{encode_read, ReadScope};
use crate::policy::Policy;
use crate::pool::ConnectionPool;

/// Progress of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Created,
    NodeSelected,
    Sent,
    AwaitingResponse,
    Decoded,
    SuccessDispatched,
    Failed,
    FailureDispatched,
}

/// Receives the terminal result of a read.
pub trait RecordListener: Send + Sync {
    /// `record` is `None` when the key does not exist.
    fn on_success(&self, key: &Key, record: Option<Record>);

    fn on_failure(&self, error: &ClientError);
}

/// One-shot flag shared by every attempt of a logical request.
#[derive(Debug, Default)]
pub struct Completion(AtomicBool);

impl Completion {
    /// Claims the right to dispatch. True for exactly one caller.
    pub fn try_complete(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Immutable parameters of a read, shared across attempts.
pub struct ReadParams {
    key: Key,
    partition: Partition,
    bins: Option<Vec<String>>,
    listener: Option<Arc<dyn RecordListener>>,
    completion: Completion,
}

impl ReadParams {
    pub fn new(key: Key, bins: Option<Vec<String>>, listener: Option<Arc<dyn RecordListener>>) -> Self {
        let partition = Partition::new(&key);
        ReadParams {
            key,
            partition,
            bins,
            listener,
            completion: Completion::default(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Requested bins; `None` reads all of them.
    pub fn bins(&self) -> Option<&[String]> {
        self.bins.as_deref()
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }
}

/// Per-attempt state common to every read kind.
pub struct ReadAttempt {
    params: Arc<ReadParams>,
    state: CommandState,
    node: Option<Arc<Node>>,
    outcome: Option<ReadOutcome>,
    iteration: u32,
}

impl ReadAttempt {
    fn new(params: Arc<ReadParams>, iteration: u32) -> Self {
        ReadAttempt {
            params,
            state: CommandState::Created,
            node: None,
            outcome: None,
            iteration,
        }
    }

    fn next(&self) -> Self {
        ReadAttempt::new(Arc::clone(&self.params), self.iteration + 1)
    }

    pub fn params(&self) -> &Arc<ReadParams> {
        &self.params
    }
}

/// A request kind the executor can drive.
///
/// Implementors supply encoding and decoding; the lifecycle methods are
/// provided on top of `attempt`/`attempt_mut`.
pub trait Command: Send {
    fn attempt(&self) -> &ReadAttempt;

    fn attempt_mut(&mut self) -> &mut ReadAttempt;

    /// Writes the request bytes into `out`, replacing its contents.
    fn render(&self, policy: &Policy, out: &mut Vec<u8>) -> ClientResult<()>;

    /// Decodes one response message.
    fn decode(&self, message: &[u8]) -> ClientResult<ReadOutcome>;

    /// Fresh attempt sharing this command's parameters.
    fn clone_attempt(&self) -> Box<dyn Command>;

    fn state(&self) -> CommandState {
        self.attempt().state
    }

    fn key(&self) -> &Key {
        &self.attempt().params.key
    }

    /// Zero for the first attempt, incremented by each `clone_attempt`.
    fn iteration(&self) -> u32 {
        self.attempt().iteration
    }

    fn node(&self) -> Option<&Arc<Node>> {
        self.attempt().node.as_ref()
    }

    /// Picks and records the target node.
    fn select_node(&mut self, map: &dyn PartitionMap, replica: Replica) -> ClientResult<Arc<Node>> {
        let attempt = self.attempt_mut();
        let node = cluster::select_node(map, &attempt.params.partition, replica)?;
        attempt.node = Some(Arc::clone(&node));
        attempt.state = CommandState::NodeSelected;
        Ok(node)
    }

    fn mark_sent(&mut self) {
        self.attempt_mut().state = CommandState::Sent;
    }

    fn mark_awaiting_response(&mut self) {
        self.attempt_mut().state = CommandState::AwaitingResponse;
    }

    /// Decodes `message` and stores the outcome for `on_success`.
    fn parse_result(&mut self, message: &[u8]) -> ClientResult<()> {
        let decoded = self.decode(message);
        let attempt = self.attempt_mut();
        match decoded {
            Ok(outcome) => {
                attempt.outcome = Some(outcome);
                attempt.state = CommandState::Decoded;
                Ok(())
            }
            Err(err) => {
                attempt.state = CommandState::Failed;
                Err(err)
            }
        }
    }

    /// Hands the decoded record to the listener, at most once per request.
    fn on_success(&mut self) -> Option<Record> {
        let attempt = self.attempt_mut();
        let record = attempt.outcome.take().and_then(ReadOutcome::into_record);
        attempt.state = CommandState::SuccessDispatched;

        let params = &attempt.params;
        if !params.completion.try_complete() {
            debug!(key = %params.key, "request already completed");
        } else if let Some(listener) = &params.listener {
            listener.on_success(&params.key, record.clone());
        }
        record
    }

    /// Reports `error` to the listener, at most once per request.
    fn on_failure(&mut self, error: &ClientError) {
        let attempt = self.attempt_mut();
        attempt.state = CommandState::Failed;
        attempt.outcome = None;

        let params = &attempt.params;
        if !params.completion.try_complete() {
            debug!(key = %params.key, error = %error, "request already completed");
        } else if let Some(listener) = &params.listener {
            listener.on_failure(error);
        }
        attempt.state = CommandState::FailureDispatched;
    }
}

/// Reads bins of one record.
pub struct ReadCommand {
    attempt: ReadAttempt,
}

impl ReadCommand {
    /// `bins` of `None` reads every bin.
    pub fn new(key: Key, bins: Option<Vec<String>>, listener: Option<Arc<dyn RecordListener>>) -> Self {
        ReadCommand {
            attempt: ReadAttempt::new(Arc::new(ReadParams::new(key, bins, listener)), 0),
        }
    }
}

impl Command for ReadCommand {
    fn attempt(&self) -> &ReadAttempt {
        &self.attempt
    }

    fn attempt_mut(&mut self) -> &mut ReadAttempt {
        &mut self.attempt
    }

    fn render(&self, policy: &Policy, out: &mut Vec<u8>) -> ClientResult<()> {
        let params = &self.attempt.params;
        let scope = match params.bins() {
            Some(bins) => ReadScope::Bins(bins),
            None => ReadScope::All,
        };
        encode_read(out, policy, &params.key, scope)
    }

    fn decode(&self, message: &[u8]) -> ClientResult<ReadOutcome> {
        decode_record(message)
    }

    fn clone_attempt(&self) -> Box<dyn Command> {
        Box::new(ReadCommand {
            attempt: self.attempt.next(),
        })
    }
}

/// Reads only generation and expiration of one record.
pub struct ReadHeaderCommand {
    attempt: ReadAttempt,
}

impl ReadHeaderCommand {
    pub fn new(key: Key, listener: Option<Arc<dyn RecordListener>>) -> Self {
        ReadHeaderCommand {
            attempt: ReadAttempt::new(Arc::new(ReadParams::new(key, None, listener)), 0),
        }
    }
}

impl Command for ReadHeaderCommand {
    fn attempt(&self) -> &ReadAttempt {
        &self.attempt
    }

    fn attempt_mut(&mut self) -> &mut ReadAttempt {
        &mut self.attempt
    }

    fn render(&self, policy: &Policy, out: &mut Vec<u8>) -> ClientResult<()> {
        encode_read(out, policy, &self.attempt.params.key, ReadScope::Header)
    }

    fn decode(&self, message: &[u8]) -> ClientResult<ReadOutcome> {
        decode_header(message)
    }

    fn clone_attempt(&self) -> Box<dyn Command> {
        Box::new(ReadHeaderCommand {
            attempt: self.attempt.next(),
        })
    }
}

/// Runs commands for one execution context.
///
/// Owns the response buffer and request scratch space, so an executor must
/// not be shared between threads; create one per worker.
pub struct Executor {
    pool: ConnectionPool,
    partitions: Arc<dyn PartitionMap>,
    buffer: ResponseBuffer,
    request: Vec<u8>,
}

impl Executor {
    pub fn new(pool: ConnectionPool, partitions: Arc<dyn PartitionMap>) -> Self {
        Executor::with_buffers(pool, partitions, ResponseBuffer::new(), Vec::with_capacity(256))
    }

    /// Builds an executor around buffers kept from an earlier one.
    pub fn with_buffers(
        pool: ConnectionPool,
        partitions: Arc<dyn PartitionMap>,
        buffer: ResponseBuffer,
        request: Vec<u8>,
    ) -> Self {
        Executor {
            pool,
            partitions,
            buffer,
            request,
        }
    }

    /// Releases the response and request buffers for reuse.
    pub fn into_buffers(self) -> (ResponseBuffer, Vec<u8>) {
        (self.buffer, self.request)
    }

    /// Response buffer of this execution context.
    pub fn buffer(&self) -> &ResponseBuffer {
        &self.buffer
    }

    /// Runs `command` to completion, retrying per `policy`.
    ///
    /// The listener, if any, observes exactly one terminal callback; the
    /// same outcome is also returned.
    pub fn execute(&mut self, policy: &Policy, command: Box<dyn Command>) -> ClientResult<Option<Record>> {
        let deadline = (!policy.timeout.is_zero()).then(|| Instant::now() + policy.timeout);
        let mut command = command;

        loop {
            let err = match self.run_attempt(policy, command.as_mut(), deadline) {
                Ok(()) => return Ok(command.on_success()),
                Err(err) => err,
            };

            if can_retry(&err, command.iteration(), policy, deadline) {
                debug!(
                    key = %command.key(),
                    iteration = command.iteration(),
                    error = %err,
                    "retrying command"
                );
                if !policy.sleep_between_retries.is_zero() {
                    thread::sleep(policy.sleep_between_retries);
                }
                command = command.clone_attempt();
                continue;
            }

            command.on_failure(&err);
            return Err(err);
        }
    }

    fn run_attempt(
        &mut self,
        policy: &Policy,
        command: &mut dyn Command,
        deadline: Option<Instant>,
    ) -> ClientResult<()> {
        let node = command.select_node(self.partitions.as_ref(), policy.replica)?;
        command.render(policy, &mut self.request)?;

        let timeout = remaining(deadline)?;
        let mut conn = self.pool.acquire(&node)?;
        conn.set_timeout(timeout)?;
        conn.write(&self.request)?;
        command.mark_sent();

        let mut header = [0u8; PROTO_HEADER_SIZE];
        conn.read_fully(&mut header)?;
        command.mark_awaiting_response();
        let header = ProtoHeader::parse(&header)?;

        conn.read_fully(self.buffer.message_mut(header.size))?;
        match command.parse_result(self.buffer.message(header.size)) {
            Ok(()) => {
                conn.finish();
                Ok(())
            }
            Err(err) if err.keeps_connection() => {
                conn.finish();
                Err(err)
            }
            Err(err) => {
                warn!(node = %node.name(), error = %err, "discarding connection after decode failure");
                Err(err)
            }
        }
    }
}

fn remaining(deadline: Option<Instant>) -> ClientResult<Duration> {
    match deadline {
        None => Ok(Duration::ZERO),
        Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
            Some(left) if !left.is_zero() => Ok(left),
            _ => Err(ClientError::Timeout),
        },
    }
}

fn can_retry(err: &ClientError, iteration: u32, policy: &Policy, deadline: Option<Instant>) -> bool {
    if !err.is_retryable() || iteration >= policy.max_retries {
        return false;
    }
    match deadline {
        Some(deadline) => Instant::now() + policy.sleep_between_retries < deadline,
        None => true,
    }
}
