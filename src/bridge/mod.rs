//! Out-of-process operators.
//!
//! A [`Bridge`] multiplexes many concurrent task applications over a single
//! pair of byte streams to a worker process. Each application is a session
//! identified by its task key: the caller sends `init`, a run of `job` chunks
//! and `finish`, and then waits until the worker has streamed back every
//! output of that session and signalled `finish` itself.
//!
//! One background thread reads everything the worker sends and files it
//! under the matching session. The first protocol failure it hits is kept
//! and handed to every waiting and future caller: a bridge that lost sync
//! with its worker is never used again.

mod packet;

use std::collections::{BTreeMap, HashMap};
use std::io::{self, BufWriter, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use camino::Utf8PathBuf;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::core::{DataType, Dataset};
use crate::data::{CHUNK_SIZE, Codecs, Data, DataBuilder, chunks};
use crate::error::BridgeError;
use crate::graph::ExecNode;
use crate::operator::{ExecOp, Operator, PrepareContext, Task};
use crate::storage::Storage;

pub use packet::{JobPacket, JobType, MetaPacket, ResponsePacket, ResponseType, read_packet, write_packet};

/// Outputs of one session: `output key -> one Data per output type`.
pub type Outputs = BTreeMap<String, Vec<Data>>;

struct Pending {
    outputs: Outputs,
    builders: HashMap<String, Vec<DataBuilder>>,
    done: bool,
    cond: Arc<Condvar>,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, Pending>,
    /// Sticky once set.
    error: Option<BridgeError>,
}

struct Shared {
    state: Mutex<State>,
    output_types: Vec<DataType>,
    codecs: Codecs,
}

impl Shared {
    fn builders(&self) -> Vec<DataBuilder> {
        self.output_types.iter().cloned().map(DataBuilder::new).collect()
    }

    fn fail(&self, error: BridgeError) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
        for pending in state.pending.values() {
            pending.cond.notify_all();
        }
    }
}

type Writer = BufWriter<Box<dyn Write + Send>>;

pub struct Bridge {
    shared: Arc<Shared>,
    writer: Mutex<Option<Writer>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
}

impl Bridge {
    /// Performs the handshake on an existing pair of streams and starts the
    /// reader thread.
    pub fn connect<R, W>(reader: R, writer: W, meta: &MetaPacket, codecs: Codecs) -> Result<Self, BridgeError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let mut writer: Writer = BufWriter::new(Box::new(writer));
        write_packet(&mut writer, meta)?;
        writer.flush()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            output_types: meta.output_types.clone(),
            codecs,
        });

        let handle = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("bridge-reader".into())
                .spawn(move || read_loop(&shared, reader))?
        };

        Ok(Self {
            shared,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(handle)),
            child: Mutex::new(None),
        })
    }

    /// Starts a worker process and connects to its stdin and stdout.
    pub fn spawn(command: &WorkerCommand, meta: &MetaPacket, codecs: Codecs) -> Result<Self, BridgeError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let streams = child.stdin.take().zip(child.stdout.take());
        let bridge = match streams {
            Some((stdin, stdout)) => Self::connect(stdout, stdin, meta, codecs),
            None => Err(io::Error::other("worker streams are not piped").into()),
        };

        match bridge {
            Ok(bridge) => {
                tracing::debug!("spawned worker {} (pid {})", command.program, child.id());
                *bridge.child.lock() = Some(child);
                Ok(bridge)
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    /// Runs one session: streams `inputs` under `key` and waits for the
    /// worker's outputs.
    ///
    /// Inputs are sent in lockstep, [`CHUNK_SIZE`] records at a time, up to
    /// the shortest input.
    pub fn apply(&self, key: &str, inputs: &[Data]) -> Result<Outputs, BridgeError> {
        let cond = {
            let mut state = self.shared.state.lock();
            if let Some(e) = &state.error {
                return Err(e.clone());
            }
            if state.pending.contains_key(key) {
                return Err(BridgeError::DuplicateSession(key.to_string()));
            }

            let cond = Arc::new(Condvar::new());
            state.pending.insert(
                key.to_string(),
                Pending {
                    outputs: Outputs::new(),
                    builders: HashMap::new(),
                    done: false,
                    cond: cond.clone(),
                },
            );
            cond
        };

        let sent = self.send(key, inputs);

        let mut state = self.shared.state.lock();
        if let Err(e) = sent {
            state.pending.remove(key);
            // a dead worker shows up on both streams; report the stored failure
            return Err(state.error.clone().unwrap_or(e));
        }

        loop {
            if let Some(e) = &state.error {
                let e = e.clone();
                state.pending.remove(key);
                return Err(e);
            }
            if state.pending.get(key).is_some_and(|p| p.done) {
                break;
            }
            cond.wait(&mut state);
        }

        let pending = state.pending.remove(key);
        Ok(pending.map(|p| p.outputs).unwrap_or_default())
    }

    fn send(&self, key: &str, inputs: &[Data]) -> Result<(), BridgeError> {
        self.write(|w| write_packet(w, &JobPacket::init(key)))?;

        let mut result = Ok(());
        for (_, length, chunk) in chunks(inputs, CHUNK_SIZE) {
            result = self.write(|w| {
                write_packet(w, &JobPacket::job(key, length))?;
                for data in &chunk {
                    self.shared.codecs.get(data.data_type()).encode(data, w)?;
                }
                Ok(())
            });
            if result.is_err() {
                break;
            }
        }

        // the worker still gets to close the session after a failed chunk
        self.write(|w| write_packet(w, &JobPacket::finish(key)))?;
        result
    }

    /// Writes and flushes one atomic unit under the send lock.
    fn write<F>(&self, f: F) -> Result<(), BridgeError>
    where
        F: FnOnce(&mut dyn Write) -> Result<(), BridgeError>,
    {
        let mut writer = self.writer.lock();
        let Some(writer) = writer.as_mut() else {
            return Err(BridgeError::Closed);
        };
        f(writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Shuts the bridge down: fails every session with
    /// [`BridgeError::Closed`], closes the worker's input and waits for the
    /// worker and the reader thread to finish. Calling it again is harmless.
    ///
    /// A spawned worker may leave its output open in a process it started.
    /// The reader is then left to finish on its own once the worker is gone.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.error = Some(BridgeError::Closed);
            for pending in state.pending.values() {
                pending.cond.notify_all();
            }
        }

        if let Some(mut writer) = self.writer.lock().take() {
            let _ = writer.flush();
        }

        let spawned = match self.child.lock().take() {
            Some(mut child) => {
                match child.wait() {
                    Ok(status) if !status.success() => tracing::warn!("worker exited with {status}"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("couldn't wait for worker: {e}"),
                }
                true
            }
            None => false,
        };

        if let Some(handle) = self.reader.lock().take() {
            if spawned && !handle.is_finished() {
                tracing::debug!("worker output still held open, detaching the reader");
            } else if handle.join().is_err() {
                tracing::error!("bridge reader panicked");
            }
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(shared: &Shared, mut reader: impl Read) {
    let error = loop {
        match read_response(shared, &mut reader) {
            Ok(true) => {}
            Ok(false) => break BridgeError::Disconnected,
            Err(e) => break e,
        }
    };

    tracing::debug!("bridge reader stopped: {error}");
    shared.fail(error);
}

/// Handles one inbound packet. Returns `false` once the worker has closed
/// its output.
fn read_response(shared: &Shared, reader: &mut dyn Read) -> Result<bool, BridgeError> {
    let Some(packet) = read_packet::<ResponsePacket>(reader)? else {
        return Ok(false);
    };

    match packet.kind {
        ResponseType::DataData => {
            let chunk = shared
                .output_types
                .iter()
                .map(|t| shared.codecs.get(t).decode(t, reader))
                .collect::<io::Result<Vec<_>>>()?;

            let mut state = shared.state.lock();
            let pending = session(&mut state, &packet.key)?;
            let builders = pending
                .builders
                .entry(packet.output_key)
                .or_insert_with(|| shared.builders());
            for (builder, data) in builders.iter_mut().zip(chunk) {
                builder.write(data);
            }
        }
        ResponseType::DataFinish => {
            let mut state = shared.state.lock();
            let pending = session(&mut state, &packet.key)?;
            let builders = pending
                .builders
                .remove(&packet.output_key)
                .unwrap_or_else(|| shared.builders());
            let data = builders.into_iter().map(DataBuilder::finish).collect();
            pending.outputs.insert(packet.output_key, data);
        }
        ResponseType::Finish => {
            let mut state = shared.state.lock();
            let pending = session(&mut state, &packet.key)?;
            pending.done = true;
            pending.cond.notify_all();
        }
    }

    Ok(true)
}

fn session<'a>(state: &'a mut State, key: &str) -> Result<&'a mut Pending, BridgeError> {
    state
        .pending
        .get_mut(key)
        .ok_or_else(|| BridgeError::UnknownSession(key.to_string()))
}

/// How to start a worker process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: Utf8PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// An operator whose tasks are applied by an external worker process.
///
/// Each run spawns one worker. The node's configuration is passed to it in
/// the handshake, and every output the worker returns for a task is written
/// to the output datasets under the output's own key.
#[derive(Clone, Debug)]
pub struct SubprocessOperator {
    command: WorkerCommand,
    parallelism: usize,
}

impl SubprocessOperator {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            parallelism: crate::utils::default_parallelism(),
        }
    }

    /// Number of sessions kept in flight at once.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }
}

impl Operator for SubprocessOperator {
    fn prepare(&self, ctx: &PrepareContext<'_>) -> anyhow::Result<Box<dyn ExecOp>> {
        let meta = MetaPacket {
            input_types: ctx.input_types.to_vec(),
            output_types: ctx.outputs.iter().map(|ds| ds.data_type.clone()).collect(),
            config: ctx.node.config.clone(),
        };

        let bridge = Bridge::spawn(&self.command, &meta, ctx.codecs.clone())?;
        Ok(Box::new(SubprocessOp::new(
            bridge,
            ctx.node,
            ctx.outputs,
            ctx.storage.clone(),
            self.parallelism,
        )))
    }
}

/// A running [`SubprocessOperator`].
pub struct SubprocessOp {
    bridge: Bridge,
    /// Role and per-role index of every parent, in parent order.
    slots: Vec<(String, usize)>,
    outputs: Vec<Dataset>,
    storage: Arc<dyn Storage>,
    parallelism: usize,
}

impl SubprocessOp {
    fn new(
        bridge: Bridge,
        node: &ExecNode,
        outputs: &[Dataset],
        storage: Arc<dyn Storage>,
        parallelism: usize,
    ) -> Self {
        Self {
            bridge,
            slots: node
                .parent_slots()
                .into_iter()
                .map(|(role, index)| (role.to_string(), index))
                .collect(),
            outputs: outputs.to_vec(),
            storage,
            parallelism,
        }
    }

    fn load_inputs(&self, task: &Task) -> Result<Vec<Data>, BridgeError> {
        let mut inputs = Vec::new();
        for (role, index) in &self.slots {
            let items = task.items.get(role).and_then(|datasets| datasets.get(*index));
            for item in items.into_iter().flatten() {
                inputs.push(self.storage.load_data(item)?);
            }
        }
        Ok(inputs)
    }
}

impl ExecOp for SubprocessOp {
    fn parallelism(&self) -> usize {
        self.parallelism
    }

    fn apply(&self, task: &Task) -> anyhow::Result<()> {
        let inputs = self.load_inputs(task)?;
        let outputs = self.bridge.apply(&task.key, &inputs)?;

        for (key, datas) in &outputs {
            for (dataset, data) in self.outputs.iter().zip(datas) {
                self.storage.write_item(dataset.id, key, data)?;
            }
        }

        Ok(())
    }

    fn close(&self) {
        self.bridge.close();
    }
}
