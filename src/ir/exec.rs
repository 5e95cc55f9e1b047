//! Executes emitted modules against the runtime collaborator.
//!
//! Entry points are interpreted on whatever thread calls them — including
//! trigger queue threads and chain worker threads — so the emitted code's
//! concurrency behavior is real, not simulated. External symbols (node class
//! and type module entry points) resolve through a symbol table of native
//! functions, which get a narrow API surface back into the executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::ir::types::{
    BinOp, Callee, Const, Function, FunctionBody, GlobalValue, Instr, Module, Operand, RtOp,
};
use crate::runtime::dispatch::DispatchGroup;
use crate::runtime::heap::Heap;
use crate::runtime::telemetry::TelemetryEvent;
use crate::runtime::{
    CompositionState, NodeContext, NodeMetadataEntry, PortContext, PortMetadata, RuntimeState,
};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("unknown global '{0}'")]
    UnknownGlobal(String),
    #[error("wrong argument count calling '{0}'")]
    Arity(String),
    #[error("type mismatch in {0}")]
    TypeMismatch(&'static str),
    #[error("{0}")]
    Runtime(String),
}

/// A run-time value.
#[derive(Clone)]
pub enum Value {
    Void,
    Bool(bool),
    Uint(u64),
    Str(Arc<str>),
    StrList(Arc<Vec<String>>),
    UintList(Arc<Vec<u64>>),
    Func(Arc<str>),
    Null,
    State(Arc<CompositionState>),
    Ctx(Arc<NodeContext>),
    Group(DispatchGroup),
    Ptr(Ptr),
    Tuple(Arc<Vec<Value>>),
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Void => write!(f, "void"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Uint(u) => write!(f, "{u}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::StrList(l) => write!(f, "{l:?}"),
            Value::UintList(l) => write!(f, "{l:?}"),
            Value::Func(s) => write!(f, "fn {s}"),
            Value::Null => write!(f, "null"),
            Value::State(s) => write!(f, "state {}", s.identifier),
            Value::Ctx(_) => write!(f, "ctx"),
            Value::Group(_) => write!(f, "group"),
            Value::Ptr(_) => write!(f, "ptr"),
            Value::Tuple(t) => write!(f, "tuple[{}]", t.len()),
        }
    }
}

/// A pointer value: a scratch buffer, a port's data slot, or a node's
/// instance data slot.
#[derive(Clone)]
pub enum Ptr {
    Heap(Arc<Mutex<Vec<u8>>>),
    PortData { ctx: Arc<NodeContext>, port: usize },
    InstanceData(Arc<NodeContext>),
}

impl Ptr {
    pub fn scratch(size: usize) -> Ptr {
        Ptr::Heap(Arc::new(Mutex::new(vec![0; size])))
    }

    fn with_bytes<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> Result<R, ExecError> {
        match self {
            Ptr::Heap(buf) => Ok(f(&mut buf.lock())),
            Ptr::PortData { ctx, port } => {
                let port = ctx.port(*port);
                let mut data = port.data.lock();
                Ok(f(&mut data))
            }
            Ptr::InstanceData(ctx) => {
                let mut slot = ctx.instance_data.lock();
                match slot.as_mut() {
                    Some(bytes) => Ok(f(bytes)),
                    None => Err(ExecError::Runtime("node has no instance data".into())),
                }
            }
        }
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, ExecError> {
        self.with_bytes(|bytes| {
            let end = (offset + len).min(bytes.len());
            let mut out = bytes.get(offset..end).unwrap_or(&[]).to_vec();
            out.resize(len, 0);
            out
        })
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), ExecError> {
        self.with_bytes(|bytes| {
            if bytes.len() < offset + data.len() {
                bytes.resize(offset + data.len(), 0);
            }
            bytes[offset..offset + data.len()].copy_from_slice(data);
        })
    }

    pub fn load_word(&self, offset: usize) -> Result<u64, ExecError> {
        let bytes = self.read(offset, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    pub fn store_word(&self, offset: usize, value: u64) -> Result<(), ExecError> {
        self.write(offset, &value.to_le_bytes())
    }
}

impl Value {
    pub fn as_bool(&self) -> Result<bool, ExecError> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => Err(ExecError::TypeMismatch("bool")),
        }
    }

    pub fn as_uint(&self) -> Result<u64, ExecError> {
        match self {
            Value::Uint(u) => Ok(*u),
            _ => Err(ExecError::TypeMismatch("uint")),
        }
    }

    pub fn as_str(&self) -> Result<&str, ExecError> {
        match self {
            Value::Str(s) => Ok(s),
            _ => Err(ExecError::TypeMismatch("string")),
        }
    }

    pub fn as_opt_str(&self) -> Result<Option<&str>, ExecError> {
        match self {
            Value::Str(s) => Ok(Some(s)),
            Value::Null => Ok(None),
            _ => Err(ExecError::TypeMismatch("string or null")),
        }
    }

    pub fn as_state(&self) -> Result<&Arc<CompositionState>, ExecError> {
        match self {
            Value::State(s) => Ok(s),
            _ => Err(ExecError::TypeMismatch("composition state")),
        }
    }

    pub fn as_ctx(&self) -> Result<&Arc<NodeContext>, ExecError> {
        match self {
            Value::Ctx(c) => Ok(c),
            _ => Err(ExecError::TypeMismatch("node context")),
        }
    }

    pub fn as_group(&self) -> Result<&DispatchGroup, ExecError> {
        match self {
            Value::Group(g) => Ok(g),
            _ => Err(ExecError::TypeMismatch("dispatch group")),
        }
    }

    pub fn as_ptr(&self) -> Result<&Ptr, ExecError> {
        match self {
            Value::Ptr(p) => Ok(p),
            _ => Err(ExecError::TypeMismatch("pointer")),
        }
    }

    pub fn as_tuple(&self) -> Result<&Arc<Vec<Value>>, ExecError> {
        match self {
            Value::Tuple(t) => Ok(t),
            _ => Err(ExecError::TypeMismatch("tuple")),
        }
    }

    pub fn as_func(&self) -> Result<&str, ExecError> {
        match self {
            Value::Func(s) => Ok(s),
            _ => Err(ExecError::TypeMismatch("function value")),
        }
    }

    pub fn as_uint_list(&self) -> Result<&Arc<Vec<u64>>, ExecError> {
        match self {
            Value::UintList(l) => Ok(l),
            _ => Err(ExecError::TypeMismatch("uint list")),
        }
    }
}

/// A native implementation of an external symbol.
pub type ExternalFn =
    Arc<dyn Fn(&RuntimeApi<'_>, &[Value]) -> Result<Value, ExecError> + Send + Sync>;

/// Resolves the entry points of node class and type modules.
#[derive(Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, ExternalFn>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable { symbols: HashMap::new() }
    }

    pub fn register<F>(&mut self, symbol: &str, function: F)
    where
        F: Fn(&RuntimeApi<'_>, &[Value]) -> Result<Value, ExecError> + Send + Sync + 'static,
    {
        self.symbols.insert(symbol.to_string(), Arc::new(function));
    }

    pub fn get(&self, symbol: &str) -> Option<&ExternalFn> {
        self.symbols.get(symbol)
    }
}

/// The narrow surface external functions get back into the executor.
pub struct RuntimeApi<'a> {
    executor: &'a Executor,
}

impl RuntimeApi<'_> {
    pub fn runtime(&self) -> &Arc<RuntimeState> {
        &self.executor.env.runtime
    }

    pub fn heap(&self) -> &Heap {
        &self.executor.env.runtime.heap
    }

    /// Invoke a function value (e.g. a trigger scheduler passed as an
    /// argument) or any other symbol.
    pub fn call(&self, target: &Value, args: Vec<Value>) -> Result<Value, ExecError> {
        match target {
            Value::Func(symbol) => self.executor.call(symbol, args),
            Value::Null => Err(ExecError::Runtime("call through null function".into())),
            _ => Err(ExecError::TypeMismatch("function value")),
        }
    }

    pub fn call_symbol(&self, symbol: &str, args: Vec<Value>) -> Result<Value, ExecError> {
        self.executor.call(symbol, args)
    }
}

struct ExecEnv {
    modules: Vec<Arc<Module>>,
    function_modules: HashMap<String, usize>,
    externals: SymbolTable,
    runtime: Arc<RuntimeState>,
}

/// Interprets module functions. Cheap to clone; jobs scheduled onto queues
/// and chain workers carry a clone.
#[derive(Clone)]
pub struct Executor {
    env: Arc<ExecEnv>,
}

enum Flow {
    Normal,
    Return(Value),
}

impl Executor {
    pub fn new(
        modules: Vec<Arc<Module>>,
        externals: SymbolTable,
        runtime: Arc<RuntimeState>,
    ) -> Self {
        let mut function_modules = HashMap::new();
        for (index, module) in modules.iter().enumerate() {
            for name in module.functions.keys() {
                if function_modules.insert(name.clone(), index).is_some() {
                    log::warn!("duplicate function symbol '{name}' across linked modules");
                }
            }
        }
        Executor {
            env: Arc::new(ExecEnv { modules, function_modules, externals, runtime }),
        }
    }

    pub fn runtime(&self) -> &Arc<RuntimeState> {
        &self.env.runtime
    }

    /// Call a function by symbol: module functions first, then externals.
    pub fn call(&self, symbol: &str, args: Vec<Value>) -> Result<Value, ExecError> {
        if let Some(module_index) = self.env.function_modules.get(symbol) {
            let module = self.env.modules[*module_index].clone();
            let function = module.function(symbol).expect("indexed function");
            match &function.body {
                FunctionBody::Ir { .. } => return self.run_function(&module, function, args),
                FunctionBody::External => {}
            }
        }
        match self.env.externals.get(symbol) {
            Some(external) => {
                let external = external.clone();
                let api = RuntimeApi { executor: self };
                external(&api, &args)
            }
            None => Err(ExecError::UnknownFunction(symbol.to_string())),
        }
    }

    fn run_function(
        &self,
        module: &Module,
        function: &Function,
        args: Vec<Value>,
    ) -> Result<Value, ExecError> {
        if args.len() != function.param_count as usize {
            return Err(ExecError::Arity(function.name.clone()));
        }
        let mut regs = vec![Value::Void; (function.reg_count as usize).max(args.len())];
        regs[..args.len()].clone_from_slice(&args);
        let FunctionBody::Ir { instrs } = &function.body else {
            return Err(ExecError::UnknownFunction(function.name.clone()));
        };
        match self.run_body(module, &mut regs, instrs)? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::Void),
        }
    }

    fn run_body(
        &self,
        module: &Module,
        regs: &mut Vec<Value>,
        instrs: &[Instr],
    ) -> Result<Flow, ExecError> {
        for instr in instrs {
            match instr {
                Instr::Set { dst, src } => {
                    let value = self.eval(module, regs, src)?;
                    Self::store(regs, *dst, value);
                }
                Instr::Bin { dst, op, lhs, rhs } => {
                    let lhs = self.eval(module, regs, lhs)?;
                    let rhs = self.eval(module, regs, rhs)?;
                    Self::store(regs, *dst, Self::binary(*op, &lhs, &rhs)?);
                }
                Instr::Not { dst, src } => {
                    let value = self.eval(module, regs, src)?.as_bool()?;
                    Self::store(regs, *dst, Value::Bool(!value));
                }
                Instr::Call { dst, callee, args } => {
                    let args = self.eval_all(module, regs, args)?;
                    let symbol = match callee {
                        Callee::Named { symbol } => symbol.clone(),
                        Callee::Indirect { target } => {
                            let value = self.eval(module, regs, target)?;
                            value.as_func()?.to_string()
                        }
                    };
                    let result = self.call(&symbol, args)?;
                    if let Some(dst) = dst {
                        Self::store(regs, *dst, result);
                    }
                }
                Instr::Rt { dst, op, args } => {
                    let args = self.eval_all(module, regs, args)?;
                    let result = self.run_rt(*op, &args)?;
                    if let Some(dst) = dst {
                        Self::store(regs, *dst, result);
                    }
                }
                Instr::If { cond, then_body, else_body } => {
                    let branch = if self.eval(module, regs, cond)?.as_bool()? {
                        then_body
                    } else {
                        else_body
                    };
                    if let Flow::Return(value) = self.run_body(module, regs, branch)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Instr::While { header, cond, body } => loop {
                    if let Flow::Return(value) = self.run_body(module, regs, header)? {
                        return Ok(Flow::Return(value));
                    }
                    if !self.eval(module, regs, cond)?.as_bool()? {
                        break;
                    }
                    if let Flow::Return(value) = self.run_body(module, regs, body)? {
                        return Ok(Flow::Return(value));
                    }
                },
                Instr::Return { value } => {
                    let value = match value {
                        Some(operand) => self.eval(module, regs, operand)?,
                        None => Value::Void,
                    };
                    return Ok(Flow::Return(value));
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn store(regs: &mut Vec<Value>, dst: u32, value: Value) {
        let index = dst as usize;
        if regs.len() <= index {
            regs.resize(index + 1, Value::Void);
        }
        regs[index] = value;
    }

    fn eval(
        &self,
        module: &Module,
        regs: &[Value],
        operand: &Operand,
    ) -> Result<Value, ExecError> {
        match operand {
            Operand::Reg { reg } => Ok(regs
                .get(*reg as usize)
                .cloned()
                .unwrap_or(Value::Void)),
            Operand::Imm { value } => Ok(Self::constant(value)),
            Operand::Global { name } => match module.globals.get(name) {
                Some(GlobalValue::Str { value }) => Ok(Value::Str(Arc::from(value.as_str()))),
                Some(GlobalValue::Json { value }) => Ok(Value::Str(Arc::from(value.as_str()))),
                Some(GlobalValue::StrList { values }) => {
                    Ok(Value::StrList(Arc::new(values.clone())))
                }
                Some(GlobalValue::UintList { values }) => {
                    Ok(Value::UintList(Arc::new(values.clone())))
                }
                None => Err(ExecError::UnknownGlobal(name.clone())),
            },
        }
    }

    fn eval_all(
        &self,
        module: &Module,
        regs: &[Value],
        operands: &[Operand],
    ) -> Result<Vec<Value>, ExecError> {
        operands.iter().map(|o| self.eval(module, regs, o)).collect()
    }

    fn constant(value: &Const) -> Value {
        match value {
            Const::Bool { value } => Value::Bool(*value),
            Const::Uint { value } => Value::Uint(*value),
            Const::Str { value } => Value::Str(Arc::from(value.as_str())),
            Const::StrList { values } => Value::StrList(Arc::new(values.clone())),
            Const::UintList { values } => Value::UintList(Arc::new(values.clone())),
            Const::Func { symbol } => Value::Func(Arc::from(symbol.as_str())),
            Const::Null => Value::Null,
        }
    }

    fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, ExecError> {
        let result = match op {
            BinOp::Eq => Value::Bool(Self::values_equal(lhs, rhs)),
            BinOp::Ne => Value::Bool(!Self::values_equal(lhs, rhs)),
            BinOp::Lt => Value::Bool(lhs.as_uint()? < rhs.as_uint()?),
            BinOp::Add => Value::Uint(lhs.as_uint()?.wrapping_add(rhs.as_uint()?)),
            BinOp::Or => Value::Bool(lhs.as_bool()? || rhs.as_bool()?),
            BinOp::And => Value::Bool(lhs.as_bool()? && rhs.as_bool()?),
            BinOp::Concat => {
                let mut out = lhs.as_str()?.to_string();
                out.push_str(rhs.as_str()?);
                Value::Str(Arc::from(out.as_str()))
            }
        };
        Ok(result)
    }

    fn values_equal(lhs: &Value, rhs: &Value) -> bool {
        match (lhs, rhs) {
            (Value::Uint(a), Value::Uint(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Null, Value::Null) => true,
            _ => false,
        }
    }

    fn run_rt(&self, op: RtOp, args: &[Value]) -> Result<Value, ExecError> {
        let runtime = &self.env.runtime;
        let value = match op {
            RtOp::CreateCompositionState => {
                let identifier = args[0].as_str()?;
                Value::State(Arc::new(CompositionState::new(runtime.clone(), identifier)))
            }
            RtOp::GetStateIdentifier => {
                Value::Str(Arc::from(args[0].as_state()?.identifier.as_str()))
            }
            RtOp::IsPaused => Value::Bool(runtime.is_paused()),
            RtOp::GetNextEventId => Value::Uint(runtime.next_event_id()),
            RtOp::GetNodeContext => {
                let state = args[0].as_state()?;
                let index = args[1].as_uint()?;
                match runtime.node_context(&state.identifier, index) {
                    Some(ctx) => Value::Ctx(ctx),
                    None => {
                        return Err(ExecError::Runtime(format!(
                            "no context for node {index} of '{}'",
                            state.identifier
                        )));
                    }
                }
            }
            RtOp::GetCompositionContext => {
                let state = args[0].as_state()?;
                match runtime.composition_context(&state.identifier) {
                    Some(ctx) => Value::Ctx(ctx),
                    None => {
                        return Err(ExecError::Runtime(format!(
                            "no composition context for '{}'",
                            state.identifier
                        )));
                    }
                }
            }
            RtOp::AddStateToThreadLocal => {
                RuntimeState::push_thread_state(args[0].as_state()?.clone());
                Value::Void
            }
            RtOp::RemoveStateFromThreadLocal => {
                RuntimeState::pop_thread_state();
                Value::Void
            }
            RtOp::StartedExecutingEvent => {
                args[0].as_ctx()?.started_executing_event(args[1].as_uint()?);
                Value::Void
            }
            RtOp::SpunOffExecutingEvent => {
                args[0].as_ctx()?.spun_off_executing_event(args[1].as_uint()?);
                Value::Void
            }
            RtOp::FinishedExecutingEvent => {
                Value::Bool(args[0].as_ctx()?.finished_executing_event(args[1].as_uint()?))
            }
            RtOp::GetOneExecutingEvent => Value::Uint(args[0].as_ctx()?.one_executing_event()),
            RtOp::AddNodeMetadata => {
                let state = args[0].as_state()?;
                runtime.add_node_metadata(
                    &state.identifier,
                    NodeMetadataEntry {
                        identifier: args[1].as_str()?.to_string(),
                        create_context: args[2].as_func()?.to_string(),
                        set_value: args[3].as_func()?.to_string(),
                        get_value: args[4].as_func()?.to_string(),
                        fire_event: args[5].as_func()?.to_string(),
                        release_data: args[6].as_func()?.to_string(),
                        ports: Vec::new(),
                    },
                );
                Value::Void
            }
            RtOp::AddPortMetadata => {
                let state = args[0].as_state()?;
                runtime.add_port_metadata(
                    &state.identifier,
                    PortMetadata {
                        identifier: args[1].as_str()?.to_string(),
                        name: args[2].as_str()?.to_string(),
                        type_index: args[3].as_uint()?,
                        initial_value: args[4].as_str()?.to_string(),
                    },
                );
                Value::Void
            }
            RtOp::InitContextForTopLevelComposition => {
                let state = args[0].as_state()?;
                let stateful = args[1].as_bool()?;
                let published_output_count = args[2].as_uint()? as usize;
                runtime.set_top_level_context(Arc::new(NodeContext::new(
                    stateful,
                    published_output_count,
                )));
                let entries = runtime.metadata_entries();
                for (scope, index, entry) in &entries {
                    let context =
                        self.call(&entry.create_context, vec![Value::Uint(*index)])?;
                    let context = context.as_ctx()?.clone();
                    runtime.register_node_context(scope, *index, &entry.identifier, context);
                }
                // Initialize each data port to its registered initial value
                // through the composition's own set-value entry point.
                for (scope, _, entry) in &entries {
                    let scope_state = Value::State(Arc::new(CompositionState::new(
                        runtime.clone(),
                        scope,
                    )));
                    for port in &entry.ports {
                        if port.type_index == u64::MAX || port.initial_value.is_empty() {
                            continue;
                        }
                        self.call(
                            &entry.set_value,
                            vec![
                                scope_state.clone(),
                                Value::Str(Arc::from(port.identifier.as_str())),
                                Value::Str(Arc::from(port.initial_value.as_str())),
                                Value::Bool(false),
                            ],
                        )?;
                    }
                }
                let _ = state;
                Value::Void
            }
            RtOp::FiniContextForTopLevelComposition => {
                runtime.fini_contexts();
                Value::Void
            }
            RtOp::IsNodeBeingAddedOrReplaced => {
                Value::Bool(runtime.is_node_being_added_or_replaced(args[1].as_str()?))
            }
            RtOp::IsNodeBeingRemovedOrReplaced => {
                Value::Bool(runtime.is_node_being_removed_or_replaced(args[1].as_str()?))
            }
            RtOp::NewNodeContext => {
                let has_instance_data = args[0].as_bool()?;
                let output_event_count = args[1].as_uint()? as usize;
                Value::Ctx(Arc::new(NodeContext::new(has_instance_data, output_event_count)))
            }
            RtOp::AddPortContext => {
                let ctx = args[0].as_ctx()?;
                let is_trigger = args[1].as_bool()?;
                let data_size = args[2].as_uint()? as usize;
                let queue_name = args[3].as_opt_str()?;
                let can_drop = args[4].as_bool()?;
                ctx.add_port(PortContext::new(is_trigger, data_size, queue_name, can_drop));
                Value::Void
            }
            RtOp::SetPortEvent => {
                let port = args[0].as_ctx()?.port(args[1].as_uint()? as usize);
                *port.event.lock() = args[2].as_bool()?;
                Value::Void
            }
            RtOp::GetPortEvent => {
                let port = args[0].as_ctx()?.port(args[1].as_uint()? as usize);
                let value = *port.event.lock();
                Value::Bool(value)
            }
            RtOp::GetPortDataPtr => Value::Ptr(Ptr::PortData {
                ctx: args[0].as_ctx()?.clone(),
                port: args[1].as_uint()? as usize,
            }),
            RtOp::SetPortTriggerFunction => {
                let port = args[0].as_ctx()?.port(args[1].as_uint()? as usize);
                *port.trigger_function.lock() = Some(args[2].as_func()?.to_string());
                Value::Void
            }
            RtOp::GetPortTriggerFunction => {
                let port = args[0].as_ctx()?.port(args[1].as_uint()? as usize);
                let function = port.trigger_function.lock().clone();
                match function {
                    Some(symbol) => Value::Func(Arc::from(symbol.as_str())),
                    None => Value::Null,
                }
            }
            RtOp::TriggerTryClaimSemaphore => {
                let port = args[0].as_ctx()?.port(args[1].as_uint()? as usize);
                match &port.trigger_semaphore {
                    Some(semaphore) => Value::Bool(semaphore.try_wait_for(Duration::ZERO)),
                    None => Value::Bool(true),
                }
            }
            RtOp::TriggerSignalSemaphore => {
                let port = args[0].as_ctx()?.port(args[1].as_uint()? as usize);
                if let Some(semaphore) = &port.trigger_semaphore {
                    semaphore.signal();
                }
                Value::Void
            }
            RtOp::GetInstanceDataPtr => {
                Value::Ptr(Ptr::InstanceData(args[0].as_ctx()?.clone()))
            }
            RtOp::GetClaimingEventId => Value::Uint(
                args[0]
                    .as_ctx()?
                    .claiming_event_id
                    .load(std::sync::atomic::Ordering::SeqCst),
            ),
            RtOp::SetClaimingEventId => {
                args[0]
                    .as_ctx()?
                    .claiming_event_id
                    .store(args[1].as_uint()?, std::sync::atomic::Ordering::SeqCst);
                Value::Void
            }
            RtOp::NodeSemaphoreWait => {
                args[0].as_ctx()?.semaphore.wait();
                Value::Void
            }
            RtOp::NodeSemaphoreTryWaitMs => {
                let timeout = Duration::from_millis(args[1].as_uint()?);
                Value::Bool(args[0].as_ctx()?.semaphore.try_wait_for(timeout))
            }
            RtOp::NodeSemaphoreSignal => {
                args[0].as_ctx()?.semaphore.signal();
                Value::Void
            }
            RtOp::GetExecutingGroup => Value::Group(args[0].as_ctx()?.executing_group.clone()),
            RtOp::SetOutputEvent => {
                let ctx = args[0].as_ctx()?;
                let index = args[1].as_uint()? as usize;
                let mut events = ctx.output_events.lock();
                if index < events.len() {
                    events[index] = args[2].as_bool()?;
                }
                Value::Void
            }
            RtOp::GetOutputEvent => {
                let ctx = args[0].as_ctx()?;
                let index = args[1].as_uint()? as usize;
                let events = ctx.output_events.lock();
                Value::Bool(events.get(index).copied().unwrap_or(false))
            }
            RtOp::EnterGroup => {
                args[0].as_group()?.enter();
                Value::Void
            }
            RtOp::LeaveGroup => {
                args[0].as_group()?.leave();
                Value::Void
            }
            RtOp::WaitGroup => {
                args[0].as_group()?.wait();
                Value::Void
            }
            RtOp::GetTriggerWorkersScheduled => {
                let _ = args[0].as_state()?;
                Value::Group(runtime.trigger_workers_scheduled())
            }
            RtOp::Alloc => Value::Ptr(Ptr::scratch(args[0].as_uint()? as usize)),
            RtOp::Free => Value::Void,
            RtOp::CopyBytes => {
                let size = args[2].as_uint()? as usize;
                let bytes = args[1].as_ptr()?.read(0, size)?;
                args[0].as_ptr()?.write(0, &bytes)?;
                Value::Void
            }
            RtOp::LoadWord => {
                Value::Uint(args[0].as_ptr()?.load_word(args[1].as_uint()? as usize)?)
            }
            RtOp::StoreWord => {
                args[0]
                    .as_ptr()?
                    .store_word(args[1].as_uint()? as usize, args[2].as_uint()?)?;
                Value::Void
            }
            RtOp::Retain => {
                runtime.heap.retain(args[0].as_ptr()?.load_word(0)?);
                Value::Void
            }
            RtOp::Release => {
                runtime.heap.release(args[0].as_ptr()?.load_word(0)?);
                Value::Void
            }
            RtOp::MakeTuple => Value::Tuple(Arc::new(args.to_vec())),
            RtOp::TupleGet => {
                let index = args[1].as_uint()? as usize;
                match &args[0] {
                    Value::Tuple(tuple) => tuple.get(index).cloned().ok_or_else(|| {
                        ExecError::Runtime(format!("tuple index {index} out of range"))
                    })?,
                    Value::StrList(list) => list
                        .get(index)
                        .map(|s| Value::Str(Arc::from(s.as_str())))
                        .ok_or_else(|| {
                            ExecError::Runtime(format!("list index {index} out of range"))
                        })?,
                    Value::UintList(list) => list.get(index).map(|u| Value::Uint(*u)).ok_or_else(
                        || ExecError::Runtime(format!("list index {index} out of range")),
                    )?,
                    _ => return Err(ExecError::TypeMismatch("tuple or list")),
                }
            }
            RtOp::ScheduleTriggerWorker => {
                let state = args[0].as_state()?;
                let ctx = args[1].as_ctx()?;
                let port_index = args[2].as_uint()? as usize;
                let worker = args[3].as_func()?.to_string();
                let context = args[4].clone();
                let event_id = args[7].as_uint()?;
                let chain_count = args[8].as_uint()?;
                let key = (state.identifier.clone(), event_id);
                runtime.thread_manager.register_trigger_event(key, chain_count);
                let port = ctx.port(port_index);
                let Some(queue) = port.trigger_queue.clone() else {
                    return Err(ExecError::Runtime("port has no trigger queue".into()));
                };
                let executor = self.clone();
                queue.dispatch_async(Box::new(move || {
                    if let Err(error) = executor.call(&worker, vec![context]) {
                        log::error!("trigger worker failed: {error}");
                    }
                }));
                Value::Void
            }
            RtOp::SubmitToTriggerQueueSync => {
                let ctx = args[0].as_ctx()?;
                let port_index = args[1].as_uint()? as usize;
                let worker = args[2].as_func()?.to_string();
                let context = args[3].clone();
                let port = ctx.port(port_index);
                let Some(queue) = port.trigger_queue.clone() else {
                    return Err(ExecError::Runtime("port has no trigger queue".into()));
                };
                let executor = self.clone();
                queue.dispatch_sync(Box::new(move || {
                    if let Err(error) = executor.call(&worker, vec![context]) {
                        log::error!("queue worker failed: {error}");
                    }
                }));
                Value::Void
            }
            RtOp::ScheduleChainWorker => {
                let state = args[0].as_state()?;
                let worker = args[1].as_func()?.to_string();
                let context = args[2].clone();
                let event_id = args[3].as_uint()?;
                let chain_index = args[4].as_uint()?;
                let upstream = args[5].as_uint_list()?.as_ref().clone();
                let key = (state.identifier.clone(), event_id);
                let executor = self.clone();
                runtime.thread_manager.schedule_chain_worker(
                    key,
                    chain_index,
                    upstream,
                    Box::new(move || {
                        if let Err(error) = executor.call(&worker, vec![context]) {
                            log::error!("chain worker failed: {error}");
                        }
                    }),
                );
                Value::Void
            }
            RtOp::GrantThreadsToChain => {
                let state = args[0].as_state()?;
                let key = (state.identifier.clone(), args[1].as_uint()?);
                runtime.thread_manager.grant_threads_to_chain(key, args[2].as_uint()?);
                Value::Void
            }
            RtOp::GrantThreadsToSubcomposition => {
                let state = args[0].as_state()?;
                let key = (state.identifier.clone(), args[1].as_uint()?);
                runtime
                    .thread_manager
                    .grant_threads_to_subcomposition(key, args[3].as_str()?);
                Value::Void
            }
            RtOp::ReturnThreadsForTriggerWorker => {
                let state = args[0].as_state()?;
                let key = (state.identifier.clone(), args[1].as_uint()?);
                runtime.thread_manager.return_threads_for_trigger_worker(key);
                Value::Void
            }
            RtOp::ReturnThreadsForChainWorker => {
                let state = args[0].as_state()?;
                let key = (state.identifier.clone(), args[1].as_uint()?);
                runtime
                    .thread_manager
                    .return_threads_for_chain_worker(key, args[2].as_uint()?);
                Value::Void
            }
            RtOp::SendNodeExecutionStarted => {
                self.send_telemetry(&args[0], |composition| TelemetryEvent::NodeExecutionStarted {
                    composition,
                    node: args[1].as_str().unwrap_or_default().to_string(),
                })?;
                Value::Void
            }
            RtOp::SendNodeExecutionFinished => {
                self.send_telemetry(&args[0], |composition| {
                    TelemetryEvent::NodeExecutionFinished {
                        composition,
                        node: args[1].as_str().unwrap_or_default().to_string(),
                    }
                })?;
                Value::Void
            }
            RtOp::SendInputPortsUpdated => {
                let summary = args[4].as_opt_str()?.map(str::to_string);
                self.send_telemetry(&args[0], |composition| TelemetryEvent::InputPortsUpdated {
                    composition,
                    port: args[1].as_str().unwrap_or_default().to_string(),
                    received_event: args[2].as_bool().unwrap_or(false),
                    received_data: args[3].as_bool().unwrap_or(false),
                    summary,
                })?;
                Value::Void
            }
            RtOp::SendOutputPortsUpdated => {
                let summary = args[4].as_opt_str()?.map(str::to_string);
                self.send_telemetry(&args[0], |composition| TelemetryEvent::OutputPortsUpdated {
                    composition,
                    port: args[1].as_str().unwrap_or_default().to_string(),
                    sent_event: args[2].as_bool().unwrap_or(false),
                    sent_data: args[3].as_bool().unwrap_or(false),
                    summary,
                })?;
                Value::Void
            }
            RtOp::SendPublishedOutputPortsUpdated => {
                let summary = args[3].as_opt_str()?.map(str::to_string);
                self.send_telemetry(&args[0], |composition| {
                    TelemetryEvent::PublishedOutputPortsUpdated {
                        composition,
                        port: args[1].as_str().unwrap_or_default().to_string(),
                        sent_data: args[2].as_bool().unwrap_or(false),
                        summary,
                    }
                })?;
                Value::Void
            }
            RtOp::SendEventFinished => {
                self.send_telemetry(&args[0], |composition| TelemetryEvent::EventFinished {
                    composition,
                    event_id: args[1].as_uint().unwrap_or(0),
                })?;
                // Completed events stop being tracked on the composition
                // context; the started/finished pairing is what the runner's
                // event accounting observes.
                let identifier = &args[0].as_state()?.identifier;
                if let Some(ctx) = runtime.composition_context(identifier) {
                    let _ = ctx.finished_executing_event(args[1].as_uint()?);
                }
                Value::Void
            }
            RtOp::SendEventDropped => {
                self.send_telemetry(&args[0], |composition| TelemetryEvent::EventDropped {
                    composition,
                    port: args[1].as_str().unwrap_or_default().to_string(),
                })?;
                Value::Void
            }
            RtOp::ShouldSendPortDataTelemetry => {
                Value::Bool(runtime.should_send_port_data_telemetry(args[1].as_str()?))
            }
            RtOp::SendError => {
                self.send_telemetry(&args[0], |composition| TelemetryEvent::Error {
                    composition,
                    message: args[1].as_str().unwrap_or_default().to_string(),
                })?;
                Value::Void
            }
        };
        Ok(value)
    }

    fn send_telemetry(
        &self,
        state: &Value,
        build: impl FnOnce(String) -> TelemetryEvent,
    ) -> Result<(), ExecError> {
        let composition = state.as_state()?.identifier.clone();
        self.env.runtime.telemetry.send(build(composition));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::*;

    fn executor_with(instrs: Vec<Instr>, reg_count: u32) -> Executor {
        let mut module = Module::new("test");
        module.add_function(Function {
            name: "main".into(),
            param_count: 0,
            reg_count,
            annotations: vec![],
            body: FunctionBody::Ir { instrs },
        });
        Executor::new(
            vec![Arc::new(module)],
            SymbolTable::new(),
            Arc::new(RuntimeState::new()),
        )
    }

    #[test]
    fn while_loop_counts() {
        // r0 = 0; while r0 != 5 { r0 = r0 + 1 }; return r0
        let exec = executor_with(
            vec![
                Instr::Set { dst: 0, src: Operand::uint(0) },
                Instr::While {
                    header: vec![Instr::Bin {
                        dst: 1,
                        op: BinOp::Ne,
                        lhs: Operand::reg(0),
                        rhs: Operand::uint(5),
                    }],
                    cond: Operand::reg(1),
                    body: vec![Instr::Bin {
                        dst: 0,
                        op: BinOp::Add,
                        lhs: Operand::reg(0),
                        rhs: Operand::uint(1),
                    }],
                },
                Instr::Return { value: Some(Operand::reg(0)) },
            ],
            2,
        );
        let result = exec.call("main", vec![]).unwrap();
        assert_eq!(result.as_uint().unwrap(), 5);
    }

    #[test]
    fn externals_resolve_through_symbol_table() {
        let mut module = Module::new("test");
        module.add_function(Function {
            name: "main".into(),
            param_count: 0,
            reg_count: 1,
            annotations: vec![],
            body: FunctionBody::Ir {
                instrs: vec![
                    Instr::Call {
                        dst: Some(0),
                        callee: Callee::Named { symbol: "answer".into() },
                        args: vec![],
                    },
                    Instr::Return { value: Some(Operand::reg(0)) },
                ],
            },
        });
        let mut externals = SymbolTable::new();
        externals.register("answer", |_, _| Ok(Value::Uint(42)));
        let exec = Executor::new(
            vec![Arc::new(module)],
            externals,
            Arc::new(RuntimeState::new()),
        );
        assert_eq!(exec.call("main", vec![]).unwrap().as_uint().unwrap(), 42);
    }

    #[test]
    fn ptr_word_roundtrip() {
        let ptr = Ptr::scratch(16);
        ptr.store_word(8, 0xDEAD).unwrap();
        assert_eq!(ptr.load_word(8).unwrap(), 0xDEAD);
        assert_eq!(ptr.load_word(0).unwrap(), 0);
    }
}
