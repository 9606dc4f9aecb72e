//! Cross-runtime calls.

use core::fmt;
use core::marker::PhantomData;

use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};

use thiserror::Error;

use witness::{
    ConstOpaquePtr, OpaquePtr, MetadataHandle, MetadataRequest, MetadataResponse,
    FatalError, fatal, ptrauth,
};

use crate::abi::{AbiClass, DirectValue};
use crate::cell::OpaqueCell;
use crate::config::{Config, PointerAuthConfig};
use crate::source;

/// An argument to a cross-runtime call.
#[derive(Debug, Clone)]
pub enum Arg {
    /// A value passed in lanes.
    Direct(DirectValue),

    /// Borrowed value.
    Opaque(ConstOpaquePtr),

    /// Value mutated in place by the callee.
    InOut(OpaquePtr),

    /// Uninitialized storage for an indirectly returned value.
    Result(OpaquePtr),

    Metadata(MetadataHandle),

    Request(MetadataRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Passed directly or by borrowed pointer, depending on the value's classification.
    ///
    /// Only concrete types are classified; see `Opaque`.
    ByValue,

    /// Borrowed pointer to a value whose type is only known through metadata: `self`, and
    /// arguments of generic type.
    Opaque,

    InOut,
    Result,
    Metadata,
    Request,
}

impl Arg {
    fn matches(&self, kind: ParamKind) -> bool {
        match (self, kind) {
            (Arg::Direct(_), ParamKind::ByValue)
            | (Arg::Opaque(_), ParamKind::ByValue)
            | (Arg::Opaque(_), ParamKind::Opaque)
            | (Arg::InOut(_), ParamKind::InOut)
            | (Arg::Result(_), ParamKind::Result)
            | (Arg::Metadata(_), ParamKind::Metadata)
            | (Arg::Request(_), ParamKind::Request) => true,
            _ => false,
        }
    }
}

/// The result of a cross-runtime call.
#[derive(Debug, Clone)]
pub enum Ret {
    /// Nothing, or a value written to the call's `Result` argument.
    Void,

    Direct(DirectValue),
    Int(isize),
    Metadata(MetadataResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetKind {
    Void,

    /// `Direct`, or `Void` with the value written to the `Result` argument.
    ByValue,

    /// `Void`, with the value always written to the `Result` argument.
    Indirect,

    Int,
    Metadata,
}

impl Ret {
    fn matches(&self, kind: RetKind) -> bool {
        match (self, kind) {
            (Ret::Void, RetKind::Void)
            | (Ret::Void, RetKind::ByValue)
            | (Ret::Void, RetKind::Indirect)
            | (Ret::Direct(_), RetKind::ByValue)
            | (Ret::Int(_), RetKind::Int)
            | (Ret::Metadata(_), RetKind::Metadata) => true,
            _ => false,
        }
    }

    pub fn into_int(self) -> isize {
        match self {
            Ret::Int(i) => i,
            other => unreachable!("checked return kind: {:?}", other),
        }
    }

    pub fn into_metadata(self) -> MetadataResponse {
        match self {
            Ret::Metadata(response) => response,
            other => unreachable!("checked return kind: {:?}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub params: &'static [ParamKind],
    pub ret: RetKind,
}

/// Entry point of a function implemented by the source runtime.
pub type Entry = unsafe fn(&CallFrame) -> Ret;

#[derive(Clone, Copy)]
pub struct Function {
    pub symbol: &'static str,
    pub signature: Signature,
    pub entry: Entry,
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Function")
            .field("symbol", &self.symbol)
            .field("signature", &self.signature)
            .finish()
    }
}

/// Functions by symbol.
#[derive(Debug, Default)]
pub struct SymbolTable {
    functions: HashMap<&'static str, Function>,
}

impl SymbolTable {
    /// Registers a function.
    ///
    /// Aborts if the symbol is already taken.
    pub fn register(&mut self, function: Function) {
        if self.functions.insert(function.symbol, function).is_some() {
            fatal(FatalError::DuplicateSymbol(function.symbol.to_owned()))
        }
    }

    pub fn lookup(&self, symbol: &str) -> Option<&Function> {
        self.functions.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }
}

/// The arguments of a call, as seen by the callee.
///
/// Arguments have already been checked against the function's signature, so the accessors abort
/// only if the callee asks for something its own signature doesn't declare.
pub struct CallFrame<'a> {
    bridge: &'a Bridge,
    symbol: &'static str,
    args: &'a [Arg],
}

impl<'a> CallFrame<'a> {
    pub fn bridge(&self) -> &'a Bridge {
        self.bridge
    }

    pub fn symbol(&self) -> &'static str {
        self.symbol
    }

    fn mismatch(&self, idx: usize, expected: &str) -> ! {
        fatal(FatalError::SignatureMismatch {
            symbol: self.symbol.to_owned(),
            detail: format!("argument {} is not {}", idx, expected),
        })
    }

    /// Gets a by-value argument of type `metadata`.
    ///
    /// Directly passed values are materialized into a fresh cell.
    pub fn by_value(&self, idx: usize, metadata: MetadataHandle) -> ValueArg<'a> {
        match self.args.get(idx) {
            Some(Arg::Opaque(ptr)) => ValueArg::Borrowed(*ptr, PhantomData),
            Some(Arg::Direct(value)) => {
                let mut cell = OpaqueCell::allocate(metadata);
                unsafe { cell.initialize_with(|dst| value.store(dst)) };
                ValueArg::Materialized(cell)
            },
            _ => self.mismatch(idx, "a by-value argument"),
        }
    }

    /// Gets a borrowed pointer to a value of generic type.
    pub fn opaque(&self, idx: usize) -> ConstOpaquePtr {
        match self.args.get(idx) {
            Some(Arg::Opaque(ptr)) => *ptr,
            _ => self.mismatch(idx, "an opaque pointer"),
        }
    }

    pub fn inout(&self, idx: usize) -> OpaquePtr {
        match self.args.get(idx) {
            Some(Arg::InOut(ptr)) => *ptr,
            _ => self.mismatch(idx, "inout"),
        }
    }

    pub fn result(&self, idx: usize) -> OpaquePtr {
        match self.args.get(idx) {
            Some(Arg::Result(ptr)) => *ptr,
            _ => self.mismatch(idx, "a result buffer"),
        }
    }

    pub fn metadata(&self, idx: usize) -> MetadataHandle {
        match self.args.get(idx) {
            Some(Arg::Metadata(metadata)) => *metadata,
            _ => self.mismatch(idx, "metadata"),
        }
    }

    pub fn request(&self, idx: usize) -> MetadataRequest {
        match self.args.get(idx) {
            Some(Arg::Request(request)) => *request,
            _ => self.mismatch(idx, "a metadata request"),
        }
    }

    /// Returns a value of type `metadata` by value.
    ///
    /// `init` initializes the value; directly returned values are built in a scratch cell and
    /// returned in lanes, indirect values are built in the `Result` argument at `result_idx`.
    pub fn return_by_value(&self, result_idx: usize, metadata: MetadataHandle,
                           init: impl FnOnce(OpaquePtr)) -> Ret
    {
        match self.bridge.classify(metadata) {
            AbiClass::Direct(layout) => {
                let mut cell = OpaqueCell::allocate(metadata);
                unsafe {
                    cell.initialize_with(init);
                    Ret::Direct(DirectValue::load(&layout, cell.as_ptr()))
                }
            },
            AbiClass::Indirect => {
                init(self.result(result_idx));
                Ret::Void
            },
        }
    }
}

/// A by-value argument.
pub enum ValueArg<'a> {
    Borrowed(ConstOpaquePtr, PhantomData<&'a ()>),
    Materialized(OpaqueCell),
}

impl ValueArg<'_> {
    pub fn as_ptr(&self) -> ConstOpaquePtr {
        match self {
            ValueArg::Borrowed(ptr, _) => *ptr,
            ValueArg::Materialized(cell) => cell.as_ptr(),
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("the bridge is already initialized")]
    AlreadyInitialized(Config),

    #[error("can't use pointer authentication {config:?}: {source}")]
    PointerAuth {
        config: Config,
        source: ptrauth::SchemeInstalledError,
    },
}

/// The call adapter: symbol table, classification table, and configuration.
#[derive(Debug)]
pub struct Bridge {
    config: Config,
    symbols: SymbolTable,
    classes: RwLock<HashMap<MetadataHandle, AbiClass>>,
}

static BRIDGE: OnceLock<Bridge> = OnceLock::new();

/// Makes `config` the active pointer authentication scheme.
///
/// Fails if a different scheme is already locked in. Unsigned pointers are the default, so `None`
/// only fails if something else was installed explicitly.
fn install_pointer_auth(config: PointerAuthConfig) -> Result<(), ptrauth::SchemeInstalledError> {
    match ptrauth::install(config.scheme()) {
        Err(_) if config == PointerAuthConfig::None && ptrauth::scheme().is_unsigned() => Ok(()),
        res => res,
    }
}

impl Bridge {
    /// Creates a bridge with the `Generics` source module registered.
    pub fn new(config: Config) -> Self {
        let mut symbols = SymbolTable::default();
        source::register(&mut symbols);

        Self {
            config,
            symbols,
            classes: RwLock::new(HashMap::new()),
        }
    }

    /// Installs the process-wide bridge.
    ///
    /// The pointer authentication scheme is installed first: if it can't be, because metadata was
    /// already published under another scheme, the bridge stays uninstalled.
    pub fn install(config: Config) -> Result<&'static Bridge, InstallError> {
        if BRIDGE.get().is_some() {
            return Err(InstallError::AlreadyInitialized(config));
        }
        if let Err(source) = install_pointer_auth(config.pointer_auth) {
            return Err(InstallError::PointerAuth { config, source });
        }

        BRIDGE.set(Bridge::new(config)).map_err(|bridge| InstallError::AlreadyInitialized(bridge.config))?;
        Ok(Self::global())
    }

    /// Gets the process-wide bridge, initializing it from the environment if needed.
    pub fn global() -> &'static Bridge {
        BRIDGE.get_or_init(|| {
            let config = Config::from_env().unwrap_or_else(|err| {
                log::warn!("{}; using the default configuration", err);
                Config::default()
            });
            if let Err(err) = install_pointer_auth(config.pointer_auth) {
                log::warn!("{}; keeping it instead of {:?}", err, config.pointer_auth);
            }
            Bridge::new(config)
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Classifies a type, caching the result.
    pub fn classify(&self, metadata: MetadataHandle) -> AbiClass {
        if let Some(class) = self.classes.read().unwrap_or_else(PoisonError::into_inner).get(&metadata) {
            return class.clone();
        }

        let class = AbiClass::classify(metadata, self.config.max_direct_lanes);
        log::debug!("{} is passed {}", metadata.name(), match &class {
            AbiClass::Direct(layout) => format!("directly as {}", layout),
            AbiClass::Indirect => "indirectly".to_owned(),
        });

        self.classes.write().unwrap_or_else(PoisonError::into_inner)
            .entry(metadata)
            .or_insert(class)
            .clone()
    }

    /// Passes the value at `ptr` by value, following its classification.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid value of the type described by `metadata`, which outlives the
    /// call.
    pub unsafe fn pass_by_value(&self, metadata: MetadataHandle, ptr: ConstOpaquePtr) -> Arg {
        match self.classify(metadata) {
            AbiClass::Direct(layout) => Arg::Direct(DirectValue::load(&layout, ptr)),
            AbiClass::Indirect => Arg::Opaque(ptr),
        }
    }

    /// Completes a by-value return of type `metadata` into `result`.
    ///
    /// Aborts if the value didn't come back the way its classification says it should.
    ///
    /// # Safety
    ///
    /// `result` must be the `Result` argument the call was made with.
    pub unsafe fn receive_by_value(&self, metadata: MetadataHandle, ret: Ret, result: OpaquePtr) {
        match (self.classify(metadata), ret) {
            (AbiClass::Direct(layout), Ret::Direct(value)) if *value.layout() == layout => value.store(result),
            (AbiClass::Indirect, Ret::Void) => {},
            (class, ret) => fatal(FatalError::LayoutMismatch {
                ty: metadata.name().to_owned(),
                expected: format!("{:?}", class),
                got: format!("{:?}", ret),
            }),
        }
    }

    /// Calls a source runtime function.
    ///
    /// Aborts if the symbol is unknown, or if the arguments or return value don't match the
    /// function's signature.
    ///
    /// # Safety
    ///
    /// Every pointer argument must be valid for the use its kind implies.
    pub unsafe fn call(&self, symbol: &str, args: &[Arg]) -> Ret {
        let function = match self.symbols.lookup(symbol) {
            Some(function) => function,
            None => fatal(FatalError::UnknownSymbol(symbol.to_owned())),
        };

        let signature = &function.signature;
        if args.len() != signature.params.len() {
            fatal(FatalError::SignatureMismatch {
                symbol: symbol.to_owned(),
                detail: format!("expected {} arguments, got {}", signature.params.len(), args.len()),
            })
        }
        for (idx, (arg, kind)) in args.iter().zip(signature.params).enumerate() {
            if !arg.matches(*kind) {
                fatal(FatalError::SignatureMismatch {
                    symbol: symbol.to_owned(),
                    detail: format!("argument {} should be {:?}, got {:?}", idx, kind, arg),
                })
            }
        }

        if self.config.trace_calls {
            log::debug!("call {}{:?}", function.symbol, args);
        } else {
            log::trace!("call {}{:?}", function.symbol, args);
        }

        let frame = CallFrame {
            bridge: self,
            symbol: function.symbol,
            args,
        };
        let ret = (function.entry)(&frame);

        if !ret.matches(signature.ret) {
            fatal(FatalError::SignatureMismatch {
                symbol: symbol.to_owned(),
                detail: format!("should return {:?}, returned {:?}", signature.ret, ret),
            })
        }
        ret
    }

    /// Requests metadata from an accessor.
    pub fn request_metadata(&self, accessor: &str, request: MetadataRequest, args: &[MetadataHandle]) -> MetadataResponse {
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(Arg::Request(request));
        call_args.extend(args.iter().map(|arg| Arg::Metadata(*arg)));

        unsafe { self.call(accessor, &call_args).into_metadata() }
    }
}
