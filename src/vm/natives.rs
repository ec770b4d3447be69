//! The native ABI between the VM and its host.
//!
//! A native receives a [`Params`] view: `argv[0]` is the return slot and
//! `argv[1..=argc]` are the arguments. Numeric arguments pass by value;
//! reference kinds pass as stable handles (pool or arena indices, inline
//! addresses). A native *handler* uses the same shape, and setting the
//! return slot truthy tells the interpreter the request has been handled:
//! the runner terminates with `true`.
//!
//! Signature strings are one character per slot, return first:
//! `I` integer, `B` boolean, `S` string, `P` IP address, `C` CIDR,
//! `V` void.

use std::any::Any;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::vm::program::Program;
use crate::vm::value::{Cidr, Slot, StrRef, StringArena};

/// Host callback invoked by CALL and HANDLER instructions.
pub type NativeFn = Arc<dyn Fn(&mut Params<'_>) + Send + Sync>;

/// A resolved native table entry of a program.
#[derive(Clone)]
pub struct NativeEntry {
    name: String,
    signature: String,
    callback: NativeFn,
}

impl NativeEntry {
    pub fn new(name: &str, signature: &str, callback: NativeFn) -> Self {
        Self {
            name: name.to_string(),
            signature: signature.to_string(),
            callback,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn callback(&self) -> NativeFn {
        Arc::clone(&self.callback)
    }
}

impl std::fmt::Debug for NativeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeEntry({} {})", self.signature, self.name)
    }
}

/// Host-side registry the loader resolves native references against.
#[derive(Default)]
pub struct NativeRegistry {
    functions: HashMap<String, NativeFn>,
    handlers: HashMap<String, NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function<F>(&mut self, name: &str, callback: F)
    where
        F: Fn(&mut Params<'_>) + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(callback));
    }

    pub fn register_handler<F>(&mut self, name: &str, callback: F)
    where
        F: Fn(&mut Params<'_>) + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(callback));
    }

    pub fn function(&self, name: &str) -> Option<NativeFn> {
        self.functions.get(name).map(Arc::clone)
    }

    pub fn handler(&self, name: &str) -> Option<NativeFn> {
        self.handlers.get(name).map(Arc::clone)
    }
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("functions", &self.functions.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Argument view handed to a native callback.
pub struct Params<'r> {
    pub(crate) argv: &'r mut [Slot],
    pub(crate) program: &'r Program,
    pub(crate) arena: &'r mut StringArena,
    pub(crate) userdata: &'r mut Option<Box<dyn Any + Send>>,
}

impl<'r> Params<'r> {
    /// Number of arguments (excluding the return slot).
    pub fn argc(&self) -> usize {
        self.argv.len().saturating_sub(1)
    }

    pub fn int(&self, index: usize) -> i64 {
        self.argv.get(index).copied().unwrap_or_default().as_int()
    }

    pub fn ip(&self, index: usize) -> IpAddr {
        self.argv.get(index).copied().unwrap_or_default().as_ip()
    }

    pub fn cidr(&self, index: usize) -> Cidr {
        self.argv.get(index).copied().unwrap_or_default().as_cidr()
    }

    /// Resolve a string argument. Returns an owned copy so the native can
    /// freely allocate result strings afterwards.
    pub fn string(&self, index: usize) -> String {
        match self.argv.get(index).copied() {
            Some(Slot::Str(StrRef::Pool(i))) => {
                self.program.constants().string(i).unwrap_or("").to_string()
            }
            Some(Slot::Str(StrRef::Arena(i))) => self.arena.get(i).to_string(),
            _ => String::new(),
        }
    }

    pub fn set_result(&mut self, value: i64) {
        self.argv[0] = Slot::Int(value);
    }

    pub fn set_result_bool(&mut self, value: bool) {
        self.argv[0] = Slot::from_bool(value);
    }

    pub fn set_result_str(&mut self, value: &str) {
        let r = self.arena.alloc(value.to_string());
        self.argv[0] = Slot::Str(r);
    }

    pub fn set_result_ip(&mut self, value: IpAddr) {
        self.argv[0] = Slot::Ip(value);
    }

    pub fn set_result_cidr(&mut self, value: Cidr) {
        self.argv[0] = Slot::Cidr(value);
    }

    /// Whether the return slot is truthy (handler termination contract).
    pub fn handled(&self) -> bool {
        self.argv[0].truthy()
    }

    /// Downcast the runner's user data.
    pub fn userdata_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.userdata.as_mut()?.downcast_mut::<T>()
    }

    pub fn userdata_ref<T: 'static>(&self) -> Option<&T> {
        self.userdata.as_ref()?.downcast_ref::<T>()
    }
}
