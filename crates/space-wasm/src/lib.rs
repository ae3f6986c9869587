//! Runs a WebAssembly guest under wasmer with the `userfs_*` and
//! `userhttp_*` imports from [`space_bridge`] installed.
//!
//! The guest runs on the calling thread. HTTP exchanges run on the tokio
//! runtime handed to the bridge; their completions are queued and delivered
//! to the guest's `userhttp_ready(id, len)` export by [`Wasm::dispatch_ready`]
//! or [`Wasm::run_until_idle`], so the guest is never re-entered while one
//! of its calls is on the stack.

use serde::Deserialize;
use space_bridge::{Bridge, BridgeConfig, Completion, CompletionReceiver, GuestMemory};
use std::path::{Path, PathBuf};
use tokio::{runtime::Handle, sync::mpsc::error::TryRecvError};
use wasmer::{FunctionEnv, Instance, Memory, Module, Store, Value};
use wasmer_cache::{Cache, FileSystemCache, Hash};

pub mod error;
pub mod ffi;

pub use error::{Error, Result};
use ffi::{SpaceEnv, WasmerMemory, READY_EXPORT};

#[derive(Deserialize, Clone, Debug)]
pub struct WasmConfig {
    /// Directory for compiled modules, keyed by the hash of the module bytes.
    pub module_cache: Option<PathBuf>,
    #[serde(default = "WasmConfig::default_entry")]
    pub entry: String,
}

impl WasmConfig {
    pub fn default_entry() -> String {
        "main".to_owned()
    }
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            module_cache: None,
            entry: Self::default_entry(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(flatten)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub wasm: WasmConfig,
}

impl Config {
    /// Read the config from `path`, or from STDIN if `path` is `-`.
    ///
    /// Falls back to the defaults when the file cannot be read or parsed.
    pub fn get_config(path: Option<String>) -> Self {
        match path {
            Some(s) => if s == "-" {
                use std::io::Read;
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .map_err(|error| {
                        tracing::error!("Error reading STDIN: {}", error);
                    })
                    .map(move |_| buf)
            } else {
                std::fs::read_to_string(&s).map_err(|error| {
                    tracing::error!("Error reading config {}: {}", s, error);
                })
            }
            .and_then(|s| Self::from_toml(&s))
            .map_err(|_| {
                tracing::warn!("Invalid config file, using default");
            })
            .unwrap_or_default(),
            None => {
                tracing::info!("No config specified, using default");
                Config::default()
            }
        }
    }

    fn from_toml(s: &str) -> std::result::Result<Self, ()> {
        toml::from_str(s).map_err(|error| {
            tracing::error!("Error parsing config: {}", error);
        })
    }
}

fn load_module(store: &Store, bytes: &[u8], cache: Option<&Path>) -> Result<Module> {
    let Some(dir) = cache else {
        return Ok(Module::new(store, bytes)?);
    };

    let key = Hash::generate(bytes);
    let mut cache = FileSystemCache::new(dir)?;
    match unsafe { cache.load(store, key) } {
        Ok(module) => {
            tracing::debug!("loaded module {} from cache", key.to_string());
            Ok(module)
        }
        Err(_) => {
            let module = Module::new(store, bytes)?;
            if let Err(error) = cache.store(key, &module) {
                tracing::warn!("failed to cache module {}: {}", key.to_string(), error);
            }
            Ok(module)
        }
    }
}

pub struct Wasm {
    store: Store,
    instance: Instance,
    memory: Memory,
    env: FunctionEnv<SpaceEnv>,
    completions: CompletionReceiver,
}

impl Wasm {
    /// Compile and instantiate `bytes` (binary or text format).
    ///
    /// `completions` must be the receiver paired with `bridge`.
    pub fn new(
        bytes: &[u8],
        bridge: Bridge,
        completions: CompletionReceiver,
        cache: Option<&Path>,
    ) -> Result<Self> {
        let mut store = Store::default();
        let module = load_module(&store, bytes, cache)?;

        let env = FunctionEnv::new(&mut store, SpaceEnv::new(bridge));
        let imports = ffi::imports(&mut store, &env);
        let instance = Instance::new(&mut store, &module, &imports)?;

        let memory = instance.exports.get_memory("memory")?.clone();
        env.as_mut(&mut store).set_memory(memory.clone());

        Ok(Self {
            store,
            instance,
            memory,
            env,
            completions,
        })
    }

    pub fn from_config(bytes: &[u8], config: &Config, runtime: Handle) -> Result<Self> {
        let (bridge, completions) = Bridge::from_config(&config.bridge, runtime)?;
        Self::new(
            bytes,
            bridge,
            completions,
            config.wasm.module_cache.as_deref(),
        )
    }

    pub fn call(&mut self, name: &str, values: &[Value]) -> Result<Box<[Value]>> {
        tracing::debug!("calling {}", name);
        let function = self.instance.exports.get_function(name)?;
        Ok(function.call(&mut self.store, values)?)
    }

    pub fn bridge(&self) -> &Bridge {
        self.env.as_ref(&self.store).bridge()
    }

    pub fn bridge_mut(&mut self) -> &mut Bridge {
        self.env.as_mut(&mut self.store).bridge_mut()
    }

    pub fn read_memory(&self, ptr: u32, len: u32) -> Result<Vec<u8>> {
        let view = WasmerMemory(self.memory.view(&self.store));
        Ok(view.load_bytes(ptr, len)?)
    }

    pub fn write_memory(&mut self, ptr: u32, bytes: &[u8]) -> Result<()> {
        let mut view = WasmerMemory(self.memory.view(&self.store));
        Ok(view.store_bytes(ptr, bytes)?)
    }

    /// Deliver one completion to the guest's `userhttp_ready` export.
    ///
    /// Guests that never fetch need not export it; the result then stays
    /// in the table.
    pub fn notify(&mut self, completion: Completion) -> Result<()> {
        let Completion { id, len } = completion;
        tracing::debug!("{}({}, {})", READY_EXPORT, id, len);
        match self
            .instance
            .exports
            .get_typed_function::<(i32, i32), ()>(&self.store, READY_EXPORT)
        {
            Ok(ready) => ready.call(&mut self.store, id as i32, len as i32)?,
            Err(error) => {
                tracing::warn!("request {} is ready but the guest cannot take it: {}", id, error);
            }
        }
        Ok(())
    }

    /// Deliver every completion queued so far without blocking.
    pub fn dispatch_ready(&mut self) -> Result<usize> {
        let mut count = 0;
        loop {
            match self.completions.try_recv() {
                Ok(completion) => {
                    self.notify(completion)?;
                    count += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(count),
            }
        }
    }

    /// Block until no request is in flight and every completion has been
    /// delivered, including those of requests the guest submits from its
    /// `userhttp_ready` handler.
    ///
    /// Must not be called from within an async context.
    pub fn run_until_idle(&mut self) -> Result<usize> {
        let mut delivered = 0;
        loop {
            if self.bridge().userhttp.in_flight() == 0 {
                let count = self.dispatch_ready()?;
                if count == 0 {
                    return Ok(delivered);
                }
                delivered += count;
                continue;
            }

            match self.completions.blocking_recv() {
                Some(completion) => {
                    self.notify(completion)?;
                    delivered += 1;
                }
                None => return Ok(delivered),
            }
        }
    }
}
