use space_bridge::{memory::check_range, Bridge, GuestMemory};
use wasmer::{imports, Function, FunctionEnv, FunctionEnvMut, Imports, Memory, MemoryView, Store};

/// Guest export invoked with `(id, len)` when a request is ready.
pub const READY_EXPORT: &str = "userhttp_ready";

// Environment
pub struct SpaceEnv {
    memory: Option<Memory>,
    bridge: Bridge,
}

impl SpaceEnv {
    pub fn new(bridge: Bridge) -> Self {
        Self {
            memory: None,
            bridge,
        }
    }

    pub fn set_memory(&mut self, memory: Memory) {
        self.memory = Some(memory);
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut Bridge {
        &mut self.bridge
    }
}

/// [`GuestMemory`] over a wasmer memory view.
pub struct WasmerMemory<'a>(pub MemoryView<'a>);

impl GuestMemory for WasmerMemory<'_> {
    fn size(&self) -> u64 {
        self.0.data_size()
    }

    fn read(&self, ptr: u32, buf: &mut [u8]) -> space_bridge::Result<()> {
        check_range(ptr, buf.len(), self.size())?;
        self.0
            .read(ptr as u64, buf)
            .map_err(space_bridge::Error::custom)
    }

    fn write(&mut self, ptr: u32, bytes: &[u8]) -> space_bridge::Result<()> {
        check_range(ptr, bytes.len(), self.size())?;
        self.0
            .write(ptr as u64, bytes)
            .map_err(space_bridge::Error::custom)
    }
}

// Utility functions
fn with_guest<R>(
    mut ctx: FunctionEnvMut<SpaceEnv>,
    name: &str,
    default: R,
    f: impl FnOnce(&mut Bridge, &mut dyn GuestMemory) -> R,
) -> R {
    let (env, store) = ctx.data_and_store_mut();
    let Some(memory) = env.memory.clone() else {
        tracing::error!("{}: guest memory is not attached", name);
        return default;
    };
    let mut view = WasmerMemory(memory.view(&store));
    f(&mut env.bridge, &mut view)
}

pub fn imports(store: &mut Store, env: &FunctionEnv<SpaceEnv>) -> Imports {
    imports! {
        "env" => {
            "userfs_init" => Function::new_typed_with_env(store, env, userfs_init),
            "userfs_read" => Function::new_typed_with_env(store, env, userfs_read),
            "userfs_write" => Function::new_typed_with_env(store, env, userfs_write),
            "userfs_delete" => Function::new_typed_with_env(store, env, userfs_delete),
            "userfs_reset" => Function::new_typed_with_env(store, env, userfs_reset),
            "userhttp_fetch" => Function::new_typed_with_env(store, env, userhttp_fetch),
            "userhttp_size" => Function::new_typed_with_env(store, env, userhttp_size),
            "userhttp_pop" => Function::new_typed_with_env(store, env, userhttp_pop),
        }
    }
}

// Host functions
pub fn userfs_init(ctx: FunctionEnvMut<SpaceEnv>, app_name_ptr: i32, app_name_len: i32) {
    with_guest(ctx, "userfs_init", (), |bridge, memory| {
        bridge.userfs_init(memory, app_name_ptr as u32, app_name_len as u32)
    })
}

pub fn userfs_read(
    ctx: FunctionEnvMut<SpaceEnv>,
    key_ptr: i32,
    key_len: i32,
    buffer_ptr: i32,
    buffer_len: i32,
) -> i32 {
    with_guest(ctx, "userfs_read", 0, |bridge, memory| {
        bridge.userfs_read(
            memory,
            key_ptr as u32,
            key_len as u32,
            buffer_ptr as u32,
            buffer_len as u32,
        )
    })
}

pub fn userfs_write(
    ctx: FunctionEnvMut<SpaceEnv>,
    key_ptr: i32,
    key_len: i32,
    data_ptr: i32,
    data_len: i32,
) {
    with_guest(ctx, "userfs_write", (), |bridge, memory| {
        bridge.userfs_write(
            memory,
            key_ptr as u32,
            key_len as u32,
            data_ptr as u32,
            data_len as u32,
        )
    })
}

pub fn userfs_delete(ctx: FunctionEnvMut<SpaceEnv>, key_ptr: i32, key_len: i32) {
    with_guest(ctx, "userfs_delete", (), |bridge, memory| {
        bridge.userfs_delete(memory, key_ptr as u32, key_len as u32)
    })
}

pub fn userfs_reset(ctx: FunctionEnvMut<SpaceEnv>) {
    ctx.data().bridge.userfs_reset()
}

pub fn userhttp_fetch(ctx: FunctionEnvMut<SpaceEnv>, id: i32, req_ptr: i32, req_len: i32) {
    with_guest(ctx, "userhttp_fetch", (), |bridge, memory| {
        bridge.userhttp_fetch(memory, id as u32, req_ptr as u32, req_len as u32)
    })
}

pub fn userhttp_size(ctx: FunctionEnvMut<SpaceEnv>, id: i32) -> i32 {
    ctx.data().bridge.userhttp_size(id as u32)
}

pub fn userhttp_pop(ctx: FunctionEnvMut<SpaceEnv>, id: i32, res_ptr: i32, res_len: i32) {
    with_guest(ctx, "userhttp_pop", (), |bridge, memory| {
        bridge.userhttp_pop(memory, id as u32, res_ptr as u32, res_len as u32)
    })
}
