//! Guest-call surface.
//!
//! [`Bridge`] is the context object shared by the two bridges. Each entry
//! point takes only integers plus the guest memory accessor, and never lets
//! an error cross back into the guest: failures are logged and turned into
//! the neutral result of the call (`0`, or nothing).

use crate::{
    config::BridgeConfig,
    memory::{self, GuestMemory},
    network::{HttpNetwork, Network},
    storage::{self, NativeStorage},
    userfs::UserFs,
    userhttp::{CompletionReceiver, UserHttp},
    Result,
};
use std::sync::Arc;
use tokio::runtime::Handle;

pub struct Bridge {
    pub userfs: UserFs,
    pub userhttp: UserHttp,
}

impl Bridge {
    pub fn new(
        storage: Arc<dyn NativeStorage>,
        network: Arc<dyn Network>,
        runtime: Handle,
    ) -> (Self, CompletionReceiver) {
        let (userhttp, rx) = UserHttp::new(network, runtime);
        let bridge = Self {
            userfs: UserFs::new(storage),
            userhttp,
        };
        (bridge, rx)
    }

    pub fn from_config(config: &BridgeConfig, runtime: Handle) -> Result<(Self, CompletionReceiver)> {
        let storage = storage::open(&config.storage)?;
        let network = Arc::new(HttpNetwork::new(&config.http)?);
        let (mut bridge, rx) = Self::new(storage, network, runtime);
        if let Some(app_name) = &config.app_name {
            bridge.userfs.init(app_name.clone())?;
        }
        Ok((bridge, rx))
    }

    pub fn userfs_init(&mut self, memory: &dyn GuestMemory, app_name_ptr: u32, app_name_len: u32) {
        tracing::debug!("userfs_init({}, {})", app_name_ptr, app_name_len);
        let result = memory
            .load_string(app_name_ptr, app_name_len)
            .and_then(|app_name| self.userfs.init(app_name));
        if let Err(error) = result {
            tracing::error!("userfs_init: {}", error);
        }
    }

    pub fn userfs_read(
        &self,
        memory: &mut dyn GuestMemory,
        key_ptr: u32,
        key_len: u32,
        buffer_ptr: u32,
        buffer_len: u32,
    ) -> i32 {
        tracing::debug!(
            "userfs_read({}, {}, {}, {})",
            key_ptr,
            key_len,
            buffer_ptr,
            buffer_len
        );
        let stub = |memory: &mut dyn GuestMemory| -> Result<i32> {
            let key = memory.load_string(key_ptr, key_len)?;
            match self.userfs.read(&key)? {
                Some(data) => memory::deliver(memory, buffer_ptr, buffer_len, &data),
                None => Ok(0),
            }
        };
        stub(memory).unwrap_or_else(|error| {
            tracing::error!("userfs_read: {}", error);
            0
        })
    }

    /// Storage failures (quota, I/O) are only logged; the guest has no
    /// channel to observe them.
    pub fn userfs_write(
        &self,
        memory: &dyn GuestMemory,
        key_ptr: u32,
        key_len: u32,
        data_ptr: u32,
        data_len: u32,
    ) {
        tracing::debug!(
            "userfs_write({}, {}, {}, {})",
            key_ptr,
            key_len,
            data_ptr,
            data_len
        );
        let stub = || -> Result<()> {
            let key = memory.load_string(key_ptr, key_len)?;
            let data = memory.load_bytes(data_ptr, data_len)?;
            self.userfs.write(&key, &data)
        };
        if let Err(error) = stub() {
            tracing::error!("userfs_write: {}", error);
        }
    }

    pub fn userfs_delete(&self, memory: &dyn GuestMemory, key_ptr: u32, key_len: u32) {
        tracing::debug!("userfs_delete({}, {})", key_ptr, key_len);
        let stub = || -> Result<()> {
            let key = memory.load_string(key_ptr, key_len)?;
            self.userfs.delete(&key)
        };
        if let Err(error) = stub() {
            tracing::error!("userfs_delete: {}", error);
        }
    }

    pub fn userfs_reset(&self) {
        tracing::debug!("userfs_reset()");
        if let Err(error) = self.userfs.reset() {
            tracing::error!("userfs_reset: {}", error);
        }
    }

    pub fn userhttp_fetch(&self, memory: &dyn GuestMemory, id: u32, req_ptr: u32, req_len: u32) {
        tracing::debug!("userhttp_fetch({}, {}, {})", id, req_ptr, req_len);
        let result = match memory.load_string(req_ptr, req_len) {
            Ok(descriptor) => self.userhttp.submit(id, &descriptor),
            Err(error) => {
                tracing::error!("userhttp_fetch {}: {}", id, error);
                self.userhttp.fail(id, format!("invalid request: {error}"))
            }
        };
        if let Err(error) = result {
            tracing::error!("userhttp_fetch: {}", error);
        }
    }

    pub fn userhttp_size(&self, id: u32) -> i32 {
        tracing::debug!("userhttp_size({})", id);
        memory::guest_len(self.userhttp.size(id) as usize)
    }

    pub fn userhttp_pop(&self, memory: &mut dyn GuestMemory, id: u32, res_ptr: u32, res_len: u32) {
        tracing::debug!("userhttp_pop({}, {}, {})", id, res_ptr, res_len);
        if let Err(error) = self.userhttp.pop(memory, id, res_ptr, res_len) {
            tracing::error!("userhttp_pop: {}", error);
        }
    }
}
