//! Host-side bridge giving memory-isolated WebAssembly guests persistent
//! key-value storage (`userfs_*`) and asynchronous HTTP (`userhttp_*`).
//!
//! The guest can only pass integers across the boundary, so every entry
//! point works on `(ptr, len)` ranges of the guest's linear memory, see
//! [`memory`]. Hosts construct one [`Bridge`] per guest instance and wire its
//! entry points into the guest's import table; `space-wasm` does this for
//! wasmer.
//!
//! ## Example
//!
//! ```rust,ignore
//! let (bridge, mut completions) = Bridge::from_config(&config, Handle::current())?;
//! bridge.userhttp_fetch(&memory, 7, req_ptr, req_len);
//! // later, on the driver side
//! let Completion { id, len } = completions.recv().await.unwrap();
//! // call the guest's `userhttp_ready(id, len)` export
//! ```

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod memory;
pub mod network;
pub mod schema;
pub mod storage;
pub mod userfs;
pub mod userhttp;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use memory::{GuestMemory, LinearMemory};
pub use userhttp::{Completion, CompletionReceiver};
