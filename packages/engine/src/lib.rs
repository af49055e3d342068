//! statewire engine: a reactive pub/sub runtime over live program state.
//!
//! External subscribers observe and mutate in-process values through JSON
//! messages called *blocks*. A connection exposes a variable graph rooted
//! in named host values; inbound `monitor` blocks install, update, or
//! delete variables, the runtime polls them on per-monitor cadences, and
//! publishes JSON diffs of changed values back through a pluggable
//! [`Transport`].
//!
//! - `host`: host values behind a small capability layer
//! - `name` / `path`: declaration and path grammars
//! - `env`: the variable environment (registry, traversal, refresh)
//! - `walk`: JSON walking and `{"ref"}` substitution over weak OID tables
//! - `block` / `router` / `monitor`: the block protocol
//! - `worker` / `connection`: the multi-worker scheduler and runtime
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use statewire_engine::{loopback, Connection, ConnectionConfig, HostValue, Roots};
//!
//! # async fn run() -> statewire_engine::Result<()> {
//! let roots = Roots::from_entries([(
//!     "person".to_string(),
//!     HostValue::map([("name".to_string(), HostValue::from("Herman"))]),
//! )]);
//! let (handle, transport) = loopback();
//! let conn = Connection::start(
//!     "demo",
//!     Arc::new(transport),
//!     roots,
//!     None,
//!     ConnectionConfig::default(),
//! )
//! .await?;
//! # let _ = (handle, conn);
//! # Ok(())
//! # }
//! ```

mod block;
mod connection;
mod env;
mod error;
mod host;
mod monitor;
mod name;
mod path;
mod router;
mod transport;
mod var;
mod walk;
mod worker;

pub use block::{Block, BlockMap, BlockType, StringList};
pub use connection::{
    current_connection, with_connection, Connection, ConnectionConfig, CoreState, StatsSnapshot,
};
pub use env::VarEnv;
pub use error::{EngineError, Result};
pub use host::{
    is_same, Arity, CallCtx, FnArgs, HostFn, HostRecord, HostValue, ObjKey, Roots, WeakHost,
};
pub use monitor::{MonitorData, MonitorTable};
pub use name::FullName;
pub use path::{parse_path, path_to_string, PathStep};
pub use router::{Evaluated, Evaluator, ReducerFn, RouterCtx};
pub use transport::{loopback, LoopbackHandle, LoopbackTransport, Transport};
pub use var::{Var, VarId};
pub use walk::{deref, is_reference, reference_oid, walk, OidTable};
pub use worker::{current_worker, FailureMeter, WorkerKind};
