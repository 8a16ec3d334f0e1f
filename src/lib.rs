//! # geerpc
//!
//! An RPC framework speaking the Gee-RPC wire protocol: a JSON option
//! handshake followed by codec-encoded header/body records over any
//! stream transport, optionally tunneled through an HTTP CONNECT
//! upgrade. On top of the single-connection [`Client`] sit a heartbeat
//! [`Registry`], pluggable [`Discovery`], and the load-balancing
//! [`XClient`].
//!
//! ## Server
//!
//! ```ignore
//! let server = Arc::new(Server::new());
//! server.register(
//!     Service::builder(Foo)
//!         .method("Sum", |_foo, args: Args| async move {
//!             Ok(args.num1 + args.num2)
//!         })
//!         .build()?,
//! )?;
//!
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! tokio::spawn(server.accept(listener));
//! ```
//!
//! ## Client
//!
//! ```ignore
//! let client = Client::dial("tcp", &addr, Options::default()).await?;
//! let sum: i32 = client.call("Foo.Sum", &Args { num1: 1, num2: 3 }).await?;
//! ```

pub mod codec;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod transport;
pub mod xclient;

mod client;
mod http;
mod server;

pub use client::{Call, Client};
pub use codec::CodecType;
pub use error::{Result, RpcError};
pub use http::{DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};
pub use protocol::{Header, Options, MAGIC_NUMBER};
pub use registry::Registry;
pub use server::Server;
pub use service::{MethodError, MethodResult, Service, ServiceBuilder};
pub use xclient::{Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode, XClient};
