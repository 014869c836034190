//! Sauti Core - backend abstraction, process supervision, and model
//! registry for the sauti inference gateway.
//!
//! The gateway fronts heterogeneous third-party inference binaries (chat
//! LLM, speech-to-text, text-to-speech) behind one provider-agnostic
//! surface. This crate holds everything below the transport layer:
//!
//! - the [`backend`] contract and the llama.cpp / whisper.cpp / piper
//!   adapters,
//! - the [`process`] layer: child spawning, timeout-bounded execution,
//!   and the supervisor for long-running child HTTP servers,
//! - the [`model`] registry, reconciled from declarative [`config`].

pub mod backend;
pub mod config;
pub mod env;
pub mod error;
pub mod model;
pub mod params;
pub mod process;

pub use backend::{
    Backend, BackendRegistry, BackendRequest, BackendResponse, ResponseMetadata, StreamChunk,
    StreamingBackend,
};
pub use config::Config;
pub use env::Env;
pub use error::{Error, Result};
pub use model::{ModelInstance, ModelManager, ModelRegistry, ModelStatus};
pub use process::{Executor, ServerSpec, ServerSupervisor};
