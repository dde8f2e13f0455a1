#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use identity_controller_client as client;
pub use identity_controller_core as core;
pub use identity_controller_k8s_api as k8s;
pub use identity_controller_k8s_index as index;
pub use identity_controller_queue as queue;
pub use identity_controller_sync as sync;

mod args;
mod lease;
mod pipeline;

pub use self::args::Args;
