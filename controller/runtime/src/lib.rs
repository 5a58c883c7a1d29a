#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use startup_scaler_controller_core as core;
pub use startup_scaler_controller_k8s_api as k8s;
pub use startup_scaler_controller_k8s_client as kube_client;

mod args;
mod controller;
mod lease;
mod logging;
mod watch;

pub use self::args::Args;
