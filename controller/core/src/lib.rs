#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod action;
pub mod client;
pub mod event_bus;
pub mod predicate;
pub mod reconcile;
pub mod retry;
pub mod scale;
pub mod states;
pub mod status;
mod validation;


pub use self::{
    client::{ClientError, Mutator, PodClient, ReconcileContext, ResourceUpdate},
    reconcile::{Config, Outcome, ReconcileError, Reconciler, ReconcilerMetrics},
    retry::{retry, Recoverable, RetryMetrics, RetryPolicy},
    scale::{ResourceName, ScaleConfigs},
    states::States,
    status::{Clock, ScaleMetrics, StatusAnnotation, StatusWriter},
    validation::{validate, ValidationError},
};
