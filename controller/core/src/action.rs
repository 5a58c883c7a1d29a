//! Maps a classified pod onto at most one mutation.

use crate::{
    client::{ClientError, PodClient, ReconcileContext},
    scale::ScaleConfigs,
    states::{BoolState, ResizeState, ResourcesState, States, StatusResourcesState},
    status::{Direction, FailureReason, ScaleState, StatusWriter},
    RetryPolicy,
};
use startup_scaler_controller_k8s_api::{ContainerState, Pod};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown resources applied and scaling from unknown resources is disabled")]
    UnknownResources,

    #[error("{direction} scale failed - {reason} ({message})")]
    ScaleFailed {
        direction: Direction,
        reason: FailureReason,
        message: String,
    },

    #[error("failed to command resources: {0}")]
    Command(#[source] ClientError),
}

#[derive(Clone, Debug)]
pub struct Router {
    status: StatusWriter,
    scale_when_unknown_resources: bool,
}

/// The inputs of a single routing decision.
pub struct Target<'a> {
    pub pod: &'a Pod,
    pub container_name: &'a str,
    pub configs: &'a ScaleConfigs,
    pub states: &'a States,
}

// === impl Router ===

impl Router {
    pub fn new(status: StatusWriter, scale_when_unknown_resources: bool) -> Self {
        Self {
            status,
            scale_when_unknown_resources,
        }
    }

    pub fn status(&self) -> &StatusWriter {
        &self.status
    }

    pub async fn route<C>(
        &self,
        client: &C,
        ctx: &ReconcileContext,
        target: Target<'_>,
    ) -> Result<(), ActionError>
    where
        C: PodClient + ?Sized,
    {
        let states = target.states;
        if states.startup_probe == BoolState::Unknown || states.readiness_probe == BoolState::Unknown {
            panic!("probe states must be known once classified: {states}");
        }

        if states.container != ContainerState::Running {
            self.update_status(
                client,
                ctx,
                &target,
                "target container currently not running",
                ScaleState::NotApplicable,
            )
            .await;
            return Ok(());
        }

        if states.started == BoolState::Unknown {
            tracing::debug!("Target container started state not yet known");
            return Ok(());
        }
        if states.ready == BoolState::Unknown {
            tracing::debug!("Target container ready state not yet known");
            return Ok(());
        }

        if states.resources == ResourcesState::Unknown && !self.scale_when_unknown_resources {
            self.update_status(
                client,
                ctx,
                &target,
                "unknown resources applied",
                ScaleState::NotApplicable,
            )
            .await;
            return Err(ActionError::UnknownResources);
        }

        let is_started = match (states.startup_probe, states.readiness_probe) {
            (BoolState::True, _) => states.started == BoolState::True,
            (_, BoolState::True) => {
                states.started == BoolState::True && states.ready == BoolState::True
            }
            _ => panic!("pods without a startup or readiness probe must not be routed"),
        };

        match (states.resources, is_started) {
            (ResourcesState::Startup, false) | (ResourcesState::PostStartup, true) => {
                self.process_config_enacted(client, ctx, &target).await
            }
            (ResourcesState::Startup, true) => {
                self.command(client, ctx, &target, Direction::Down, ScaleState::Commanded(Direction::Down))
                    .await
            }
            (ResourcesState::PostStartup, false) => {
                self.command(client, ctx, &target, Direction::Up, ScaleState::Commanded(Direction::Up))
                    .await
            }
            (ResourcesState::Unknown, false) => {
                self.command(client, ctx, &target, Direction::Up, ScaleState::UnknownCommanded)
                    .await
            }
            (ResourcesState::Unknown, true) => {
                self.command(client, ctx, &target, Direction::Down, ScaleState::UnknownCommanded)
                    .await
            }
        }
    }

    /// Writes the resources for `direction` along with a status recording the
    /// command.
    async fn command<C>(
        &self,
        client: &C,
        ctx: &ReconcileContext,
        target: &Target<'_>,
        direction: Direction,
        scale_state: ScaleState,
    ) -> Result<(), ActionError>
    where
        C: PodClient + ?Sized,
    {
        let updates = match direction {
            Direction::Up => target.configs.startup_updates(),
            Direction::Down => target.configs.post_startup_updates(),
        };
        let pending = self.status.prepare(
            format!("{} resources commanded", phase(direction)),
            target.states,
            scale_state,
            &target.configs.enabled_resource_names(),
        );

        client
            .update_container_resources(
                ctx,
                target.pod,
                target.container_name,
                &updates,
                &[pending.mutator()],
                true,
            )
            .await
            .map_err(ActionError::Command)?;
        pending.commit();
        tracing::info!(%direction, "Commanded {} resources", phase(direction));
        Ok(())
    }

    async fn process_config_enacted<C>(
        &self,
        client: &C,
        ctx: &ReconcileContext,
        target: &Target<'_>,
    ) -> Result<(), ActionError>
    where
        C: PodClient + ?Sized,
    {
        let states = target.states;
        let direction = match states.resources {
            ResourcesState::Startup => Direction::Up,
            ResourcesState::PostStartup => Direction::Down,
            ResourcesState::Unknown => {
                unreachable!("unknown resources are commanded, never processed as enacted")
            }
        };
        let phase = phase(direction);
        let message = &states.resize.message;

        let (status, scale_state, failure) = match states.resize.state {
            ResizeState::InProgress => (
                format!("{phase} scale in progress"),
                ScaleState::NotApplicable,
                None,
            ),
            ResizeState::Deferred => (
                format!("{phase} scale deferred ({message})"),
                ScaleState::NotApplicable,
                None,
            ),
            ResizeState::Infeasible => (
                format!("{phase} scale failed - infeasible ({message})"),
                ScaleState::Failed(direction, FailureReason::Infeasible),
                Some(FailureReason::Infeasible),
            ),
            ResizeState::Error => (
                format!("{phase} scale failed - error ({message})"),
                ScaleState::Failed(direction, FailureReason::Error),
                Some(FailureReason::Error),
            ),
            ResizeState::Unknown => (
                format!("{phase} scale resize state unknown"),
                ScaleState::NotApplicable,
                None,
            ),
            ResizeState::NotStartedOrCompleted => match states.status_resources {
                StatusResourcesState::ContainerResourcesMatch => (
                    format!("{phase} resources enacted"),
                    ScaleState::Enacted(direction),
                    None,
                ),
                StatusResourcesState::Incomplete
                | StatusResourcesState::ContainerResourcesMismatch
                | StatusResourcesState::Unknown => (
                    format!("{phase} scale in progress"),
                    ScaleState::NotApplicable,
                    None,
                ),
            },
        };

        self.update_status(client, ctx, target, &status, scale_state)
            .await;

        match failure {
            Some(reason) => Err(ActionError::ScaleFailed {
                direction,
                reason,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Writes a status update once. Failures are logged and otherwise ignored;
    /// the next reconcile restores the status.
    async fn update_status<C>(
        &self,
        client: &C,
        ctx: &ReconcileContext,
        target: &Target<'_>,
        status: &str,
        scale_state: ScaleState,
    ) where
        C: PodClient + ?Sized,
    {
        let pending = self.status.prepare(
            status,
            target.states,
            scale_state,
            &target.configs.enabled_resource_names(),
        );
        let once = ReconcileContext {
            retry: RetryPolicy::once(),
            ..ctx.clone()
        };
        match client
            .patch(&once, target.pod, &[pending.mutator()], false, true)
            .await
        {
            Ok(_) => pending.commit(),
            Err(error) => tracing::warn!(%error, %status, "Failed to update status"),
        }
    }
}

fn phase(direction: Direction) -> &'static str {
    match direction {
        Direction::Up => "startup",
        Direction::Down => "post-startup",
    }
}
