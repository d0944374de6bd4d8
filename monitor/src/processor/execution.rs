//! Execution of one claimed request

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::MonitorError;
use crate::models::request::{ComponentSpec, DeploymentRequest, RequestStatus};
use crate::models::result::{DeploymentResult, ResultStatus};
use crate::processor::sources::CancellationSources;
use crate::processor::DeploymentRequestStateProcessor;
use crate::runner::dispatcher::Termination;

enum StepVerdict {
    Continue,
    Stop,
}

/// Removes a request from the in-flight table when execution ends
struct InFlight<'a> {
    sources: &'a CancellationSources,
    request_id: i64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.sources.remove(self.request_id);
    }
}

impl DeploymentRequestStateProcessor {
    pub(super) async fn execute_request(
        &self,
        mut request: DeploymentRequest,
        sources: &CancellationSources,
        shutdown: &CancellationToken,
    ) -> Result<(), MonitorError> {
        let request_token = shutdown.child_token();
        if !sources.add(request.id, request_token.clone()) {
            debug!("Request {} is already executing here", request.id);
            return Ok(());
        }
        let _in_flight = InFlight {
            sources,
            request_id: request.id,
        };

        match request.status {
            RequestStatus::Pending | RequestStatus::Confirmed => {}
            RequestStatus::Running => return self.fail_orphan(&request).await,
            status => {
                debug!("Request {} is {}, nothing to execute", request.id, status);
                return Ok(());
            }
        }

        let claimed = self
            .store
            .update_non_processed_request(&request, RequestStatus::Running, Utc::now())
            .await?;
        if claimed == 0 {
            debug!("Request {} was claimed by another monitor", request.id);
            return Ok(());
        }

        let resumed_from = request.status;
        request.status = RequestStatus::Running;
        info!(
            "Executing request {} on {} for {} (was {})",
            request.id, request.environment_name, request.user_name, resumed_from
        );

        let outcome = self
            .run_components(&request, resumed_from, &request_token, shutdown)
            .await;

        if let Err(e) = &outcome {
            warn!("Marking request {} failed after error: {}", request.id, e);
            if let Err(e) = self.finish(&request, RequestStatus::Failed).await {
                warn!("Could not mark request {} failed: {}", request.id, e);
            }
        }
        outcome
    }

    /// A `Running` request nobody here executes was left behind by a stopped monitor
    async fn fail_orphan(&self, request: &DeploymentRequest) -> Result<(), MonitorError> {
        let batch = std::slice::from_ref(request);
        let switched = self
            .store
            .switch_deployment_request_statuses(
                batch,
                RequestStatus::Running,
                RequestStatus::Failed,
                Some(Utc::now()),
            )
            .await?;
        if switched == 0 {
            return Ok(());
        }

        warn!(
            "Request {} was left running by a stopped monitor, marking it failed",
            request.id
        );
        self.store
            .switch_deployment_results_statuses(batch, ResultStatus::Running, ResultStatus::Failed)
            .await?;
        self.publish(request, RequestStatus::Failed).await;
        Ok(())
    }

    async fn run_components(
        &self,
        request: &DeploymentRequest,
        resumed_from: RequestStatus,
        request_token: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<(), MonitorError> {
        let results = if resumed_from == RequestStatus::Pending {
            self.store
                .create_deployment_results(request.id, &request.detail.enabled_components())
                .await?
        } else {
            self.store.get_deployment_results(request.id).await?
        };
        self.publish(request, RequestStatus::Running).await;

        for mut result in results {
            let component = component_of(request, &result)?;

            match result.status {
                ResultStatus::Completed => continue,
                ResultStatus::WaitingConfirmation => {
                    result.status = ResultStatus::Confirmed;
                    if !self.save(request, &result).await? {
                        return Ok(());
                    }
                }
                ResultStatus::Pending if component.requires_confirmation => {
                    return self.await_confirmation(request, result).await;
                }
                ResultStatus::Pending | ResultStatus::Confirmed => {}
                status => {
                    return Err(MonitorError::Internal(format!(
                        "component {} of request {} is unexpectedly {}",
                        result.component_id, request.id, status
                    )));
                }
            }

            if request_token.is_cancelled() {
                return self.stop_cancelled(request, shutdown).await;
            }
            if !self.is_still_running(request).await? {
                return Ok(());
            }

            match self
                .run_step(request, component, result, request_token, shutdown)
                .await?
            {
                StepVerdict::Continue => {}
                StepVerdict::Stop => return Ok(()),
            }
        }

        let status = if request.detail.has_disabled_steps() {
            RequestStatus::CompletedWithDisabledSteps
        } else {
            RequestStatus::Completed
        };
        self.finish(request, status).await
    }

    async fn await_confirmation(
        &self,
        request: &DeploymentRequest,
        mut result: DeploymentResult,
    ) -> Result<(), MonitorError> {
        result.status = ResultStatus::WaitingConfirmation;
        if !self.save(request, &result).await? {
            return Ok(());
        }

        let switched = self
            .store
            .switch_deployment_request_statuses(
                std::slice::from_ref(request),
                RequestStatus::Running,
                RequestStatus::WaitingConfirmation,
                None,
            )
            .await?;
        if switched > 0 {
            info!(
                "Request {} waits for confirmation of {}",
                request.id, result.component_name
            );
            self.publish(request, RequestStatus::WaitingConfirmation)
                .await;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        request: &DeploymentRequest,
        component: &ComponentSpec,
        mut result: DeploymentResult,
        request_token: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<StepVerdict, MonitorError> {
        result.status = ResultStatus::Running;
        if !self.save(request, &result).await? {
            return Ok(StepVerdict::Stop);
        }

        let step_token = request_token.child_token();
        let dispatched = self.dispatcher.dispatch(request, component, &step_token);
        tokio::pin!(dispatched);
        let ran = tokio::select! {
            ran = &mut dispatched => ran,
            _ = self.watch_status(request.id, &step_token) => dispatched.await,
        };

        let outcome = match ran {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "Could not run component {} of request {}: {}",
                    component.id, request.id, e
                );
                result.status = ResultStatus::Failed;
                result.log = Some(e.to_string());
                self.save(request, &result).await?;
                self.finish(request, RequestStatus::Failed).await?;
                return Ok(StepVerdict::Stop);
            }
        };

        result.exit_code = Some(outcome.exit_code);
        result.log = Some(outcome.log);

        match outcome.termination {
            None if outcome.exit_code == 0 => {
                result.status = ResultStatus::Completed;
                if !self.save(request, &result).await? {
                    return Ok(StepVerdict::Stop);
                }
                debug!("Component {} of request {} completed", component.id, request.id);
                Ok(StepVerdict::Continue)
            }
            None => {
                info!(
                    "Component {} of request {} failed with exit code {}",
                    component.id, request.id, outcome.exit_code
                );
                result.status = ResultStatus::Failed;
                self.save(request, &result).await?;
                self.finish(request, RequestStatus::Failed).await?;
                Ok(StepVerdict::Stop)
            }
            Some(Termination::TimedOut) => {
                info!("Component {} of request {} timed out", component.id, request.id);
                result.status = ResultStatus::Failed;
                self.save(request, &result).await?;
                self.finish(request, RequestStatus::Failed).await?;
                Ok(StepVerdict::Stop)
            }
            Some(Termination::Cancelled) if shutdown.is_cancelled() => {
                info!(
                    "Component {} of request {} interrupted by shutdown or lock loss",
                    component.id, request.id
                );
                result.status = ResultStatus::Failed;
                self.save(request, &result).await?;
                self.finish(request, RequestStatus::Failed).await?;
                Ok(StepVerdict::Stop)
            }
            Some(Termination::Cancelled) => {
                info!("Component {} of request {} cancelled", component.id, request.id);
                result.status = ResultStatus::Cancelled;
                self.save(request, &result).await?;
                Ok(StepVerdict::Stop)
            }
        }
    }

    /// Cancel `step` once the request leaves `Running` on another monitor.
    ///
    /// Returns when `step` is cancelled, whoever cancelled it.
    async fn watch_status(&self, request_id: i64, step: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.status_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = step.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.store.get_request(request_id).await {
                Ok(current) if current.status == RequestStatus::Running => {}
                Ok(current) => {
                    info!(
                        "Request {} is now {}, stopping its running step",
                        request_id, current.status
                    );
                    step.cancel();
                    return;
                }
                Err(e) => debug!("Could not re-read request {}: {}", request_id, e),
            }
        }
    }

    /// Re-read the request before starting another step
    async fn is_still_running(&self, request: &DeploymentRequest) -> Result<bool, MonitorError> {
        let current = self.store.get_request(request.id).await?;
        if current.status != RequestStatus::Running {
            info!(
                "Request {} is now {}, not starting further steps",
                request.id, current.status
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Persist a result; `false` when it was cancelled meanwhile
    async fn save(
        &self,
        request: &DeploymentRequest,
        result: &DeploymentResult,
    ) -> Result<bool, MonitorError> {
        if self.store.update_deployment_result(result).await? == 0 {
            debug!(
                "Result {} of request {} was cancelled, dropping {} update",
                result.id, request.id, result.status
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// The request token fired between steps
    async fn stop_cancelled(
        &self,
        request: &DeploymentRequest,
        shutdown: &CancellationToken,
    ) -> Result<(), MonitorError> {
        if shutdown.is_cancelled() {
            info!("Request {} interrupted by shutdown or lock loss", request.id);
            return self.finish(request, RequestStatus::Failed).await;
        }
        debug!("Request {} cancelled between steps", request.id);
        Ok(())
    }

    /// Move a running request to its outcome, announcing it if this instance did
    async fn finish(
        &self,
        request: &DeploymentRequest,
        status: RequestStatus,
    ) -> Result<(), MonitorError> {
        let switched = self
            .store
            .switch_deployment_request_statuses(
                std::slice::from_ref(request),
                RequestStatus::Running,
                status,
                Some(Utc::now()),
            )
            .await?;

        if switched > 0 {
            info!("Request {} finished as {}", request.id, status);
            self.publish(request, status).await;
        } else {
            debug!(
                "Request {} moved on before it could finish as {}",
                request.id, status
            );
        }
        Ok(())
    }
}

fn component_of<'a>(
    request: &'a DeploymentRequest,
    result: &DeploymentResult,
) -> Result<&'a ComponentSpec, MonitorError> {
    request
        .detail
        .components
        .iter()
        .find(|c| c.id == result.component_id)
        .ok_or_else(|| {
            MonitorError::NotFound(format!(
                "component {} of request {}",
                result.component_id, request.id
            ))
        })
}
