//! The deploy gate state machine
//!
//! One [`StepGate`] exists per paused deploy step. It moves through
//!
//! ```text
//! pending --submit_for_deploy--> submitting --accepted--> submitted --confirm_success--> deployed
//!    |                               |                        |
//!    +----------- abort / stop / rejected deploy / bad params ---------------------> aborted
//! ```
//!
//! Every transition runs under the gate's own lock, and the "already settled"
//! check happens before anything leaves the process. The deploy request is
//! the one network call made by the gate itself; it is issued on the worker
//! pool with the lock released and the gate parked in `submitting`, which
//! any competing submission sees and refuses. Lifecycle notices go through the gate's
//! [`NoticeQueue`] and never hold up a transition.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::callback::{
    CallbackClient, CallbackError, GateDescriptor, Identity, NoticeQueue, NoticeType,
    NotificationDispatcher,
};
use crate::gate::error::GateError;
use crate::gate::outcome::{FlowInterrupted, GateState, InterruptionCause, Outcome};
use crate::gate::permission::{AccessControl, PermissionEvaluator, Principal};
use crate::gate::pool::WorkerPool;
use crate::gate::registry::GateRegistry;
use crate::host::{
    raw_encode, ExecutionLocator, MarkerKind, RunHandle, RunInfo, RunMarker, RunStore, Suspendable,
};
use crate::pipeline::{
    is_deploy_request, params_value, parse_form, DeployRequest, DeployStep, GateConfig, Params,
};

/// Label of the pause a gate puts on its flow node
pub const PAUSE_LABEL: &str = "Input";

/// Process-wide collaborators shared by every gate
#[derive(Clone)]
pub struct GateServices {
    pub config: Arc<GateConfig>,
    pub dispatcher: NotificationDispatcher,
    pub permissions: PermissionEvaluator,
    pub pool: WorkerPool,
}

impl GateServices {
    pub fn new(
        config: GateConfig,
        access: Arc<dyn AccessControl>,
        runtime: Handle,
    ) -> Result<Self, CallbackError> {
        let config = Arc::new(config);
        let client = CallbackClient::new(config.http.clone())?;
        Ok(Self {
            dispatcher: NotificationDispatcher::new(client, Arc::clone(&config)),
            permissions: PermissionEvaluator::new(access),
            pool: WorkerPool::new(runtime, config.notice_workers),
            config,
        })
    }

    /// Services using the security table of `config`
    pub fn from_config(config: GateConfig, runtime: Handle) -> Result<Self, CallbackError> {
        let access = Arc::new(config.security.clone());
        Self::new(config, access, runtime)
    }

    /// Registry of a run that has just started
    pub fn registry(&self, run: RunInfo, store: Arc<dyn RunStore>) -> GateRegistry {
        GateRegistry::new(run, store).with_load_timeout(self.config.load_executions_timeout())
    }

    /// Registry of a run restored after a restart, reconciled within the
    /// configured load timeout
    pub async fn reopen_registry(
        &self,
        run: RunInfo,
        store: Arc<dyn RunStore>,
        locator: Arc<dyn ExecutionLocator>,
    ) -> Result<GateRegistry, GateError> {
        let registry = GateRegistry::reopen(run, store, locator).await?;
        Ok(registry.with_load_timeout(self.config.load_executions_timeout()))
    }
}

pub struct StepGate {
    step: DeployStep,
    id: String,
    node_id: String,
    run: Arc<RunHandle>,
    context: Arc<dyn Suspendable>,
    services: Arc<GateServices>,
    descriptor: GateDescriptor,
    notices: NoticeQueue,
    outcome: Mutex<Option<Outcome>>,
    resumed: AtomicBool,
}

/// Which checks an abort goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortRoute {
    /// A user on the gate's page; refused while a release is in flight
    Interactive,
    Direct,
    /// The deployment system reporting a failed release
    Deployer,
}

fn identity_of(principal: &Principal) -> Option<Identity> {
    if principal.is_system() || principal.name().is_empty() {
        return None;
    }
    Some(Identity::new(None, Some(principal.name().to_string())))
}

impl StepGate {
    pub fn new(
        step: DeployStep,
        node_id: impl Into<String>,
        run: Arc<RunHandle>,
        context: Arc<dyn Suspendable>,
        services: Arc<GateServices>,
    ) -> Arc<Self> {
        let id = step.id();
        let node_id = node_id.into();
        let descriptor = GateDescriptor {
            run_id: run.info.number,
            step_id: id.clone(),
            node_id: node_id.clone(),
            pipeline_name: run.info.pipeline_name.clone(),
            pipeline_full_name: run.info.pipeline_full_name.clone(),
            devops_id: run.info.devops_id.clone(),
            submitter: step.submitter().map(str::to_string),
        };
        let notices = NoticeQueue::start(
            services.dispatcher.clone(),
            descriptor.clone(),
            &services.pool,
        );

        Arc::new(Self {
            step,
            id,
            node_id,
            run,
            context,
            services,
            descriptor,
            notices,
            outcome: Mutex::new(None),
            resumed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn step(&self) -> &DeployStep {
        &self.step
    }

    pub fn run(&self) -> &RunInfo {
        &self.run.info
    }

    pub fn descriptor(&self) -> &GateDescriptor {
        &self.descriptor
    }

    pub fn display_name(&self) -> String {
        self.step.display_name()
    }

    pub async fn outcome(&self) -> Option<Outcome> {
        self.outcome.lock().await.clone()
    }

    pub async fn state(&self) -> GateState {
        self.outcome
            .lock()
            .await
            .as_ref()
            .map(Outcome::state)
            .unwrap_or(GateState::Pending)
    }

    /// Deployed or aborted
    pub async fn is_settled(&self) -> bool {
        self.state().await.is_terminal()
    }

    /// Whether the workflow has been resumed
    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::SeqCst)
    }

    /// Wait until every notice queued so far has been delivered. Only
    /// returns once the gate is settled or the queue is closed.
    pub async fn notices_drained(&self) {
        self.notices.drained().await
    }

    fn job(&self) -> &str {
        self.run.job()
    }

    fn already_settled(&self, state: GateState) -> GateError {
        GateError::AlreadySettled {
            id: self.id.clone(),
            state,
        }
    }

    fn check_settle(&self, principal: &Principal) -> Result<(), GateError> {
        let submitter = self.step.submitter();
        if self
            .services
            .permissions
            .can_settle(principal, submitter, self.job())
        {
            Ok(())
        } else {
            Err(GateError::PermissionDenied(
                PermissionEvaluator::submit_denied(submitter),
            ))
        }
    }

    /// Pause the flow node, announce the gate and make it reachable by id
    pub async fn open(self: &Arc<Self>) -> Result<(), GateError> {
        let _outcome = self.outcome.lock().await;

        if let Err(e) = self.context.pause(PAUSE_LABEL) {
            warn!(gate = %self.id, "Failed to pause node {}: {}", self.node_id, e);
        }
        self.print_links();

        if let Err(e) = self.run.registry.add(Arc::clone(self)).await {
            self.notices.close();
            if let Err(pause) = self.context.end_pause() {
                warn!(gate = %self.id, "Failed to end pause of node {}: {}", self.node_id, pause);
            }
            return Err(e);
        }
        self.notices.push(NoticeType::Ready, None);

        info!(gate = %self.id, run = %self.run.info, "gate opened");
        Ok(())
    }

    fn print_links(&self) {
        let base = format!("/{}deploy/", self.run.info.url);
        if self.step.parameters().is_empty() && self.step.submitter_parameter().is_none() {
            let url = format!("{}{}/", base, raw_encode(&self.id));
            self.run.log.println(self.step.message());
            self.run.log.println(&format!(
                "{}: POST {}proceedEmpty or Abort: POST {}abort",
                self.step.ok(),
                url,
                url
            ));
        } else {
            self.run.log.println(&format!("Deploy requested: {}", base));
        }
    }

    /// Settle and check that nobody else did first. Only checks, never mutates.
    pub async fn pre_submission_check(&self, principal: &Principal) -> Result<(), GateError> {
        let outcome = self.outcome.lock().await;
        if let Some(current) = outcome.as_ref().filter(|o| o.state().is_terminal()) {
            return Err(self.already_settled(current.state()));
        }
        self.check_settle(principal)
    }

    /// Phase 1: ask the deployment system to start the release.
    ///
    /// Missing deploy fields abort the gate and are reported back as
    /// [`GateError::InvalidParameters`]. A refused deploy request aborts the
    /// gate and returns `Ok(GateState::Aborted)`. The request and the
    /// transition that follows it run on the worker pool, so the gate still
    /// leaves `submitting` if the caller stops waiting.
    pub async fn submit_for_deploy(
        self: &Arc<Self>,
        principal: &Principal,
        params: Params,
    ) -> Result<GateState, GateError> {
        let request = {
            let mut outcome = self.outcome.lock().await;
            if let Some(current) = outcome.as_ref() {
                return Err(self.already_settled(current.state()));
            }
            self.check_settle(principal)?;

            info!(gate = %self.id, "Deploy requested by {}", principal.name());
            self.run
                .log
                .println(&format!("Deploy requested by {}", principal.name()));

            match DeployRequest::from_params(&params, &self.node_id) {
                Ok(request) => {
                    *outcome = Some(Outcome::Submitting);
                    request
                }
                Err(e) => {
                    let message = match &e {
                        GateError::InvalidParameters(message) => message.clone(),
                        other => other.to_string(),
                    };
                    warn!(gate = %self.id, "{}", message);
                    let failure = FlowInterrupted::new(InterruptionCause::param_error(message));
                    self.settle(
                        &mut outcome,
                        Outcome::aborted(failure, false, false),
                        identity_of(principal),
                    )
                    .await;
                    return Err(e);
                }
            }
        };

        let gate = Arc::clone(self);
        let task = self
            .services
            .pool
            .spawn_with_output(async move { gate.finish_submission(request, params).await });

        match task.await {
            Ok(Some(result)) => result,
            Ok(None) => Err(GateError::StateUnavailable(format!(
                "deploy request of gate {} failed",
                self.id
            ))),
            Err(e) => Err(GateError::StateUnavailable(format!(
                "deploy request of gate {} did not complete: {}",
                self.id, e
            ))),
        }
    }

    async fn finish_submission(
        &self,
        request: DeployRequest,
        params: Params,
    ) -> Result<GateState, GateError> {
        let accepted = AssertUnwindSafe(
            self.services
                .dispatcher
                .request_deploy(&request, &self.descriptor),
        )
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!(gate = %self.id, "deploy request panicked");
            false
        });

        let mut outcome = self.outcome.lock().await;
        if !matches!(outcome.as_ref(), Some(Outcome::Submitting)) {
            let state = outcome
                .as_ref()
                .map(Outcome::state)
                .unwrap_or(GateState::Pending);
            warn!(
                gate = %self.id,
                accepted,
                "gate became {} while its deploy request was in flight",
                state
            );
            return Err(self.already_settled(state));
        }

        if accepted {
            *outcome = Some(Outcome::Submitted {
                value: Some(params_value(params)),
            });
            self.run.annotator.add_marker(RunMarker::Deploying {
                gate_id: self.id.clone(),
            });
            self.notices
                .push(NoticeType::Submitted, Some(request.identity()));
            info!(gate = %self.id, run = %self.run.info, "deploy request accepted");
            Ok(GateState::Submitted)
        } else {
            let failure = FlowInterrupted::new(InterruptionCause::deploy_rejected());
            self.run.log.println(&failure.to_string());
            self.settle(
                &mut outcome,
                Outcome::aborted(failure, false, false),
                Some(request.identity()),
            )
            .await;
            Ok(GateState::Aborted)
        }
    }

    /// Phase 2: the deployment system reports the release as done.
    ///
    /// Needs an accepted deploy request; no further permission is checked.
    pub async fn confirm_success(
        &self,
        principal: &Principal,
        params: Option<Params>,
    ) -> Result<GateState, GateError> {
        let mut outcome = self.outcome.lock().await;
        let value = match outcome.as_ref() {
            None | Some(Outcome::Submitting) => {
                return Err(GateError::NotSubmitted(self.id.clone()))
            }
            Some(Outcome::Submitted { value }) => value.clone(),
            Some(other) => return Err(self.already_settled(other.state())),
        };

        self.run.log.println("Deploy succeed.");
        let approver = identity_of(principal).map(|_| principal.name().to_string());
        if let Some(user) = &approver {
            self.run.annotator.add_marker(RunMarker::ApprovedBy {
                user_id: user.clone(),
            });
            self.run.log.println(&format!("Deploy succeed by {}", user));
        }
        self.run.annotator.add_marker(RunMarker::DeploySubmitted {
            gate_id: self.id.clone(),
            approver,
            parameters: params.map(params_value),
        });

        self.settle(
            &mut outcome,
            Outcome::Deployed { value },
            identity_of(principal),
        )
        .await;
        Ok(GateState::Deployed)
    }

    /// Abort on behalf of `principal`. An `interactive` abort is refused once
    /// a deploy request is in flight.
    pub async fn abort(
        &self,
        principal: &Principal,
        params: Option<Params>,
        interactive: bool,
    ) -> Result<GateState, GateError> {
        let cause = InterruptionCause::rejected_by(principal);
        let route = if interactive {
            AbortRoute::Interactive
        } else {
            AbortRoute::Direct
        };
        self.abort_with(principal, cause, params, route).await
    }

    /// The deployment system reports that the release failed. Only
    /// deployers may do this, in flight or not.
    pub async fn report_failure(
        &self,
        principal: &Principal,
        params: Option<Params>,
    ) -> Result<GateState, GateError> {
        let cause = InterruptionCause::rejected_by(principal);
        self.abort_with(principal, cause, params, AbortRoute::Deployer)
            .await
    }

    async fn abort_with(
        &self,
        principal: &Principal,
        cause: InterruptionCause,
        params: Option<Params>,
        route: AbortRoute,
    ) -> Result<GateState, GateError> {
        let mut outcome = self.outcome.lock().await;
        if let Some(current) = outcome.as_ref().filter(|o| o.state().is_terminal()) {
            return Err(self.already_settled(current.state()));
        }

        let submitter = self.step.submitter();
        let permissions = &self.services.permissions;
        match route {
            AbortRoute::Deployer => {
                if !permissions.can_report(principal, self.job()) {
                    return Err(GateError::PermissionDenied(
                        PermissionEvaluator::report_denied(),
                    ));
                }
            }
            AbortRoute::Interactive | AbortRoute::Direct => {
                if !permissions.can_abort(principal, submitter, self.job()) {
                    return Err(GateError::PermissionDenied(
                        PermissionEvaluator::cancel_denied(submitter),
                    ));
                }
            }
        }

        if route == AbortRoute::Interactive
            && matches!(
                outcome.as_ref(),
                Some(Outcome::Submitting | Outcome::Submitted { .. })
            )
        {
            return Err(GateError::ReleaseInFlight(self.id.clone()));
        }

        if let Some(params) = &params {
            debug!(gate = %self.id, "abort parameters: {:?}", params);
        }

        let submitted = outcome.as_ref().map(Outcome::is_submitted).unwrap_or(false);
        let failure = FlowInterrupted::new(cause);
        self.run.log.println(&failure.to_string());
        self.settle(
            &mut outcome,
            Outcome::aborted(failure, submitted, false),
            identity_of(principal),
        )
        .await;
        Ok(GateState::Aborted)
    }

    /// Route a submission: a non-empty `deploy` field starts phase 1,
    /// anything else reports phase 2
    pub async fn proceed(
        self: &Arc<Self>,
        principal: &Principal,
        params: Option<Params>,
    ) -> Result<GateState, GateError> {
        match params {
            Some(params) if is_deploy_request(Some(&params)) => {
                self.submit_for_deploy(principal, params).await
            }
            params => self.confirm_success(principal, params).await,
        }
    }

    /// Proceed with no parameters
    pub async fn proceed_empty(
        self: &Arc<Self>,
        principal: &Principal,
    ) -> Result<GateState, GateError> {
        self.pre_submission_check(principal).await?;
        self.proceed(principal, None).await
    }

    /// Proceed with a submitted form, parsed against the declared parameters
    pub async fn proceed_form(
        self: &Arc<Self>,
        principal: &Principal,
        form: &Value,
    ) -> Result<GateState, GateError> {
        self.pre_submission_check(principal).await?;
        let params = parse_form(
            self.step.parameters(),
            form,
            self.step.submitter_parameter(),
            principal.name(),
        )?;
        self.proceed(principal, params).await
    }

    /// Proceed when the form carries a `proceed` entry, abort otherwise
    pub async fn submit(
        self: &Arc<Self>,
        principal: &Principal,
        form: &Value,
    ) -> Result<GateState, GateError> {
        if form.get("proceed").is_some() {
            self.proceed_form(principal, form).await
        } else {
            self.abort(principal, None, true).await
        }
    }

    /// Called by the engine when the run is being stopped. The abort runs on
    /// the worker pool as the system principal.
    pub fn stop(self: &Arc<Self>, reason: impl Into<String>) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        let cause = InterruptionCause::stopped(reason);
        self.services.pool.spawn(async move {
            let system = Principal::system();
            match gate.abort_with(&system, cause, None, AbortRoute::Direct).await {
                Ok(_) => info!(gate = %gate.id, "stopped"),
                Err(GateError::AlreadySettled { state, .. }) => {
                    debug!(gate = %gate.id, "stop ignored, gate is {}", state)
                }
                Err(e) => warn!(gate = %gate.id, "Failed to stop: {}", e),
            }
        })
    }

    /// Record a terminal outcome and resume the workflow. Callers hold the
    /// outcome lock and have already checked that the gate was not settled.
    async fn settle(&self, slot: &mut Option<Outcome>, outcome: Outcome, identity: Option<Identity>) {
        *slot = Some(outcome.clone());

        let notice = if outcome.is_failure() {
            NoticeType::Abort
        } else {
            NoticeType::Success
        };
        self.notices.push(notice, identity);
        self.notices.close();

        self.run
            .annotator
            .remove_marker(MarkerKind::Deploying, &self.id);

        match self.run.registry.remove(self).await {
            Ok(true) => {}
            Ok(false) => debug!(gate = %self.id, "was not registered"),
            Err(e) => warn!(gate = %self.id, "Failed to unregister from {}: {}", self.run.info, e),
        }

        if let Err(e) = self.context.end_pause() {
            warn!(gate = %self.id, "Failed to end pause in {}: {}", self.run.info, e);
        }

        info!(gate = %self.id, run = %self.run.info, "settled: {}", outcome);
        self.resume(&outcome);
    }

    fn resume(&self, outcome: &Outcome) {
        if self.resumed.swap(true, Ordering::SeqCst) {
            error!(gate = %self.id, "refusing to resume the workflow twice");
            return;
        }
        match outcome.failure() {
            Some(failure) => self.context.on_failure(failure.clone()),
            None => self.context.on_success(outcome.value().cloned()),
        }
    }
}

impl std::fmt::Debug for StepGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepGate")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("run", &self.run.info)
            .finish()
    }
}
