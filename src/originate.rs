//! Originate a call and wait for it to be answered, fail, or ring

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    bus::EventFilter,
    command::CommandOutcome,
    connection::EslClient,
    constants::DEFAULT_ORIGINATE_TIMEOUT_MS,
    error::{EslError, EslResult},
    event::EslEventType,
    headers::EventHeader,
    jobs::JobWait,
    protocol::EslMessage,
    stream::{DisconnectReason, NextMessage},
};

/// Parameters for [`EslClient::originate`].
///
/// ```
/// use freeswitch_esl_inbound::OriginateRequest;
/// use std::time::Duration;
///
/// let request = OriginateRequest::new("sofia/gateway/carrier/15551234567")
///     .with_call_id("7f4de4bc-0b2c-4b0b-9d4c-3b9d6c1f8a10")
///     .with_variable("origination_caller_id_number", "15557654321")
///     .with_return_ring_ready(true)
///     .with_timeout(Duration::from_secs(30));
/// assert_eq!(
///     request.command_string("7f4de4bc-0b2c-4b0b-9d4c-3b9d6c1f8a10"),
///     "originate {origination_uuid=7f4de4bc-0b2c-4b0b-9d4c-3b9d6c1f8a10,\
///      origination_caller_id_number=15557654321}sofia/gateway/carrier/15551234567 &park()"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct OriginateRequest {
    endpoint: String,
    application: String,
    call_id: Option<String>,
    return_ring_ready: bool,
    variables: BTreeMap<String, String>,
    timeout: Duration,
}

impl OriginateRequest {
    /// Originate to `endpoint` and park the call once answered.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            application: "park()".to_string(),
            call_id: None,
            return_ring_ready: false,
            variables: BTreeMap::new(),
            timeout: Duration::from_millis(DEFAULT_ORIGINATE_TIMEOUT_MS),
        }
    }

    /// Application run on answer, e.g. `park()` or `echo()`.
    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = application.into();
        self
    }

    /// Use this call id instead of a generated one.
    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    /// Also finish on early media (`CHANNEL_PROGRESS` / `CHANNEL_PROGRESS_MEDIA`).
    pub fn with_return_ring_ready(mut self, return_ring_ready: bool) -> Self {
        self.return_ring_ready = return_ring_ready;
        self
    }

    /// Channel variable placed in the `{}` prefix of the dial string.
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables
            .insert(name.into(), value.into());
        self
    }

    /// Overall deadline for the whole operation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id
            .as_deref()
    }

    pub fn return_ring_ready(&self) -> bool {
        self.return_ring_ready
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `originate` command text for the given call id.
    pub fn command_string(&self, call_id: &str) -> String {
        let mut vars = vec![format!("origination_uuid={}", call_id)];
        vars.extend(
            self.variables
                .iter()
                .filter(|(name, _)| name.as_str() != "origination_uuid")
                .map(|(name, value)| format!("{}={}", name, quote_value(value))),
        );
        format!(
            "originate {{{}}}{} &{}",
            vars.join(","),
            self.endpoint,
            self.application
        )
    }

    /// Events that end the wait for `call_id`.
    pub(crate) fn terminal_filter(&self, call_id: &str) -> EventFilter {
        let filter = EventFilter::call(call_id)
            .with_event_types([EslEventType::ChannelAnswer, EslEventType::ChannelHangup]);
        if self.return_ring_ready {
            filter.with_event_types([EslEventType::ChannelProgress, EslEventType::ChannelProgressMedia])
        } else {
            filter
        }
    }
}

fn quote_value(value: &str) -> String {
    if value.contains(',') || value.contains(' ') {
        format!("'{}'", value)
    } else {
        value.to_string()
    }
}

/// How an originate attempt ended.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum OriginateOutcome {
    /// `CHANNEL_ANSWER` for the call
    Answered(Arc<EslMessage>),
    /// `CHANNEL_PROGRESS` or `CHANNEL_PROGRESS_MEDIA`, with ring-ready requested
    EarlyMedia(Arc<EslMessage>),
    /// `CHANNEL_HANGUP` before any of the above
    HungUp(Arc<EslMessage>),
    /// The `originate` job reported `-ERR`
    JobFailed(CommandOutcome),
}

/// Result of [`EslClient::originate`].
#[derive(Debug, Clone)]
pub struct OriginateResult {
    call_id: String,
    outcome: OriginateOutcome,
}

impl OriginateResult {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn outcome(&self) -> &OriginateOutcome {
        &self.outcome
    }

    /// Answered, or reached early media when that was requested.
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            OriginateOutcome::Answered(_) | OriginateOutcome::EarlyMedia(_)
        )
    }

    /// The channel event that settled the attempt, if any.
    pub fn event(&self) -> Option<&Arc<EslMessage>> {
        match &self.outcome {
            OriginateOutcome::Answered(event)
            | OriginateOutcome::EarlyMedia(event)
            | OriginateOutcome::HungUp(event) => Some(event),
            OriginateOutcome::JobFailed(_) => None,
        }
    }

    /// `Hangup-Cause` of a hangup before answer.
    pub fn hangup_cause(&self) -> Option<&str> {
        match &self.outcome {
            OriginateOutcome::HungUp(event) => event.header(EventHeader::HangupCause),
            _ => None,
        }
    }

    /// Why the call failed: the job's `-ERR` text or the hangup cause.
    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            OriginateOutcome::JobFailed(outcome) => outcome.error_message(),
            OriginateOutcome::HungUp(_) => self
                .hangup_cause()
                .or(Some("hangup")),
            _ => None,
        }
    }
}

/// One participant of the originate race produced a value.
#[derive(Debug)]
enum RaceStep {
    Job(EslResult<CommandOutcome>),
    Event(EslResult<Arc<EslMessage>>),
}

/// What the race has seen so far.
///
/// A failed job ends the race whenever it arrives. An answer or early media
/// ends it at once. A hangup is held until the job reports: FreeSWITCH
/// usually sends `CHANNEL_HANGUP` before the `-ERR` result of a failed
/// originate, and the job result is the better explanation.
#[derive(Debug, Default)]
struct RaceState {
    job_reported: bool,
    held_hangup: Option<Arc<EslMessage>>,
    failure: Option<EslError>,
}

impl RaceState {
    /// The single decision point: fold one step in and return the outcome
    /// if the race is over.
    fn settle(&mut self, step: RaceStep) -> Option<OriginateOutcome> {
        match step {
            RaceStep::Job(Ok(outcome)) if !outcome.is_success() => {
                self.job_reported = true;
                Some(OriginateOutcome::JobFailed(outcome))
            }
            RaceStep::Job(result) => {
                self.job_reported = true;
                if let Err(e) = result {
                    self.failure = Some(e);
                }
                self.held_hangup
                    .take()
                    .map(OriginateOutcome::HungUp)
            }
            RaceStep::Event(Ok(event)) => match classify(event) {
                OriginateOutcome::HungUp(event) if !self.job_reported => {
                    debug!("Hangup before job result, waiting for the job");
                    self.held_hangup = Some(event);
                    None
                }
                outcome => Some(outcome),
            },
            RaceStep::Event(Err(e)) => {
                self.failure = Some(e);
                None
            }
        }
    }

    /// The deadline passed: a held hangup still counts.
    fn expire(&mut self) -> Option<OriginateOutcome> {
        self.held_hangup
            .take()
            .map(OriginateOutcome::HungUp)
    }

    /// Neither participant can produce anything more.
    fn exhausted(&mut self) -> EslResult<OriginateOutcome> {
        if let Some(outcome) = self.expire() {
            return Ok(outcome);
        }
        Err(self
            .failure
            .take()
            .unwrap_or(EslError::StreamClosed {
                reason: DisconnectReason::ConnectionClosed,
            }))
    }
}

fn classify(event: Arc<EslMessage>) -> OriginateOutcome {
    match event.event_type() {
        Some(EslEventType::ChannelAnswer) => OriginateOutcome::Answered(event),
        Some(t) if t.is_early_media() => OriginateOutcome::EarlyMedia(event),
        _ => OriginateOutcome::HungUp(event),
    }
}

async fn next_step(job: Option<&mut JobWait>, event: Option<&mut NextMessage>) -> RaceStep {
    match (job, event) {
        (Some(j), Some(e)) => tokio::select! {
            biased;
            r = j => RaceStep::Job(r),
            r = e => RaceStep::Event(r),
        },
        (Some(j), None) => RaceStep::Job(j.await),
        (None, Some(e)) => RaceStep::Event(e.await),
        (None, None) => std::future::pending().await,
    }
}

/// Race the job result against the channel event until `deadline`.
///
/// The job is polled first, so a failure wins over an event that is ready at
/// the same time. `Ok(None)` means nothing conclusive happened in time.
async fn race(
    job: JobWait,
    event: NextMessage,
    deadline: Instant,
) -> EslResult<Option<OriginateOutcome>> {
    let mut job = Some(job);
    let mut event = Some(event);
    let mut state = RaceState::default();

    loop {
        if job.is_none() && event.is_none() {
            return state
                .exhausted()
                .map(Some);
        }
        let step = match timeout_at(deadline, next_step(job.as_mut(), event.as_mut())).await {
            Ok(step) => step,
            Err(_) => return Ok(state.expire()),
        };
        match step {
            RaceStep::Job(_) => job = None,
            RaceStep::Event(_) => event = None,
        }
        if let Some(outcome) = state.settle(step) {
            return Ok(Some(outcome));
        }
    }
}

impl EslClient {
    /// Originate a call and wait until it is answered, hangs up, the job
    /// fails, or (with ring-ready) early media starts, whichever comes first.
    ///
    /// The channel event wait is registered before the command is sent.
    /// A failed job wins even when it arrives after the hangup; a hangup still
    /// waiting on its job at the deadline is returned as is. Fails with
    /// [`EslError::Timeout`] when nothing conclusive happens within the
    /// request's timeout, and with [`EslError::StreamClosed`] if the
    /// connection ends first.
    ///
    /// The connection must already be subscribed to `BACKGROUND_JOB`,
    /// `CHANNEL_ANSWER` and `CHANNEL_HANGUP` (plus `CHANNEL_PROGRESS` and
    /// `CHANNEL_PROGRESS_MEDIA` with ring-ready) through
    /// [`subscribe_events`](EslClient::subscribe_events). Otherwise nothing
    /// ever arrives and the call runs into the timeout.
    ///
    /// ```rust,no_run
    /// # async fn example(client: &freeswitch_esl_inbound::EslClient) -> Result<(), freeswitch_esl_inbound::EslError> {
    /// use freeswitch_esl_inbound::OriginateRequest;
    ///
    /// let result = client
    ///     .originate(OriginateRequest::new("user/1000").with_application("echo()"))
    ///     .await?;
    /// if !result.is_success() {
    ///     println!("call failed: {}", result.error_message().unwrap_or("unknown"));
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn originate(&self, request: OriginateRequest) -> EslResult<OriginateResult> {
        let call_id = request
            .call_id()
            .map(str::to_string)
            .unwrap_or_else(|| {
                Uuid::new_v4()
                    .to_string()
            });
        let deadline = Instant::now() + request.timeout();

        let event = self
            .bus
            .next_matching(request.terminal_filter(&call_id));
        info!(
            "Originating call {} to {} &{}",
            call_id,
            request.endpoint(),
            request.application()
        );
        let job_id = self
            .issue_background_command(&request.command_string(&call_id))
            .await?;

        let job = self
            .jobs
            .wait(&job_id);
        let result = race(job, event, deadline).await;
        self.jobs
            .forget(&job_id);

        let Some(outcome) = result? else {
            debug!("Originate of call {} timed out", call_id);
            return Err(EslError::Timeout {
                timeout_ms: request
                    .timeout()
                    .as_millis() as u64,
            });
        };
        debug!("Originate of call {} settled: {:?}", call_id, outcome);
        Ok(OriginateResult { call_id, outcome })
    }
}
