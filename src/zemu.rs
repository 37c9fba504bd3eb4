/*******************************************************************************
*   (c) 2020 ZondaX GmbH
*
*  Licensed under the Apache License, Version 2.0 (the "License");
*  you may not use this file except in compliance with the License.
*  You may obtain a copy of the License at
*
*      http://www.apache.org/licenses/LICENSE-2.0
*
*  Unless required by applicable law or agreed to in writing, software
*  distributed under the License is distributed on an "AS IS" BASIS,
*  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
*  See the License for the specific language governing permissions and
*  limitations under the License.
********************************************************************************/
//! Emulated device sessions and the on-screen confirmation flow
//!
//! The emulator renders asynchronously relative to the host issuing a
//! command, so interactive requests are split into separate steps: issue
//! without blocking, watch the screen leave the idle state, inject the
//! acceptance input, then resolve the deferred response. Screen content
//! can be asserted between any two of those steps.

#![deny(warnings, trivial_casts, trivial_numeric_casts)]
#![deny(unused_import_braces, unused_qualifications)]
#![deny(missing_docs)]

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ledger_transport::{APDUAnswer, APDUCommand, Exchange};
use tokio::task::JoinHandle;
use tokio::time;

/// Physical buttons on click-driven models
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Button {
    /// Left button
    Left,
    /// Right button
    Right,
    /// Both buttons at once
    Both,
}

/// Hardware models the harness drives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceModel {
    /// Ledger Nano S
    NanoS,
    /// Ledger Nano S Plus
    NanoSP,
    /// Ledger Nano X
    NanoX,
    /// Ledger Stax
    Stax,
    /// Ledger Flex
    Flex,
}

impl DeviceModel {
    /// Snapshot name prefix for this model
    pub fn prefix(&self) -> &'static str {
        match self {
            DeviceModel::NanoS => "s",
            DeviceModel::NanoSP => "sp",
            DeviceModel::NanoX => "x",
            DeviceModel::Stax => "st",
            DeviceModel::Flex => "fl",
        }
    }

    /// Whether the review flow is tap-driven rather than button-driven
    pub fn is_touch(&self) -> bool {
        matches!(self, DeviceModel::Stax | DeviceModel::Flex)
    }
}

/// What the harness needs from a running device emulator.
///
/// Session start and stop stay with the implementor; one session serves
/// all scenarios for a device model and is torn down when the value is
/// dropped.
#[async_trait]
pub trait Simulator: Send + Sync {
    /// Emulator side failure
    type Error: std::error::Error + Send + Sync + 'static;

    /// Run one raw APDU exchange against the app
    async fn exchange_raw(&self, apdu: &[u8]) -> Result<Vec<u8>, Self::Error>;

    /// Content of the screen the device currently renders
    async fn screen(&self) -> Result<Vec<u8>, Self::Error>;

    /// Text currently rendered, for keyword-gated approvals
    async fn screen_text(&self) -> Result<String, Self::Error>;

    /// Reference content of the app's idle/main menu screen
    fn main_menu(&self) -> Vec<u8>;

    /// Inject a button event
    async fn click(&self, button: Button) -> Result<(), Self::Error>;

    /// Inject a tap at the given screen coordinate
    async fn tap(&self, x: u16, y: u16) -> Result<(), Self::Error>;

    /// Compare the review flow against a named golden reference and drive
    /// it to approval; image diffing happens on the emulator side
    async fn approve_with_golden(&self, reference: &str) -> Result<(), Self::Error>;

    /// Toggle the app's expert mode
    async fn toggle_expert_mode(&self) -> Result<(), Self::Error>;
}

/// Errors crossing the simulator transport
#[derive(Debug, thiserror::Error)]
pub enum SimTransportError<E: std::error::Error> {
    /// The emulator failed to execute the exchange
    #[error("simulator error: {0}")]
    Sim(E),

    /// The answer was too short to carry a status word
    #[error("answer too short to carry a status word")]
    MalformedAnswer,
}

/// [`Exchange`] adapter over a [`Simulator`].
///
/// Exchanges are serialized through an internal lock; the device executes
/// one APDU at a time.
pub struct SimTransport<S> {
    sim: Arc<S>,
    busy: tokio::sync::Mutex<()>,
}

impl<S> SimTransport<S> {
    /// Wrap a running simulator session
    pub fn new(sim: Arc<S>) -> Self {
        SimTransport {
            sim,
            busy: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl<S> Exchange for SimTransport<S>
where
    S: Simulator,
{
    type Error = SimTransportError<S::Error>;
    type AnswerType = Vec<u8>;

    async fn exchange<I>(
        &self,
        command: &APDUCommand<I>,
    ) -> Result<APDUAnswer<Self::AnswerType>, Self::Error>
    where
        I: Deref<Target = [u8]> + Send + Sync,
    {
        let _guard = self.busy.lock().await;

        let raw = self
            .sim
            .exchange_raw(&command.serialize())
            .await
            .map_err(SimTransportError::Sim)?;

        APDUAnswer::from_answer(raw).map_err(|_| SimTransportError::MalformedAnswer)
    }
}

/// Observable progress of an interactive request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationState {
    /// Device on the home screen, nothing pending
    Idle,
    /// Request issued, review not on screen yet
    AwaitingRequest,
    /// Review flow on screen
    Displaying,
    /// Acceptance input delivered
    Approved,
    /// Deferred response resolved
    Completed,
}

/// How a review flow is accepted once it is on screen
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalAction {
    /// Page through a linear review with right clicks, then accept with
    /// both buttons
    Buttons {
        /// Right clicks needed to reach the approval screen
        review_pages: usize,
    },
    /// Tap the approve control, optionally once `keyword` shows up in the
    /// rendered text
    Tap {
        /// Tap x coordinate
        x: u16,
        /// Tap y coordinate
        y: u16,
        /// Keyword gating the tap
        keyword: Option<String>,
    },
    /// Let the golden-image collaborator page, compare and approve
    Golden {
        /// Reference name for the comparison
        reference: String,
    },
}

/// Per-scenario confirmation parameters
#[derive(Clone, Debug)]
pub struct ConfirmationPolicy {
    /// How long the device may take to leave the idle screen
    pub review_deadline: Duration,
    /// Poll interval while watching the screen
    pub poll_interval: Duration,
    /// Acceptance modality
    pub action: ApprovalAction,
}

impl ConfirmationPolicy {
    /// Policy with the default deadlines and the given acceptance action
    pub fn new(action: ApprovalAction) -> Self {
        ConfirmationPolicy {
            review_deadline: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            action,
        }
    }

    /// Override the review deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.review_deadline = deadline;
        self
    }

    /// Override the poll interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Handle to a response that resolves once the confirmation flow ends
pub struct PendingResponse<T> {
    handle: JoinHandle<T>,
}

impl<T> PendingResponse<T> {
    /// Whether the device already answered
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Failures while driving a confirmation flow
#[derive(Debug, thiserror::Error)]
pub enum ConfirmationError<E: std::error::Error> {
    /// The device never left the idle screen before the deadline
    #[error("device did not leave the idle screen within {0:?}")]
    ReviewTimeout(Duration),

    /// The gating keyword never appeared on screen
    #[error("approval keyword {0:?} never appeared on screen")]
    KeywordTimeout(String),

    /// Emulator failure
    #[error("simulator error: {0}")]
    Simulator(#[from] E),

    /// The pending request task went away before resolving
    #[error("pending response task was aborted")]
    Aborted,
}

/// Drives an interactive request from issuance to the resolved response.
///
/// Issuing, watching the screen, accepting and receiving are separate
/// steps so intermediate screen content can be asserted while the
/// request is pending.
pub struct ConfirmationDriver<S: Simulator> {
    sim: Arc<S>,
    policy: ConfirmationPolicy,
    state: ConfirmationState,
}

impl<S: Simulator> ConfirmationDriver<S> {
    /// New driver over a running session
    pub fn new(sim: Arc<S>, policy: ConfirmationPolicy) -> Self {
        ConfirmationDriver {
            sim,
            policy,
            state: ConfirmationState::Idle,
        }
    }

    /// Current state of the flow
    pub fn state(&self) -> ConfirmationState {
        self.state
    }

    /// Issue a request without waiting for the device to answer.
    ///
    /// The future is spawned on the current tokio runtime; the returned
    /// handle resolves once the device replies, which for interactive
    /// commands happens only after the review ends.
    pub fn submit<F, T>(&mut self, request: F) -> PendingResponse<T>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        log::debug!("issuing interactive request");
        self.state = ConfirmationState::AwaitingRequest;
        PendingResponse {
            handle: tokio::spawn(request),
        }
    }

    /// Wait until the device stops showing the idle screen.
    ///
    /// Bounded by the policy deadline; running into it is a harness
    /// failure, not a device verdict.
    pub async fn wait_for_review(&mut self) -> Result<(), ConfirmationError<S::Error>> {
        let deadline = self.policy.review_deadline;
        let outcome = time::timeout(deadline, self.watch_screen_change()).await;

        match outcome {
            Ok(result) => {
                result?;
                log::debug!("review flow on screen");
                self.state = ConfirmationState::Displaying;
                Ok(())
            }
            Err(_) => Err(ConfirmationError::ReviewTimeout(deadline)),
        }
    }

    /// Drive the acceptance input for the review currently on screen
    pub async fn approve(&mut self) -> Result<(), ConfirmationError<S::Error>> {
        match self.policy.action.clone() {
            ApprovalAction::Buttons { review_pages } => {
                for _ in 0..review_pages {
                    self.sim.click(Button::Right).await?;
                }
                self.sim.click(Button::Both).await?;
            }
            ApprovalAction::Tap { x, y, keyword } => {
                if let Some(keyword) = keyword {
                    self.wait_for_keyword(&keyword).await?;
                }
                self.sim.tap(x, y).await?;
            }
            ApprovalAction::Golden { reference } => {
                self.sim.approve_with_golden(&reference).await?;
            }
        }

        log::debug!("review accepted");
        self.state = ConfirmationState::Approved;
        Ok(())
    }

    /// Resolve the deferred response.
    ///
    /// Valid from any state: requests the app rejects outright resolve
    /// without a review ever appearing.
    pub async fn complete<T>(
        &mut self,
        pending: PendingResponse<T>,
    ) -> Result<T, ConfirmationError<S::Error>> {
        let outcome = pending
            .handle
            .await
            .map_err(|_| ConfirmationError::Aborted)?;

        log::debug!("deferred response resolved");
        self.state = ConfirmationState::Completed;
        Ok(outcome)
    }

    async fn watch_screen_change(&self) -> Result<(), ConfirmationError<S::Error>> {
        let idle = self.sim.main_menu();

        loop {
            let screen = self.sim.screen().await?;
            if screen != idle {
                return Ok(());
            }
            time::sleep(self.policy.poll_interval).await;
        }
    }

    async fn wait_for_keyword(&self, keyword: &str) -> Result<(), ConfirmationError<S::Error>> {
        match time::timeout(self.policy.review_deadline, self.watch_keyword(keyword)).await {
            Ok(result) => result,
            Err(_) => Err(ConfirmationError::KeywordTimeout(keyword.to_owned())),
        }
    }

    async fn watch_keyword(&self, keyword: &str) -> Result<(), ConfirmationError<S::Error>> {
        loop {
            let text = self.sim.screen_text().await?;
            if text.contains(keyword) {
                return Ok(());
            }
            time::sleep(self.policy.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    struct FlowSim {
        review: AtomicBool,
        truncate: AtomicBool,
        right_clicks: AtomicUsize,
        both_clicks: AtomicUsize,
        golden: std::sync::Mutex<Option<String>>,
        approvals: Arc<Semaphore>,
    }

    impl FlowSim {
        fn new() -> Self {
            FlowSim {
                review: AtomicBool::new(false),
                truncate: AtomicBool::new(false),
                right_clicks: AtomicUsize::new(0),
                both_clicks: AtomicUsize::new(0),
                golden: std::sync::Mutex::new(None),
                approvals: Arc::new(Semaphore::new(0)),
            }
        }
    }

    #[async_trait]
    impl Simulator for FlowSim {
        type Error = Infallible;

        async fn exchange_raw(&self, _apdu: &[u8]) -> Result<Vec<u8>, Infallible> {
            if self.truncate.load(Ordering::SeqCst) {
                Ok(vec![0x90])
            } else {
                Ok(vec![0x90, 0x00])
            }
        }

        async fn screen(&self) -> Result<Vec<u8>, Infallible> {
            Ok(if self.review.load(Ordering::SeqCst) {
                b"review".to_vec()
            } else {
                b"idle".to_vec()
            })
        }

        async fn screen_text(&self) -> Result<String, Infallible> {
            Ok(if self.review.load(Ordering::SeqCst) {
                "Verify address QR".to_owned()
            } else {
                "Desmos ready".to_owned()
            })
        }

        fn main_menu(&self) -> Vec<u8> {
            b"idle".to_vec()
        }

        async fn click(&self, button: Button) -> Result<(), Infallible> {
            match button {
                Button::Right => {
                    self.right_clicks.fetch_add(1, Ordering::SeqCst);
                }
                Button::Both => {
                    self.both_clicks.fetch_add(1, Ordering::SeqCst);
                    self.approvals.add_permits(1);
                }
                Button::Left => {}
            }
            Ok(())
        }

        async fn tap(&self, _x: u16, _y: u16) -> Result<(), Infallible> {
            self.approvals.add_permits(1);
            Ok(())
        }

        async fn approve_with_golden(&self, reference: &str) -> Result<(), Infallible> {
            *self.golden.lock().unwrap() = Some(reference.to_owned());
            self.approvals.add_permits(1);
            Ok(())
        }

        async fn toggle_expert_mode(&self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    fn pending_answer(sim: &FlowSim) -> impl std::future::Future<Output = u32> + Send + 'static {
        let approvals = Arc::clone(&sim.approvals);
        async move {
            let permit = approvals.acquire().await.unwrap();
            permit.forget();
            42u32
        }
    }

    #[tokio::test]
    async fn review_timeout_is_bounded() {
        let sim = Arc::new(FlowSim::new());
        let policy = ConfirmationPolicy::new(ApprovalAction::Buttons { review_pages: 2 })
            .with_deadline(Duration::from_millis(80))
            .with_poll_interval(Duration::from_millis(10));
        let mut driver = ConfirmationDriver::new(sim, policy);

        match driver.wait_for_review().await {
            Err(ConfirmationError::ReviewTimeout(_)) => {}
            other => panic!("expected a review timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn tap_flow_resolves_after_approval() {
        let sim = Arc::new(FlowSim::new());
        let policy = ConfirmationPolicy::new(ApprovalAction::Tap {
            x: 200,
            y: 550,
            keyword: Some("QR".to_owned()),
        })
        .with_poll_interval(Duration::from_millis(5));
        let mut driver = ConfirmationDriver::new(Arc::clone(&sim), policy);
        assert_eq!(driver.state(), ConfirmationState::Idle);

        let pending = driver.submit(pending_answer(&sim));
        assert_eq!(driver.state(), ConfirmationState::AwaitingRequest);
        assert!(!pending.is_finished());

        // the device renders the review asynchronously
        sim.review.store(true, Ordering::SeqCst);

        driver.wait_for_review().await.unwrap();
        assert_eq!(driver.state(), ConfirmationState::Displaying);
        assert!(!pending.is_finished());

        driver.approve().await.unwrap();
        assert_eq!(driver.state(), ConfirmationState::Approved);

        let answer = driver.complete(pending).await.unwrap();
        assert_eq!(answer, 42);
        assert_eq!(driver.state(), ConfirmationState::Completed);
    }

    #[tokio::test]
    async fn golden_flow_delegates_comparison() {
        let sim = Arc::new(FlowSim::new());
        let reference = format!("{}-show_address", DeviceModel::NanoSP.prefix());
        let policy = ConfirmationPolicy::new(ApprovalAction::Golden { reference })
            .with_poll_interval(Duration::from_millis(5));
        let mut driver = ConfirmationDriver::new(Arc::clone(&sim), policy);

        let pending = driver.submit(pending_answer(&sim));
        sim.review.store(true, Ordering::SeqCst);

        driver.wait_for_review().await.unwrap();
        driver.approve().await.unwrap();

        assert_eq!(
            sim.golden.lock().unwrap().as_deref(),
            Some("sp-show_address")
        );

        let answer = driver.complete(pending).await.unwrap();
        assert_eq!(answer, 42);
    }

    #[tokio::test]
    async fn keyword_wait_is_bounded() {
        let sim = Arc::new(FlowSim::new());
        let policy = ConfirmationPolicy::new(ApprovalAction::Tap {
            x: 200,
            y: 550,
            keyword: Some("Path".to_owned()),
        })
        .with_deadline(Duration::from_millis(80))
        .with_poll_interval(Duration::from_millis(10));
        let mut driver = ConfirmationDriver::new(Arc::clone(&sim), policy);

        // the review renders, but never the gating keyword
        sim.review.store(true, Ordering::SeqCst);
        driver.wait_for_review().await.unwrap();

        match driver.approve().await {
            Err(ConfirmationError::KeywordTimeout(keyword)) => assert_eq!(keyword, "Path"),
            other => panic!("expected a keyword timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn truncated_answer_is_a_transport_fault() {
        let sim = Arc::new(FlowSim::new());
        sim.truncate.store(true, Ordering::SeqCst);

        let transport = SimTransport::new(Arc::clone(&sim));
        let command = APDUCommand {
            cla: 0x55,
            ins: 0x00,
            p1: 0x00,
            p2: 0x00,
            data: Vec::new(),
        };

        let result = transport.exchange(&command).await;
        assert!(matches!(result, Err(SimTransportError::MalformedAnswer)));
    }

    #[tokio::test]
    async fn button_flow_pages_through_review() {
        let sim = Arc::new(FlowSim::new());
        let policy = ConfirmationPolicy::new(ApprovalAction::Buttons { review_pages: 3 })
            .with_poll_interval(Duration::from_millis(5));
        let mut driver = ConfirmationDriver::new(Arc::clone(&sim), policy);

        let pending = driver.submit(pending_answer(&sim));
        sim.review.store(true, Ordering::SeqCst);

        driver.wait_for_review().await.unwrap();
        driver.approve().await.unwrap();

        assert_eq!(sim.right_clicks.load(Ordering::SeqCst), 3);
        assert_eq!(sim.both_clicks.load(Ordering::SeqCst), 1);

        let answer = driver.complete(pending).await.unwrap();
        assert_eq!(answer, 42);
    }
}
