//! The pipeline state machine.
//!
//! One [`Dispatcher`] owns every piece of pipeline state and runs on a single
//! tokio task. Workers (wake listener, capture, NLU, playback) never touch
//! that state; they report back by sending [`PipelineEvent`]s. Events from a
//! capture, request or playback carry the generation they were started
//! under, and anything from a superseded generation is dropped.

use crate::actions::{self, ActionContext, FollowUp, Outcome};
use crate::backends::ModelProvider;
use crate::config_loader::Settings;
use crate::cortex::{Cortex, NluResponse};
use crate::device::AudioDevice;
use crate::ear::Ear;
use crate::engine::AudioEngine;
use crate::platform::InstalledApp;
use crate::profiles::{Language, LanguageProfile, LanguageProfiles};
use crate::wake::{WakeEvent, WakeWordListener};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Log line closing one interaction
pub const SEPARATOR: &str = "--------------------";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    WakeListening,
    CommandListening,
    AwaitingNlu,
    Speaking,
    Error,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "IDLE",
            PipelineState::WakeListening => "LISTENING_WW",
            PipelineState::CommandListening => "LISTENING_CMD",
            PipelineState::AwaitingNlu => "AWAITING_NLU",
            PipelineState::Speaking => "SPEAKING",
            PipelineState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum PipelineEvent {
    // User commands
    StartWakeListening,
    StopWakeListening,
    SwitchLanguage(Language),
    ResetChat,
    /// Abandon whatever the pipeline is doing
    Cancel,
    /// Skip capture and send this text straight to the NLU service
    SubmitText(String),
    Shutdown,

    // Worker reports
    WakeDetected {
        session: u64,
    },
    WakeFailed {
        session: u64,
        error: Error,
    },
    Transcript {
        generation: u64,
        result: Result<String>,
    },
    NluReply {
        generation: u64,
        transcript: String,
        response: NluResponse,
    },
    ActionDone {
        generation: u64,
        outcome: Outcome,
    },
    SpeechFinished {
        generation: u64,
    },
    AppPicked {
        guess: String,
        app: Option<InstalledApp>,
    },
    LearnConfirmed {
        response: NluResponse,
    },
    LanguageLoaded {
        language: Language,
        result: Result<LanguageProfile>,
    },
}

/// Read-only snapshot for whoever presents the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub language: Language,
    pub wake_enabled: bool,
    /// Set once the startup language has loaded or failed to
    pub started: bool,
    /// The most recent log lines, oldest first
    pub log: Vec<String>,
    /// Lines logged since startup, including ones no longer in `log`
    pub logged: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub language: Language,
    pub wake_sensitivity: f32,
    pub capture_block: Duration,
    pub capture_max: Duration,
    pub log_history: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            language: Language::En,
            wake_sensitivity: 0.5,
            capture_block: Duration::from_millis(200),
            capture_max: Duration::from_secs(15),
            log_history: 100,
        }
    }
}

impl PipelineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let language = settings.language.parse().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "falling back to English");
            Language::En
        });
        Self {
            language,
            wake_sensitivity: settings.wake_sensitivity,
            capture_block: Duration::from_millis(settings.capture_block_ms),
            capture_max: Duration::from_millis(settings.capture_max_duration_ms),
            log_history: settings.log_history.max(1),
        }
    }
}

/// Everything outside the state machine that it drives
pub struct Collaborators {
    pub device: AudioDevice,
    pub models: Arc<dyn ModelProvider>,
    pub cortex: Cortex,
    pub actions: ActionContext,
}

/// Cheap, cloneable control surface for a running pipeline
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<PipelineEvent>,
    status: watch::Receiver<PipelineStatus>,
}

impl PipelineHandle {
    pub fn send(&self, event: PipelineEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| Error::Busy("pipeline has shut down".to_string()))
    }

    pub fn start_wake_listening(&self) -> Result<()> {
        self.send(PipelineEvent::StartWakeListening)
    }

    pub fn stop_wake_listening(&self) -> Result<()> {
        self.send(PipelineEvent::StopWakeListening)
    }

    pub fn switch_language(&self, language: Language) -> Result<()> {
        self.send(PipelineEvent::SwitchLanguage(language))
    }

    pub fn reset_chat(&self) -> Result<()> {
        self.send(PipelineEvent::ResetChat)
    }

    pub fn cancel(&self) -> Result<()> {
        self.send(PipelineEvent::Cancel)
    }

    pub fn submit_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(PipelineEvent::SubmitText(text.into()))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(PipelineEvent::Shutdown)
    }

    pub fn status(&self) -> PipelineStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.status.clone()
    }

    /// Wait until the published status satisfies `pred`
    pub async fn wait_for<F>(&self, mut pred: F) -> Result<PipelineStatus>
    where
        F: FnMut(&PipelineStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|s| pred(s))
            .await
            .map_err(|_| Error::Busy("pipeline has shut down".to_string()))?;
        Ok(status.clone())
    }
}

pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<PipelineEvent>,
    tx: mpsc::UnboundedSender<PipelineEvent>,
    status_tx: watch::Sender<PipelineStatus>,
    options: PipelineOptions,

    state: PipelineState,
    language: Language,
    /// Language whose models are loading in the background
    switching: Option<Language>,
    started: bool,
    wake_enabled: bool,
    wake_session: u64,
    generation: u64,
    follow_up: Option<FollowUp>,
    log: VecDeque<String>,
    logged: u64,

    profiles: LanguageProfiles,
    wake: WakeWordListener,
    ear: Ear,
    speaker: AudioEngine,
    cortex: Cortex,
    actions: ActionContext,
}

impl Dispatcher {
    pub fn new(options: PipelineOptions, collaborators: Collaborators) -> (Self, PipelineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(PipelineStatus {
            state: PipelineState::Idle,
            language: options.language,
            wake_enabled: false,
            started: false,
            log: Vec::new(),
            logged: 0,
        });

        let Collaborators {
            device,
            models,
            cortex,
            actions,
        } = collaborators;

        let dispatcher = Self {
            rx,
            tx: tx.clone(),
            status_tx,
            state: PipelineState::Idle,
            language: options.language,
            switching: None,
            started: false,
            wake_enabled: false,
            wake_session: 0,
            generation: 0,
            follow_up: None,
            log: VecDeque::with_capacity(options.log_history),
            logged: 0,
            profiles: LanguageProfiles::new(models.clone()),
            wake: WakeWordListener::new(device.clone(), models),
            ear: Ear::new(device.clone(), options.capture_block, options.capture_max),
            speaker: AudioEngine::new(device),
            cortex,
            actions,
            options,
        };
        let handle = PipelineHandle {
            tx,
            status: status_rx,
        };
        (dispatcher, handle)
    }

    /// Build and run a dispatcher on its own task
    pub fn spawn(
        options: PipelineOptions,
        collaborators: Collaborators,
    ) -> (PipelineHandle, JoinHandle<()>) {
        let (dispatcher, handle) = Self::new(options, collaborators);
        (handle, tokio::spawn(dispatcher.run()))
    }

    pub async fn run(mut self) {
        self.startup().await;
        while let Some(event) = self.rx.recv().await {
            if matches!(event, PipelineEvent::Shutdown) {
                break;
            }
            self.handle(event);
        }
        self.shutdown();
    }

    /// Load the startup language off the control task. Commands sent
    /// meanwhile wait in the channel. Publishes exactly once.
    async fn startup(&mut self) {
        let language = self.language;
        let provider = self.profiles.provider();
        let loaded =
            tokio::task::spawn_blocking(move || LanguageProfile::load(provider.as_ref(), language))
                .await
                .unwrap_or_else(|e| {
                    Err(Error::InitializationFailed(format!(
                        "model loading panicked: {}",
                        e
                    )))
                });

        self.started = true;
        match loaded {
            Ok(profile) => {
                tracing::info!(%language, voice = profile.tts.id(), "pipeline ready");
                self.profiles.insert(profile);
                self.profiles.select(language);
                self.set_state(PipelineState::Idle);
            }
            Err(e) => {
                tracing::error!(error = %e, %language, "no usable speech models");
                self.state = PipelineState::Error;
                self.add_log(format!("Error: {}", e));
            }
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("pipeline shutting down");
        self.generation += 1;
        self.wake.stop();
        self.ear.stop();
        self.speaker.stop();
    }

    fn handle(&mut self, event: PipelineEvent) {
        use PipelineEvent::*;

        match event {
            StartWakeListening => self.on_start_wake_listening(),
            StopWakeListening => self.on_stop_wake_listening(),
            SwitchLanguage(language) => self.on_switch_language(language),
            ResetChat => {
                self.add_log("Resetting chat history on server...");
                self.cortex.reset_history();
            }
            Cancel => self.on_cancel(),
            SubmitText(text) => self.on_submit_text(text),
            Shutdown => {}

            WakeDetected { session } => self.on_wake_detected(session),
            WakeFailed { session, error } => self.on_wake_failed(session, error),
            Transcript { generation, result } => self.on_transcript(generation, result),
            NluReply {
                generation,
                transcript,
                response,
            } => self.on_nlu_reply(generation, transcript, response),
            ActionDone {
                generation,
                outcome,
            } => self.on_action_done(generation, outcome),
            SpeechFinished { generation } => self.on_speech_finished(generation),
            AppPicked { guess, app } => self.on_app_picked(guess, app),
            LearnConfirmed { response } => {
                self.add_log(format!("NLU confirmation: {}", response.spoken_response));
            }
            LanguageLoaded { language, result } => self.on_language_loaded(language, result),
        }
    }

    fn is_current(&self, generation: u64, expected: PipelineState) -> bool {
        if generation != self.generation || self.state != expected {
            tracing::debug!(
                generation,
                current = self.generation,
                state = %self.state,
                "dropping stale worker event"
            );
            return false;
        }
        true
    }

    fn on_start_wake_listening(&mut self) {
        if self.state == PipelineState::Error {
            self.add_log("Cannot listen: speech models failed to load. Restart required.");
            return;
        }
        self.wake_enabled = true;
        if self.state == PipelineState::Idle {
            self.enter_wake_listening();
        } else {
            self.publish();
        }
    }

    fn on_stop_wake_listening(&mut self) {
        self.wake_enabled = false;
        self.wake.stop();
        if self.state == PipelineState::WakeListening {
            self.set_state(PipelineState::Idle);
        } else {
            self.publish();
        }
    }

    fn on_switch_language(&mut self, language: Language) {
        if !matches!(self.state, PipelineState::Idle | PipelineState::WakeListening) {
            tracing::warn!(state = %self.state, "language switch refused while busy");
            self.add_log(format!("Cannot switch language while {}", self.state));
            return;
        }
        if language == self.language {
            return;
        }
        if let Some(pending) = self.switching {
            self.add_log(format!("Already switching language to {}", pending));
            return;
        }

        self.add_log(format!("Switching language to {}...", language));
        if self.profiles.select(language).is_some() {
            self.language_switched(language);
            return;
        }

        // Model files can take seconds to read
        self.switching = Some(language);
        let provider = self.profiles.provider();
        let tx = self.tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                LanguageProfile::load(provider.as_ref(), language)
            }))
            .unwrap_or_else(|_| {
                Err(Error::InitializationFailed(
                    "model loading panicked".to_string(),
                ))
            });
            let _ = tx.send(PipelineEvent::LanguageLoaded { language, result });
        });
    }

    fn on_language_loaded(&mut self, language: Language, result: Result<LanguageProfile>) {
        if self.switching != Some(language) {
            return;
        }
        self.switching = None;
        match result {
            Ok(profile) => {
                self.profiles.insert(profile);
                self.profiles.select(language);
                self.language_switched(language);
            }
            Err(e) => {
                tracing::error!(error = %e, %language, "language unavailable");
                self.add_log(format!("Could not load {} models: {}", language, e));
            }
        }
    }

    fn language_switched(&mut self, language: Language) {
        self.language = language;
        tracing::info!(%language, "language switched");
        self.publish();
    }

    fn on_cancel(&mut self) {
        match self.state {
            PipelineState::CommandListening => self.ear.stop(),
            PipelineState::Speaking => self.speaker.stop(),
            PipelineState::AwaitingNlu => {}
            _ => return,
        }
        tracing::info!(state = %self.state, "cancelled");
        self.generation += 1;
        self.follow_up = None;
        self.add_log("Cancelled.");
        self.finish_interaction();
    }

    fn on_submit_text(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        match self.state {
            PipelineState::Idle => {}
            PipelineState::WakeListening => self.wake.stop(),
            state => {
                tracing::warn!(%state, "typed command refused while busy");
                self.add_log(format!("Busy ({}), try again shortly.", state));
                return;
            }
        }
        self.begin_nlu(text);
    }

    fn on_wake_detected(&mut self, session: u64) {
        if session != self.wake_session || self.state != PipelineState::WakeListening {
            tracing::debug!(session, state = %self.state, "ignoring wake event");
            return;
        }
        self.wake.stop();
        self.add_log("Wake Word Detected!");
        self.start_capture();
    }

    fn on_wake_failed(&mut self, session: u64, error: Error) {
        if session != self.wake_session {
            return;
        }
        tracing::error!(error = %error, "wake word listener stopped");
        self.add_log(format!("Wake word listener stopped: {}", error));
        self.wake_enabled = false;
        if self.state == PipelineState::WakeListening {
            self.set_state(PipelineState::Idle);
        } else {
            self.publish();
        }
    }

    fn on_transcript(&mut self, generation: u64, result: Result<String>) {
        if !self.is_current(generation, PipelineState::CommandListening) {
            return;
        }
        match result {
            Ok(text) if !text.trim().is_empty() => self.begin_nlu(text.trim().to_string()),
            Ok(_) => {
                tracing::info!("nothing was heard");
                self.finish_interaction();
            }
            Err(e) => {
                tracing::warn!(error = %e, "capture failed");
                self.add_log(format!("Could not listen: {}", e));
                self.finish_interaction();
            }
        }
    }

    fn on_nlu_reply(&mut self, generation: u64, transcript: String, response: NluResponse) {
        if !self.is_current(generation, PipelineState::AwaitingNlu) {
            return;
        }
        self.add_log(format!("You: {}", transcript));
        self.add_log(format!(
            "NLU -> {}, Params: {}",
            response.action,
            serde_json::Value::Object(response.parameters.clone())
        ));

        // Handlers may block on the host, so they run off the control task
        let ctx = self.actions.clone();
        let tx = self.tx.clone();
        tokio::task::spawn_blocking(move || {
            let fallback = response.spoken_response.clone();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| actions::execute(&ctx, &response)))
                .unwrap_or_else(|_| {
                    tracing::error!(action = %response.action, "action handler panicked");
                    Outcome {
                        speech: fallback,
                        follow_up: None,
                    }
                });
            let _ = tx.send(PipelineEvent::ActionDone {
                generation,
                outcome,
            });
        });
    }

    fn on_action_done(&mut self, generation: u64, outcome: Outcome) {
        if !self.is_current(generation, PipelineState::AwaitingNlu) {
            return;
        }
        self.follow_up = outcome.follow_up;
        self.speak(outcome.speech);
    }

    fn on_speech_finished(&mut self, generation: u64) {
        if !self.is_current(generation, PipelineState::Speaking) {
            return;
        }
        if let Some(follow_up) = self.follow_up.take() {
            self.run_follow_up(follow_up);
        }
        self.finish_interaction();
    }

    fn on_app_picked(&mut self, guess: String, app: Option<InstalledApp>) {
        let Some(app) = app else {
            self.add_log("No app selected.");
            return;
        };
        if let Err(e) = self
            .actions
            .custom_actions
            .learn(&app.name, &guess, &app.package)
        {
            tracing::error!(error = %e, "failed to save custom actions");
        }
        self.add_log(format!("Learned: '{}' is '{}'", app.name, app.package));

        let tx = self.tx.clone();
        self.cortex
            .send(&actions::learning_message(&app), move |response| {
                let _ = tx.send(PipelineEvent::LearnConfirmed { response });
            });
    }

    fn enter_wake_listening(&mut self) {
        // A listener from an older session must not keep reporting
        self.wake.stop();
        self.wake_session += 1;
        let session = self.wake_session;
        let tx = self.tx.clone();
        let started = self
            .wake
            .start(self.options.wake_sensitivity, move |event| {
                let event = match event {
                    WakeEvent::Detected => PipelineEvent::WakeDetected { session },
                    WakeEvent::Failed(error) => PipelineEvent::WakeFailed { session, error },
                };
                let _ = tx.send(event);
            });

        match started {
            Ok(()) => self.set_state(PipelineState::WakeListening),
            Err(e) => {
                tracing::warn!(error = %e, "wake word detection unavailable");
                self.add_log(format!("Wake word unavailable: {}", e));
                self.wake_enabled = false;
                self.set_state(PipelineState::Idle);
            }
        }
    }

    fn start_capture(&mut self) {
        let Some(profile) = self.profiles.active() else {
            self.finish_interaction();
            return;
        };
        self.generation += 1;
        let generation = self.generation;
        self.set_state(PipelineState::CommandListening);

        let tx = self.tx.clone();
        let started = self.ear.start(&profile, move |result| {
            let _ = tx.send(PipelineEvent::Transcript { generation, result });
        });
        if let Err(e) = started {
            tracing::error!(error = %e, "could not start capture");
            self.finish_interaction();
        }
    }

    fn begin_nlu(&mut self, transcript: String) {
        self.generation += 1;
        let generation = self.generation;
        self.set_state(PipelineState::AwaitingNlu);

        let tx = self.tx.clone();
        let text = transcript.clone();
        self.cortex.send(&text, move |response| {
            let _ = tx.send(PipelineEvent::NluReply {
                generation,
                transcript,
                response,
            });
        });
    }

    fn speak(&mut self, text: String) {
        self.set_state(PipelineState::Speaking);
        let generation = self.generation;

        let voice = self.profiles.active().map(|p| p.tts);
        let (Some(voice), false) = (voice, text.trim().is_empty()) else {
            self.on_speech_finished(generation);
            return;
        };

        self.add_log(format!("Bot: {}", text));
        let tx = self.tx.clone();
        if let Err(e) = self.speaker.speak(voice, &text, move || {
            let _ = tx.send(PipelineEvent::SpeechFinished { generation });
        }) {
            // The completion callback still fires when the worker cannot start
            tracing::error!(error = %e, "could not start playback");
        }
    }

    fn run_follow_up(&mut self, follow_up: FollowUp) {
        let Some(platform) = self.actions.platform.clone() else {
            return;
        };
        match follow_up {
            FollowUp::PickApp { guess } => {
                let tx = self.tx.clone();
                tokio::task::spawn_blocking(move || {
                    let app = match actions::pick_app(platform.as_ref(), &guess) {
                        Ok(app) => app,
                        Err(e) => {
                            tracing::warn!(error = %e, "app picker failed");
                            None
                        }
                    };
                    let _ = tx.send(PipelineEvent::AppPicked { guess, app });
                });
            }
            FollowUp::OpenAccessibilitySettings => {
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = platform.open_accessibility_settings() {
                        tracing::warn!(error = %e, "could not open accessibility settings");
                    }
                });
            }
        }
    }

    /// Close out one interaction and go back to the resting state
    fn finish_interaction(&mut self) {
        self.add_log(SEPARATOR);
        if self.wake_enabled {
            self.enter_wake_listening();
        } else {
            self.set_state(PipelineState::Idle);
        }
    }

    fn set_state(&mut self, state: PipelineState) {
        if self.state != state {
            tracing::info!(from = %self.state, to = %state, "pipeline state");
            self.state = state;
        }
        self.publish();
    }

    fn add_log(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(target: "heybro::log", "{}", message);
        while self.log.len() >= self.options.log_history {
            self.log.pop_front();
        }
        self.log.push_back(message);
        self.logged += 1;
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(PipelineStatus {
            state: self.state,
            language: self.language,
            wake_enabled: self.wake_enabled,
            started: self.started,
            log: self.log.iter().cloned().collect(),
            logged: self.logged,
        });
    }
}
