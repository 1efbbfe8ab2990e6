use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::watch, time::Instant};

use crate::{
    demo::{
        audio::{AudioClip, AudioLibrary, AudioSource, PrefetchProgress},
        script::{DemoAction, DemoScript, DemoStep, DemoStepKind},
    },
    error::ConsoleError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Stopped,
}

/// Pacing used when a step has no playable clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NarrationTiming {
    pub per_word: Duration,
    pub minimum: Duration,
}

impl Default for NarrationTiming {
    fn default() -> Self {
        Self {
            per_word: Duration::from_millis(380),
            minimum: Duration::from_millis(1200),
        }
    }
}

impl NarrationTiming {
    pub fn silent_duration(&self, step: &DemoStep) -> Duration {
        let words = step.word_count() as u32;
        (self.per_word * words).max(self.minimum)
    }
}

/// The presenter-facing surface the script drives.
#[async_trait]
pub trait DemoHost: Send + Sync {
    async fn scroll_into_view(&self, _target: &str) {}

    async fn highlight(&self, target: &str);

    async fn clear_highlight(&self) {}

    async fn perform(&self, action: &DemoAction) -> Result<(), ConsoleError>;

    /// Shown for every step, with or without audio.
    async fn show_caption(&self, step: &DemoStep);

    /// Resolves when the clip has finished playing.
    async fn play_audio(&self, clip: Arc<AudioClip>) -> Result<(), ConsoleError>;

    async fn pause_audio(&self) {}

    async fn resume_audio(&self) {}

    async fn notice(&self, message: &str);
}

/// Cloneable remote for a running [`DemoPlayer`].
#[derive(Debug, Clone)]
pub struct DemoController {
    state: Arc<watch::Sender<PlaybackState>>,
    cursor: Arc<AtomicUsize>,
}

impl DemoController {
    fn new() -> Self {
        let (state, _) = watch::channel(PlaybackState::Idle);
        Self {
            state: Arc::new(state),
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state.subscribe()
    }

    /// Takes effect at the player's next checkpoint.
    pub fn pause(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == PlaybackState::Playing {
                *state = PlaybackState::Paused;
                true
            } else {
                false
            }
        })
    }

    pub fn resume(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == PlaybackState::Paused {
                *state = PlaybackState::Playing;
                true
            } else {
                false
            }
        })
    }

    pub fn stop(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(*state, PlaybackState::Playing | PlaybackState::Paused) {
                *state = PlaybackState::Stopped;
                true
            } else {
                false
            }
        })
    }

    fn set(&self, state: PlaybackState) {
        self.state.send_replace(state);
    }

    fn set_cursor(&self, cursor: usize) {
        self.cursor.store(cursor, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Blocks while paused. Returns `Stop` once stop was requested.
async fn checkpoint(control: &mut watch::Receiver<PlaybackState>) -> Flow {
    loop {
        let state = *control.borrow_and_update();
        match state {
            PlaybackState::Playing => return Flow::Continue,
            PlaybackState::Stopped | PlaybackState::Idle => return Flow::Stop,
            PlaybackState::Paused => {
                if control.changed().await.is_err() {
                    return Flow::Stop;
                }
            }
        }
    }
}

/// Sleeps for `duration` of *playing* time; paused time does not count.
async fn pausable_sleep(duration: Duration, control: &mut watch::Receiver<PlaybackState>) -> Flow {
    let mut remaining = duration;

    loop {
        if checkpoint(control).await == Flow::Stop {
            return Flow::Stop;
        }
        if remaining.is_zero() {
            return Flow::Continue;
        }

        let started = Instant::now();
        tokio::select! {
            _ = tokio::time::sleep(remaining) => return Flow::Continue,
            changed = control.changed() => {
                if changed.is_err() {
                    return Flow::Stop;
                }
                remaining = remaining.saturating_sub(started.elapsed());
            }
        }
    }
}

/// Walks a [`DemoScript`] one step at a time.
pub struct DemoPlayer {
    script: DemoScript,
    audio: Arc<AudioLibrary>,
    agent_finished: watch::Receiver<bool>,
    controller: DemoController,
    timing: NarrationTiming,
    audio_notice_shown: bool,
}

impl DemoPlayer {
    pub fn new(
        script: DemoScript,
        audio: Arc<AudioLibrary>,
        agent_finished: watch::Receiver<bool>,
    ) -> Self {
        Self {
            script,
            audio,
            agent_finished,
            controller: DemoController::new(),
            timing: NarrationTiming::default(),
            audio_notice_shown: false,
        }
    }

    pub fn with_timing(mut self, timing: NarrationTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn controller(&self) -> DemoController {
        self.controller.clone()
    }

    pub fn script(&self) -> &DemoScript {
        &self.script
    }

    /// Loads narration for every step. Call before [`Self::play`] so early
    /// steps do not fall back to captions while clips are still loading.
    pub async fn prefetch_audio(
        &self,
        source: &dyn AudioSource,
        batch_size: usize,
    ) -> PrefetchProgress {
        self.audio.prefetch(source, &self.script, batch_size).await
    }

    pub fn audio_progress(&self) -> watch::Receiver<PrefetchProgress> {
        self.audio.subscribe()
    }

    /// Plays from the current cursor to the end or until stopped. Either way
    /// the cursor is back at the first step afterwards.
    pub async fn play(&mut self, host: &dyn DemoHost) -> PlaybackOutcome {
        let mut control = self.controller.subscribe();
        self.controller.set(PlaybackState::Playing);
        let mut toggled: Vec<DemoAction> = Vec::new();

        let mut cursor = self.controller.cursor();
        let outcome = loop {
            let Some(step) = self.script.steps.get(cursor).cloned() else {
                break PlaybackOutcome::Completed;
            };

            if self.play_step(&step, host, &mut control, &mut toggled).await == Flow::Stop {
                break PlaybackOutcome::Stopped;
            }

            cursor += 1;
            self.controller.set_cursor(cursor);
        };

        host.clear_highlight().await;
        if outcome == PlaybackOutcome::Stopped {
            for action in toggled.iter().rev() {
                if let DemoAction::SetHumanReview { enabled: true } = action {
                    let revert = DemoAction::SetHumanReview { enabled: false };
                    if let Err(error) = host.perform(&revert).await {
                        tracing::warn!(%error, "failed to revert demo setting");
                    }
                }
            }
        }

        self.controller.set_cursor(0);
        self.controller.set(PlaybackState::Idle);
        tracing::info!(?outcome, "demo playback finished");
        outcome
    }

    async fn play_step(
        &mut self,
        step: &DemoStep,
        host: &dyn DemoHost,
        control: &mut watch::Receiver<PlaybackState>,
        toggled: &mut Vec<DemoAction>,
    ) -> Flow {
        if pausable_sleep(step.delay_before(), control).await == Flow::Stop {
            return Flow::Stop;
        }

        tracing::debug!(step = %step.id, "demo step");
        match &step.kind {
            DemoStepKind::Narrate => {}
            DemoStepKind::Highlight { target, scroll } => {
                if *scroll {
                    host.scroll_into_view(target).await;
                }
                host.highlight(target).await;
            }
            DemoStepKind::Act { action, target } => {
                if let Some(target) = target {
                    host.scroll_into_view(target).await;
                    host.highlight(target).await;
                }
                match host.perform(action).await {
                    Ok(()) => {
                        if matches!(action, DemoAction::SetHumanReview { enabled: true }) {
                            toggled.push(action.clone());
                        }
                    }
                    Err(error) => tracing::warn!(step = %step.id, %error, "demo action failed"),
                }
            }
            DemoStepKind::WaitExternal { grace_ms } => {
                if self.wait_for_agent(control).await == Flow::Stop {
                    return Flow::Stop;
                }
                if pausable_sleep(Duration::from_millis(*grace_ms), control).await == Flow::Stop {
                    return Flow::Stop;
                }
            }
        }

        self.narrate(step, host, control).await
    }

    async fn wait_for_agent(&mut self, control: &mut watch::Receiver<PlaybackState>) -> Flow {
        loop {
            if checkpoint(control).await == Flow::Stop {
                return Flow::Stop;
            }
            if *self.agent_finished.borrow_and_update() {
                return Flow::Continue;
            }

            tokio::select! {
                changed = self.agent_finished.changed() => {
                    if changed.is_err() {
                        tracing::warn!("agent completion signal dropped, continuing");
                        return Flow::Continue;
                    }
                }
                changed = control.changed() => {
                    if changed.is_err() {
                        return Flow::Stop;
                    }
                }
            }
        }
    }

    async fn narrate(
        &mut self,
        step: &DemoStep,
        host: &dyn DemoHost,
        control: &mut watch::Receiver<PlaybackState>,
    ) -> Flow {
        if checkpoint(control).await == Flow::Stop {
            return Flow::Stop;
        }
        host.show_caption(step).await;

        // Clips still loading are treated like missing ones.
        let Some(clip) = self.audio.ready_clip(&step.id) else {
            if !self.audio_notice_shown {
                self.audio_notice_shown = true;
                host.notice("Narration audio unavailable, showing captions instead")
                    .await;
            }
            return pausable_sleep(self.timing.silent_duration(step), control).await;
        };

        let playback = host.play_audio(clip);
        tokio::pin!(playback);

        loop {
            tokio::select! {
                result = &mut playback => {
                    if let Err(error) = result {
                        tracing::warn!(step = %step.id, %error, "audio playback failed");
                    }
                    return Flow::Continue;
                }
                changed = control.changed() => {
                    if changed.is_err() {
                        return Flow::Stop;
                    }
                    let paused = *control.borrow() == PlaybackState::Paused;
                    if paused {
                        host.pause_audio().await;
                    }
                    if checkpoint(control).await == Flow::Stop {
                        if !paused {
                            host.pause_audio().await;
                        }
                        return Flow::Stop;
                    }
                    if paused {
                        host.resume_audio().await;
                    }
                }
            }
        }
    }
}
