use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use futures_util::{stream::FuturesUnordered, StreamExt};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::watch;

use crate::{
    backend::endpoint_url, config::ConsoleConfig, demo::script::DemoScript, error::ConsoleError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipOrigin {
    Static,
    Synthesized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub step_id: String,
    pub bytes: Vec<u8>,
    pub origin: ClipOrigin,
}

#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn fetch(&self, step_id: &str, text: &str) -> Result<AudioClip, ConsoleError>;
}

/// Pre-rendered clips first (`/static/audio/{id}.mp3`), then the TTS endpoint.
#[derive(Debug, Clone)]
pub struct HttpAudioSource {
    client: Client,
    base_url: String,
    voice: Option<String>,
}

#[derive(Debug, Serialize)]
struct TtsRequestBody<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
}

impl HttpAudioSource {
    pub fn from_config(config: &ConsoleConfig) -> Result<Self, ConsoleError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.audio_base_url().to_string(),
            voice: config.audio.voice.clone(),
        })
    }

    async fn fetch_static(&self, step_id: &str) -> Result<Option<Vec<u8>>, ConsoleError> {
        let file = format!("{step_id}.mp3");
        let url = endpoint_url(&self.base_url, &["static", "audio", &file])?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }

        let bytes = response.bytes().await?;
        Ok((!bytes.is_empty()).then(|| bytes.to_vec()))
    }

    async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>, ConsoleError> {
        let url = endpoint_url(&self.base_url, &["api", "tts"])?;
        let body = TtsRequestBody {
            text,
            voice: self.voice.as_deref(),
        };
        let response = self.client.post(url).json(&body).send().await?;
        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "tts request refused");
            return Ok(None);
        }

        let bytes = response.bytes().await?;
        Ok((!bytes.is_empty()).then(|| bytes.to_vec()))
    }
}

#[async_trait]
impl AudioSource for HttpAudioSource {
    async fn fetch(&self, step_id: &str, text: &str) -> Result<AudioClip, ConsoleError> {
        match self.fetch_static(step_id).await {
            Ok(Some(bytes)) => {
                return Ok(AudioClip {
                    step_id: step_id.to_string(),
                    bytes,
                    origin: ClipOrigin::Static,
                })
            }
            Ok(None) => {}
            Err(error) => tracing::debug!(step_id, %error, "static clip fetch failed"),
        }

        match self.synthesize(text).await? {
            Some(bytes) => Ok(AudioClip {
                step_id: step_id.to_string(),
                bytes,
                origin: ClipOrigin::Synthesized,
            }),
            None => Err(ConsoleError::AudioUnavailable(step_id.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioState {
    Loading,
    Ready(Arc<AudioClip>),
    Unavailable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchProgress {
    pub loaded: usize,
    pub failed: usize,
    pub total: usize,
}

impl PrefetchProgress {
    pub fn is_done(&self) -> bool {
        self.loaded + self.failed >= self.total
    }

    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            (self.loaded + self.failed) as f32 / self.total as f32
        }
    }
}

/// Narration clips keyed by step id. Only `Ready` clips are ever played.
#[derive(Debug)]
pub struct AudioLibrary {
    clips: RwLock<HashMap<String, AudioState>>,
    progress: watch::Sender<PrefetchProgress>,
}

impl Default for AudioLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioLibrary {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(PrefetchProgress::default());
        Self {
            clips: RwLock::new(HashMap::new()),
            progress,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PrefetchProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> PrefetchProgress {
        *self.progress.borrow()
    }

    pub fn state(&self, step_id: &str) -> Option<AudioState> {
        self.read().get(step_id).cloned()
    }

    pub fn ready_clip(&self, step_id: &str) -> Option<Arc<AudioClip>> {
        match self.read().get(step_id) {
            Some(AudioState::Ready(clip)) => Some(Arc::clone(clip)),
            _ => None,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, AudioState>> {
        self.clips.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, step_id: &str, state: AudioState) {
        self.clips
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(step_id.to_string(), state);
    }

    /// Loads every step's clip, `batch_size` requests at a time.
    pub async fn prefetch(
        &self,
        source: &dyn AudioSource,
        script: &DemoScript,
        batch_size: usize,
    ) -> PrefetchProgress {
        let steps: Vec<_> = script
            .steps
            .iter()
            .filter(|step| !step.narration.trim().is_empty())
            .collect();

        for step in &steps {
            self.set(&step.id, AudioState::Loading);
        }
        self.progress.send_replace(PrefetchProgress {
            loaded: 0,
            failed: 0,
            total: steps.len(),
        });

        for batch in steps.chunks(batch_size.max(1)) {
            let mut pending: FuturesUnordered<_> = batch
                .iter()
                .map(|step| async move { (step.id.as_str(), source.fetch(&step.id, &step.narration).await) })
                .collect();

            while let Some((step_id, result)) = pending.next().await {
                let ok = match result {
                    Ok(clip) => {
                        self.set(step_id, AudioState::Ready(Arc::new(clip)));
                        true
                    }
                    Err(error) => {
                        tracing::debug!(step_id, %error, "narration audio unavailable");
                        self.set(step_id, AudioState::Unavailable);
                        false
                    }
                };

                self.progress.send_modify(|progress| {
                    if ok {
                        progress.loaded += 1;
                    } else {
                        progress.failed += 1;
                    }
                });
            }
        }

        let progress = self.progress();
        tracing::info!(
            loaded = progress.loaded,
            failed = progress.failed,
            "narration audio prefetched"
        );
        progress
    }
}
