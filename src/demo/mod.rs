pub mod audio;
pub mod player;
pub mod script;

pub use audio::{AudioClip, AudioLibrary, AudioSource, AudioState, ClipOrigin, HttpAudioSource, PrefetchProgress};
pub use player::{DemoController, DemoHost, DemoPlayer, NarrationTiming, PlaybackOutcome, PlaybackState};
pub use script::{DemoAction, DemoScript, DemoStep, DemoStepKind};
