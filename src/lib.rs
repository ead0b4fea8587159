//! HeyBro: a wake-word voice assistant.
//!
//! Audio goes in through a wake word listener and a speech recognizer, the
//! transcript goes out to an NLU service, and the reply comes back as an
//! action plus something to say. [`dispatcher::Dispatcher`] runs the whole
//! loop; [`device::AudioDevice`] makes sure only one stage uses the
//! microphone and speaker at a time.

pub mod actions;
pub mod backends;
pub mod config_loader;
pub mod cortex;
pub mod custom_actions;
pub mod device;
pub mod dispatcher;
pub mod ear;
pub mod engine;
pub mod error;
pub mod platform;
pub mod profiles;
pub mod wake;
pub mod worker;

pub use error::{Error, Result};
