// ABOUTME: Provider module collecting the generation engine adapters.
// ABOUTME: Each sub-module implements GenerationEngine for one HTTP API family.

pub mod openai;

pub use openai::{ApiFlavor, OpenAiEngine};
