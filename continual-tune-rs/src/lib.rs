//! # continual-tune-rs
//!
//! Background continual fine-tuning for a small language model.
//!
//! Live interaction streams (chat turns, imported datasets and documents)
//! become [`TrainingExample`]s in a priority queue. During idle time a
//! cooperative [`TrainingScheduler`] hands batches to the
//! [`TrainingEngine`], which first consults an episodic fast learner and
//! then trains the remainder with hand-written backprop through LoRA
//! adapters or the full weights. Weights are snapshotted and rolled back
//! when quality drops.
//!
//! ## Features
//!
//! - **Priority queue** with id deduplication and bounded capacity
//! - **Fast learner**: episodic memory plus a Hebbian/STDP spiking network
//! - **LoRA with Adam**, hybrid mode upgrading to full fine-tuning on plateau
//! - **Manual backprop** through attention, SwiGLU FFN and layer norm
//! - **Snapshots and rollback** of base weights and adapters in lockstep
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a config
//! continual-tune init config.yaml --preset tiny
//!
//! # Train until the imported examples are consumed
//! continual-tune train config.yaml --data chats.jsonl --state state.json
//!
//! # Inspect a saved state
//! continual-tune inspect state.json
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```rust
//! use continual_tune_rs::ingest::chat_turn;
//! use continual_tune_rs::queue::{ExampleQueue, SharedQueue};
//! use continual_tune_rs::scheduler::{FixedBudget, TrainingScheduler};
//! use continual_tune_rs::{ContinualConfig, TrainingEngine};
//!
//! # fn main() -> continual_tune_rs::Result<()> {
//! let config = ContinualConfig::tiny_preset();
//! let queue = SharedQueue::new(ExampleQueue::new(&config.queue));
//! queue.add(chat_turn("What is Rust?", "A systems language."));
//!
//! let engine = TrainingEngine::with_reference_model(config.clone())?;
//! let mut scheduler = TrainingScheduler::new(&config, engine, queue);
//! scheduler.start();
//!
//! let outcome = scheduler.tick(0, &FixedBudget(100))?;
//! assert!(outcome.trained());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod batch;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod example;
pub mod fast_learner;
pub mod gradients;
pub mod ingest;
pub mod lora;
pub mod lr_scheduler;
pub mod model;
pub mod optimizer;
pub mod queue;
pub mod scheduler;
pub mod tensor_ops;
pub mod weights;

pub use config::{ContinualConfig, TrainingMode};
pub use engine::{BatchReport, EngineState, TrainingEngine, TrainingMetrics};
pub use error::{ContinualError, Result};
pub use example::{Priority, TrainingExample};
pub use fast_learner::FastLearner;
pub use lora::LoraAdapter;
pub use queue::{ExampleQueue, SharedQueue};
pub use scheduler::{TickOutcome, TrainingScheduler};
pub use weights::{WeightStore, WeightUpdater};
