//! Background processing cycles
//!
//! Two internal cycles run the Brain against a reserved room on timers:
//! *reverie*, a periodic receptive pass over the workspace, and
//! *consolidation*, a daily memory integration pass. Failures never crash the
//! process: they increment the Brain's consecutive-failure counter for the
//! cycle and escalate log severity. Authentication failures are the one
//! exception; they always propagate and halt the runner.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::agent::Brain;
use crate::backend::{Interrupt, NoCallbacks};
use crate::config::Config;
use crate::conversation::MessageContent;
use crate::error::Result;

/// Reserved room id for internal prompts. Never reaches a chat transport.
pub const CYCLES_ROOM: &str = "__cycles__";

/// Consecutive failures after which cycle logging escalates to ERROR.
const FAILURE_ESCALATION_THRESHOLD: u32 = 3;

const REVERIE_PROMPT: &str = "[Internal cycle: reverie]\n\nYou are entering a reverie, a period \
of receptive internal processing. Scan your workspace, check on promises you made, and notice \
what needs attention. Not every reverie produces action. If nothing needs doing, just move on.";

const CONSOLIDATION_PROMPT: &str = "[Internal cycle: consolidation]\n\nYou are entering \
consolidation, your daily memory integration cycle. Review the day's conversations, update what \
you know about the people you talk to, and note patterns worth keeping.";

/// Drives the periodic internal cycles.
pub struct CycleRunner {
    brain: Arc<Brain>,
    cycle_tier: String,
    reverie_interval: Duration,
    consolidation_interval: Duration,
}

impl CycleRunner {
    /// Create a runner over the shared Brain.
    pub fn new(brain: Arc<Brain>, config: &Config) -> Self {
        Self {
            brain,
            cycle_tier: config.cycle_tier.clone(),
            reverie_interval: Duration::from_secs(config.reverie_interval_secs),
            consolidation_interval: Duration::from_secs(config.consolidation_interval_secs),
        }
    }

    /// Run forever, or until a fatal backend error propagates.
    pub async fn run(&self) -> Result<()> {
        let mut reverie = interval(self.reverie_interval);
        let mut consolidation = interval(self.consolidation_interval);
        reverie.set_missed_tick_behavior(MissedTickBehavior::Skip);
        consolidation.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Consume the immediate first tick of each timer; cycles should start
        // one full interval after boot.
        reverie.tick().await;
        consolidation.tick().await;

        loop {
            tokio::select! {
                _ = reverie.tick() => self.run_cycle("reverie", REVERIE_PROMPT).await?,
                _ = consolidation.tick() => self.run_cycle("consolidation", CONSOLIDATION_PROMPT).await?,
            }
        }
    }

    /// Run one cycle tick. Public so hosts can trigger cycles manually.
    pub async fn run_cycle(&self, name: &str, prompt: &str) -> Result<()> {
        info!(cycle = name, "Running cycle");
        let content = MessageContent {
            username: "system".to_string(),
            timestamp: Local::now().format("%Y-%m-%d %H:%M").to_string(),
            text: prompt.to_string(),
            ..MessageContent::default()
        };

        let result = self
            .brain
            .process(
                CYCLES_ROOM,
                content,
                &NoCallbacks,
                &Interrupt::new(),
                Some(&self.cycle_tier),
                false,
            )
            .await;

        match result {
            Ok(response) => {
                self.brain.cycle_succeeded(name).await;
                if !response.text.is_empty() {
                    info!(cycle = name, response = %response.text.chars().take(200).collect::<String>(), "Cycle finished");
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                let attempt = self.brain.cycle_failed(name).await;
                if attempt >= FAILURE_ESCALATION_THRESHOLD {
                    error!(cycle = name, attempt, error = %e, "Cycle failed");
                } else {
                    warn!(cycle = name, attempt, error = %e, "Cycle failed");
                }
                Ok(())
            }
        }
    }
}
