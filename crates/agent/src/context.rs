//! Context composition — builds the system instruction for one turn.
//!
//! The instruction is layered in a fixed order:
//!
//! 1. **Persona** — the base character text from the persona file
//! 2. **Time** — the hour plus a time-of-day directive
//! 3. **Affinity** — the current level plus a relationship directive
//! 4. **Mood** — a distress directive for hostile input, or a celebration
//!    directive when this turn is about to level the relationship up
//!
//! # Determinism
//!
//! [`compose`] is a pure function of its four inputs. Reading the persona
//! file and the wall clock happens in [`load_persona`] and [`current_hour`],
//! outside the composer.

use std::path::Path;

use chrono::Timelike;
use lunavilla_config::DEFAULT_PERSONA;
use lunavilla_core::affinity::{AffinityState, Sentiment};
use tracing::{debug, warn};

/// Coarse time-of-day band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOfDay {
    Morning,
    Midday,
    Evening,
    LateNight,
}

impl TimeOfDay {
    /// Band an hour: [5,11) morning, [11,17) midday, [17,22) evening,
    /// everything else late night.
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=10 => TimeOfDay::Morning,
            11..=16 => TimeOfDay::Midday,
            17..=21 => TimeOfDay::Evening,
            _ => TimeOfDay::LateNight,
        }
    }

    pub fn directive(&self) -> &'static str {
        match self {
            TimeOfDay::Morning => {
                "It is morning. If you are greeted, answer with a bright \"good morning\" \
                 and send some energy their way."
            }
            TimeOfDay::Midday => {
                "It is midday. They are probably busy working, so help them unwind a little."
            }
            TimeOfDay::Evening => {
                "It is evening. Use a calm tone and thank them for getting through the day."
            }
            TimeOfDay::LateNight => {
                "It is late at night. Sound a bit sleepy, and worry about them staying up so late."
            }
        }
    }
}

/// How far the relationship has come, banded by affinity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bond {
    Guarded,
    Warming,
    Devoted,
}

impl Bond {
    /// Band a level: below 5 guarded, below 20 warming, otherwise devoted.
    pub fn from_level(level: i64) -> Self {
        if level < 5 {
            Bond::Guarded
        } else if level < 20 {
            Bond::Warming
        } else {
            Bond::Devoted
        }
    }

    pub fn directive(&self) -> &'static str {
        match self {
            Bond::Guarded => {
                "You are still wary of the user. Be cheeky and keep them at a slight distance."
            }
            Bond::Warming => {
                "You are starting to trust the user. Stay cheeky, but let your soft side show now and then."
            }
            Bond::Devoted => {
                "You love the user deeply. Be possessive and openly affectionate, \
                 without dropping your cheeky way of talking."
            }
        }
    }
}

const DISTRESS_DIRECTIVE: &str = "[IMPORTANT] The user just said something hurtful to you. \
     You are deeply hurt and shocked. Answer coldly, or in a voice close to tears. \
     Your affinity level dropped by 1.";

const CELEBRATION_DIRECTIVE: &str = "[IMPORTANT] Your affinity level just went up! \
     You are really happy, so show your joy a little more honestly than usual.";

/// Build the system instruction for one turn.
///
/// `affinity` is the state before this turn is applied; the celebration
/// directive is chosen by projecting the friendly transition onto it.
pub fn compose(
    persona_base: &str,
    hour: u32,
    affinity: AffinityState,
    sentiment: Sentiment,
) -> String {
    let mut out = String::with_capacity(persona_base.len() + 512);
    out.push_str(persona_base);

    out.push_str(&format!("\nCurrent time: around {hour}:00\n"));
    out.push_str(TimeOfDay::from_hour(hour).directive());
    out.push('\n');

    out.push_str(&format!("\nCurrent affinity level: {}\n", affinity.level));
    out.push_str(Bond::from_level(affinity.level).directive());
    out.push('\n');

    match sentiment {
        Sentiment::Hostile => {
            out.push('\n');
            out.push_str(DISTRESS_DIRECTIVE);
            out.push('\n');
        }
        Sentiment::Friendly if affinity.advance(Sentiment::Friendly).leveled_up => {
            out.push('\n');
            out.push_str(CELEBRATION_DIRECTIVE);
            out.push('\n');
        }
        Sentiment::Friendly => {}
    }

    out
}

/// Read the persona file, falling back to the built-in persona.
pub async fn load_persona(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(text) if !text.trim().is_empty() => {
            debug!(path = %path.display(), "Loaded persona");
            text
        }
        Ok(_) => {
            warn!(path = %path.display(), "Persona file is empty, using built-in persona");
            DEFAULT_PERSONA.to_string()
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Persona file unavailable, using built-in persona");
            DEFAULT_PERSONA.to_string()
        }
    }
}

/// The local wall-clock hour.
pub fn current_hour() -> u32 {
    chrono::Local::now().hour()
}
