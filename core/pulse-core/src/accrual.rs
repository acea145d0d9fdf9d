//! Potential-points accrual derived from the last heartbeat checkpoint.
//!
//! Points ramp linearly from 0 to [`MAX_POTENTIAL_POINTS`] across the
//! 15-minute window ([`ACCRUAL_WINDOW_MILLIS`]) that starts at
//! `lastHeartbeatAt`. Each tick has a small chance of adding a random bonus.
//! Nothing here depends on data received from the server; the ramp keeps
//! running through network interruptions.
//!
//! ```text
//! no checkpoint         → "Calculating...", 0.00
//! 0 ≤ elapsed < window  → "{m}m {s}s",      round2(elapsed / window × 25) [+ bonus]
//! elapsed ≥ window      → "Calculating...", 25.00
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Result;
use crate::snapshot::{fields, Snapshot};
use crate::store::StateStore;

pub const ACCRUAL_WINDOW_MILLIS: i64 = 15 * 60 * 1000;
pub const MAX_POTENTIAL_POINTS: f64 = 25.0;
pub const BONUS_PROBABILITY: f64 = 0.10;
/// Exclusive upper bound of a bonus draw.
pub const BONUS_CEILING: f64 = 2.0;
pub const CALCULATING: &str = "Calculating...";

const MILLIS_PER_MINUTE: i64 = 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Countdown {
    /// No checkpoint yet, or the window has elapsed and a heartbeat is due.
    Calculating,
    Remaining { minutes: i64, seconds: i64 },
}

impl fmt::Display for Countdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Countdown::Calculating => f.write_str(CALCULATING),
            Countdown::Remaining { minutes, seconds } => write!(f, "{minutes}m {seconds}s"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Accrual {
    pub countdown: Countdown,
    pub potential_points: f64,
}

impl Accrual {
    /// The `{potentialPoints, countdown}` patch persisted every tick.
    pub fn to_patch(&self) -> Snapshot {
        Snapshot::new()
            .with(fields::POTENTIAL_POINTS, self.potential_points)
            .with(fields::COUNTDOWN, self.countdown.to_string())
    }
}

/// Source of the per-tick random bonus.
pub trait BonusSource: Send {
    /// Returns the bonus to add this tick, if one was drawn.
    fn draw(&mut self) -> Option<f64>;
}

/// Production bonus source: one generator reused for every tick.
pub struct RandomBonus<R = StdRng> {
    rng: R,
}

impl RandomBonus<StdRng> {
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> RandomBonus<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl<R: Rng + Send> BonusSource for RandomBonus<R> {
    fn draw(&mut self) -> Option<f64> {
        if self.rng.gen_bool(BONUS_PROBABILITY) {
            Some(self.rng.gen_range(0.0..BONUS_CEILING))
        } else {
            None
        }
    }
}

/// Never draws a bonus.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBonus;

impl BonusSource for NoBonus {
    fn draw(&mut self) -> Option<f64> {
        None
    }
}

/// Derives the countdown and potential points for `now`.
pub fn compute(
    now: DateTime<Utc>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    bonus: &mut dyn BonusSource,
) -> Accrual {
    let Some(last_heartbeat_at) = last_heartbeat_at else {
        return Accrual {
            countdown: Countdown::Calculating,
            potential_points: 0.0,
        };
    };

    let elapsed_millis = now.signed_duration_since(last_heartbeat_at).num_milliseconds();
    let remaining_millis = ACCRUAL_WINDOW_MILLIS.saturating_sub(elapsed_millis);

    if remaining_millis <= 0 {
        return Accrual {
            countdown: Countdown::Calculating,
            potential_points: MAX_POTENTIAL_POINTS,
        };
    }

    let countdown = Countdown::Remaining {
        minutes: remaining_millis / MILLIS_PER_MINUTE,
        seconds: (remaining_millis % MILLIS_PER_MINUTE) / 1000,
    };

    let mut points = base_points(elapsed_millis);
    if let Some(extra) = bonus.draw() {
        points = clamp_points(points + extra.max(0.0));
    }

    Accrual {
        countdown,
        potential_points: points,
    }
}

/// Linear ramp without any bonus, clamped to `[0, 25]` and rounded to
/// two decimals. A negative `elapsed_millis` (checkpoint in the future)
/// yields 0.
pub fn base_points(elapsed_millis: i64) -> f64 {
    let elapsed_minutes = elapsed_millis as f64 / MILLIS_PER_MINUTE as f64;
    let window_minutes = ACCRUAL_WINDOW_MILLIS as f64 / MILLIS_PER_MINUTE as f64;
    clamp_points(elapsed_minutes / window_minutes * MAX_POTENTIAL_POINTS)
}

fn clamp_points(points: f64) -> f64 {
    round2(points.clamp(0.0, MAX_POTENTIAL_POINTS))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One accrual tick: load the checkpoint, compute, persist the derived
/// fields.
pub fn tick(store: &StateStore, bonus: &mut dyn BonusSource, now: DateTime<Utc>) -> Result<Accrual> {
    let snapshot = store.load();
    let accrual = compute(now, snapshot.last_heartbeat_at(), bonus);
    store.merge(&accrual.to_patch())?;
    Ok(accrual)
}
