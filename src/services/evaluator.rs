//! Nearest-crossing selection and ETA gating
//!
//! Pure computation: no IO, no state. ETA assumes a constant nominal speed,
//! so `eta_minutes = floor(distance_m / speed)`.

use crate::domain::geo::distance_m;
use crate::domain::types::{CrossingRecord, DirectorySnapshot, Position, ProximityDecision};
use crate::infra::config::Config;

/// Distances closer than this are treated as equal and fall back to id order
const TIE_TOLERANCE_M: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct ProximityEvaluator {
    gate_threshold_m: f64,
    nominal_speed_mps: f64,
}

impl ProximityEvaluator {
    pub fn new(gate_threshold_m: f64, nominal_speed_mps: f64) -> Self {
        Self { gate_threshold_m, nominal_speed_mps }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.gate_threshold_m(), config.nominal_speed_mps())
    }

    pub fn gate_threshold_m(&self) -> f64 {
        self.gate_threshold_m
    }

    /// Pick the nearest crossing; `None` when the snapshot is empty
    pub fn evaluate(
        &self,
        position: &Position,
        snapshot: &DirectorySnapshot,
    ) -> Option<ProximityDecision> {
        let mut best: Option<(&CrossingRecord, f64)> = None;

        for record in &snapshot.records {
            let dist = distance_m(position, &record.location);
            if !dist.is_finite() {
                continue;
            }
            best = match best {
                None => Some((record, dist)),
                Some((current, current_dist)) => {
                    if (dist - current_dist).abs() <= TIE_TOLERANCE_M {
                        if record.id < current.id {
                            Some((record, dist))
                        } else {
                            Some((current, current_dist))
                        }
                    } else if dist < current_dist {
                        Some((record, dist))
                    } else {
                        Some((current, current_dist))
                    }
                }
            };
        }

        best.map(|(record, dist)| self.decide(record, dist))
    }

    /// Build the decision for one crossing at a known distance
    pub fn decide(&self, record: &CrossingRecord, distance_m: f64) -> ProximityDecision {
        let eta_minutes = self.eta_minutes(distance_m);
        ProximityDecision {
            crossing_id: record.id.clone(),
            crossing_name: record.name.clone(),
            status: record.status,
            distance_m,
            eta_minutes,
            within_gate: distance_m < self.gate_threshold_m,
            summary: summary_text(&record.name, eta_minutes, record.status.as_str()),
        }
    }

    pub fn eta_minutes(&self, distance_m: f64) -> u32 {
        if distance_m <= 0.0 {
            return 0;
        }
        (distance_m / self.nominal_speed_mps).floor() as u32
    }
}

pub fn summary_text(name: &str, eta_minutes: u32, status: &str) -> String {
    format!("{} in {} min – {}", name, eta_minutes, status)
}
