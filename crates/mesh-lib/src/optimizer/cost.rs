//! Candidate scoring and current-channel inference

use super::{ForecastEntry, Tunables};
use std::collections::HashMap;

/// Weight of the shared channel load in the cost function. Loads are sums
/// of busy-percent contributions, so costs above 100 are possible and are
/// deliberately not clamped.
pub(crate) const LOAD_WEIGHT: f64 = 0.5;

/// Cost of putting a node on a channel, given that channel's forecast entry
/// and current shared load.
pub(crate) fn candidate_cost(
    entry: &ForecastEntry,
    load: f64,
    in_recent_targets: bool,
    tunables: &Tunables,
) -> f64 {
    entry.forecast
        + LOAD_WEIGHT * load
        + (1.0 - entry.confidence) * tunables.low_confidence_penalty_scale
        + if in_recent_targets {
            tunables.history_penalty
        } else {
            0.0
        }
}

/// Pick the cheapest candidate. Ties fall to map iteration order, which
/// callers must not rely on.
pub(crate) fn best_candidate(
    entries: &HashMap<u32, ForecastEntry>,
    channel_load: &HashMap<u32, f64>,
    recent_targets: &[u32],
    tunables: &Tunables,
) -> Option<(u32, f64)> {
    let mut best: Option<(u32, f64)> = None;
    for (&channel, entry) in entries {
        let load = channel_load.get(&channel).copied().unwrap_or(0.0);
        let cost = candidate_cost(
            entry,
            load,
            recent_targets.contains(&channel),
            tunables,
        );
        if best.map(|(_, c)| cost < c).unwrap_or(true) {
            best = Some((channel, cost));
        }
    }
    best
}

/// Infer which channel a node is currently operating on when no assignment
/// has been committed yet: prefer the channel with the most real samples,
/// falling back to the highest-confidence entry.
pub(crate) fn infer_current_channel(entries: &HashMap<u32, ForecastEntry>) -> Option<u32> {
    let by_samples = entries
        .iter()
        .filter(|(_, e)| !e.synthetic && e.sample_count > 0)
        .max_by_key(|(_, e)| e.sample_count)
        .map(|(&ch, _)| ch);
    if by_samples.is_some() {
        return by_samples;
    }

    entries
        .iter()
        .max_by(|(_, a), (_, b)| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(&ch, _)| ch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn entry(forecast: f64, confidence: f64, synthetic: bool, sample_count: u32) -> ForecastEntry {
        ForecastEntry {
            forecast,
            confidence,
            synthetic,
            sample_count,
            avg_num_clients: None,
            last_updated: Instant::now(),
            seen_real: !synthetic,
        }
    }

    #[test]
    fn cost_adds_load_and_penalties() {
        let tunables = Tunables {
            low_confidence_penalty_scale: 10.0,
            history_penalty: 7.0,
            ..Default::default()
        };
        let e = entry(20.0, 0.8, false, 5);
        // 20 + 0.5*30 + 0.2*10 = 37
        assert!((candidate_cost(&e, 30.0, false, &tunables) - 37.0).abs() < 1e-9);
        assert!((candidate_cost(&e, 30.0, true, &tunables) - 44.0).abs() < 1e-9);
    }

    #[test]
    fn cost_is_not_clamped_above_100() {
        let tunables = Tunables::default();
        let e = entry(95.0, 1.0, false, 5);
        assert!(candidate_cost(&e, 80.0, false, &tunables) > 100.0);
    }

    #[test]
    fn best_candidate_picks_argmin() {
        let tunables = Tunables::default();
        let mut entries = HashMap::new();
        entries.insert(1, entry(60.0, 0.9, false, 3));
        entries.insert(6, entry(20.0, 0.9, false, 3));
        entries.insert(11, entry(80.0, 0.9, false, 3));

        let (ch, cost) =
            best_candidate(&entries, &HashMap::new(), &[], &tunables).unwrap();
        assert_eq!(ch, 6);
        assert!((cost - 20.0).abs() < 1e-9);
    }

    #[test]
    fn load_can_change_the_winner() {
        let tunables = Tunables::default();
        let mut entries = HashMap::new();
        entries.insert(1, entry(30.0, 0.9, false, 3));
        entries.insert(6, entry(20.0, 0.9, false, 3));

        let mut load = HashMap::new();
        load.insert(6, 40.0); // 20 + 20 = 40 beats 30
        let (ch, _) = best_candidate(&entries, &load, &[], &tunables).unwrap();
        assert_eq!(ch, 1);
    }

    #[test]
    fn inference_prefers_real_samples_over_confidence() {
        let mut entries = HashMap::new();
        entries.insert(1, entry(60.0, 0.99, true, 0));
        entries.insert(6, entry(20.0, 0.4, false, 12));
        entries.insert(11, entry(80.0, 0.5, false, 7));

        assert_eq!(infer_current_channel(&entries), Some(6));
    }

    #[test]
    fn inference_falls_back_to_highest_confidence() {
        let mut entries = HashMap::new();
        entries.insert(1, entry(60.0, 0.3, true, 0));
        entries.insert(6, entry(20.0, 0.7, true, 0));

        assert_eq!(infer_current_channel(&entries), Some(6));
        assert_eq!(infer_current_channel(&HashMap::new()), None);
    }
}
