//! Ordering of new-card candidates.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::config::TieBreak;
use crate::model::Card;

/// A card eligible as new material, with its position in the enumerated
/// candidate set.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The candidate card.
    pub card: Card,
    /// Index in enumeration order.
    pub position: usize,
}

impl Candidate {
    /// Global rating of the card.
    pub fn elo(&self) -> f64 {
        self.card.elo.global
    }
}

/// Strategy ordering new cards, best first.
pub trait CandidateRanker: Send + Sync {
    /// Order `candidates` for a learner targeting `target_elo`.
    fn rank(&self, candidates: Vec<Candidate>, target_elo: f64) -> Vec<Candidate>;
}

/// Prefers cards whose rating is close to the target, in bands of
/// `band_width`. Cards within a band keep enumeration order unless a seeded
/// shuffle is configured.
#[derive(Debug, Clone)]
pub struct EloProximityRanker {
    band_width: f64,
    tie_break: TieBreak,
}

impl EloProximityRanker {
    /// `band_width` must be positive.
    pub fn new(band_width: f64, tie_break: TieBreak) -> Self {
        Self {
            band_width,
            tie_break,
        }
    }

    fn band(&self, elo: f64, target: f64) -> u64 {
        ((elo - target).abs() / self.band_width).floor() as u64
    }
}

impl CandidateRanker for EloProximityRanker {
    fn rank(&self, mut candidates: Vec<Candidate>, target_elo: f64) -> Vec<Candidate> {
        candidates.sort_by_key(|c| (self.band(c.elo(), target_elo), c.position));

        if let TieBreak::Shuffle { seed } = self.tie_break {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut start = 0;
            while start < candidates.len() {
                let band = self.band(candidates[start].elo(), target_elo);
                let end = candidates[start..]
                    .iter()
                    .position(|c| self.band(c.elo(), target_elo) != band)
                    .map_or(candidates.len(), |offset| start + offset);
                candidates[start..end].shuffle(&mut rng);
                start = end;
            }
        }
        candidates
    }
}

/// Median rating of a candidate set; `None` when empty.
pub(crate) fn median_elo(candidates: &[Candidate]) -> Option<f64> {
    if candidates.is_empty() {
        return None;
    }
    let mut elos: Vec<f64> = candidates.iter().map(Candidate::elo).collect();
    elos.sort_by(f64::total_cmp);
    let mid = elos.len() / 2;
    Some(if elos.len() % 2 == 0 {
        (elos[mid - 1] + elos[mid]) / 2.0
    } else {
        elos[mid]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CardElo;
    use chrono::DateTime;

    fn candidate(id: &str, elo: f64, position: usize) -> Candidate {
        Candidate {
            card: Card {
                id: id.into(),
                course_id: "c1".into(),
                shape: "math".into(),
                fields: Default::default(),
                tags: vec![],
                author: "alice".into(),
                elo: CardElo::new(elo),
                created_at: DateTime::from_timestamp(0, 0).unwrap(),
                updated_at: None,
            },
            position,
        }
    }

    fn ids(ranked: &[Candidate]) -> Vec<&str> {
        ranked.iter().map(|c| c.card.id.as_str()).collect()
    }

    #[test]
    fn test_closest_band_first_then_insertion_order() {
        let ranker = EloProximityRanker::new(100.0, TieBreak::InsertionOrder);
        let ranked = ranker.rank(
            vec![
                candidate("far", 1600.0, 0),
                candidate("near-b", 1040.0, 1),
                candidate("near-a", 960.0, 2),
                candidate("mid", 1150.0, 3),
            ],
            1000.0,
        );
        assert_eq!(ids(&ranked), vec!["near-b", "near-a", "mid", "far"]);
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible_and_band_preserving() {
        let ranker = EloProximityRanker::new(100.0, TieBreak::Shuffle { seed: 42 });
        let make = || {
            (0..8)
                .map(|i| candidate(&format!("n{}", i), 1000.0 + i as f64, i))
                .chain([candidate("far", 2000.0, 8)])
                .collect::<Vec<_>>()
        };
        let first = ranker.rank(make(), 1000.0);
        let second = ranker.rank(make(), 1000.0);
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(first.last().unwrap().card.id, "far");
    }

    #[test]
    fn test_median() {
        assert_eq!(median_elo(&[]), None);
        assert_eq!(
            median_elo(&[candidate("a", 1200.0, 0), candidate("b", 1800.0, 1)]),
            Some(1500.0)
        );
        assert_eq!(
            median_elo(&[
                candidate("a", 900.0, 0),
                candidate("b", 1800.0, 1),
                candidate("c", 1000.0, 2)
            ]),
            Some(1000.0)
        );
    }
}
