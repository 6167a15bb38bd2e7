use crate::types::RecordProfile;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Completeness checks that contribute to a record's quality score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Identifier,
    /// Description (or post body) present and at least the minimum length
    Description,
    SeverityScore,
    References,
    Title,
    Author,
}

/// Per-criterion weights. Fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualityWeights(BTreeMap<Criterion, f64>);

impl QualityWeights {
    pub fn new(weights: impl IntoIterator<Item = (Criterion, f64)>) -> Self {
        Self(weights.into_iter().collect())
    }

    /// Equal quarters over the criteria that make sense for the profile
    pub fn for_profile(profile: RecordProfile) -> Self {
        let criteria = match profile {
            RecordProfile::Nvd => [
                Criterion::Identifier,
                Criterion::Description,
                Criterion::SeverityScore,
                Criterion::References,
            ],
            RecordProfile::Posts => [
                Criterion::Identifier,
                Criterion::Author,
                Criterion::Title,
                Criterion::Description,
            ],
        };
        Self::new(criteria.into_iter().map(|c| (c, 0.25)))
    }

    pub fn weight(&self, criterion: Criterion) -> f64 {
        self.0.get(&criterion).copied().unwrap_or(0.0)
    }

    pub fn validate(&self) -> Result<(), String> {
        for (criterion, weight) in &self.0 {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(format!("weight for {:?} must be a finite, non-negative number", criterion));
            }
        }
        if self.0.values().sum::<f64>() <= 0.0 {
            return Err("at least one weight must be positive".to_string());
        }
        Ok(())
    }
}

/// Which criteria a record satisfies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualitySignals(BTreeSet<Criterion>);

impl QualitySignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, criterion: Criterion, satisfied: bool) -> &mut Self {
        if satisfied {
            self.0.insert(criterion);
        }
        self
    }

    pub fn satisfies(&self, criterion: Criterion) -> bool {
        self.0.contains(&criterion)
    }
}

/// Weighted sum of satisfied criteria, clamped to [0, 1].
///
/// Weights are non-negative, so satisfying more criteria never lowers the score.
/// The result is rounded to six decimals so sums like 0.1 + 0.2 compare equal
/// across runs and platforms.
#[derive(Debug, Clone)]
pub struct QualityScorer {
    weights: QualityWeights,
}

impl QualityScorer {
    pub fn new(weights: QualityWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &QualityWeights {
        &self.weights
    }

    pub fn score(&self, signals: &QualitySignals) -> f64 {
        let raw: f64 = signals.0.iter().map(|c| self.weights.weight(*c)).sum();
        let clamped = raw.clamp(0.0, 1.0);
        (clamped * 1_000_000.0).round() / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(criteria: &[Criterion]) -> QualitySignals {
        let mut s = QualitySignals::new();
        for c in criteria {
            s.mark(*c, true);
        }
        s
    }

    #[test]
    fn test_all_criteria_score_one() {
        let scorer = QualityScorer::new(QualityWeights::for_profile(RecordProfile::Nvd));
        let all = signals(&[
            Criterion::Identifier,
            Criterion::Description,
            Criterion::SeverityScore,
            Criterion::References,
        ]);
        assert_eq!(scorer.score(&all), 1.0);
        assert_eq!(scorer.score(&signals(&[Criterion::Identifier])), 0.25);
    }

    #[test]
    fn test_score_is_monotonic() {
        let scorer = QualityScorer::new(QualityWeights::for_profile(RecordProfile::Nvd));
        let optional = [Criterion::Description, Criterion::SeverityScore, Criterion::References];

        // every subset of optional criteria, id always present
        for mask in 0u8..8 {
            let mut base = vec![Criterion::Identifier];
            base.extend(optional.iter().enumerate().filter(|(i, _)| mask & (1u8 << *i) != 0).map(|(_, c)| *c));
            let base_score = scorer.score(&signals(&base));

            for extra in optional.iter().filter(|c| !base.contains(*c)) {
                let mut more = base.clone();
                more.push(*extra);
                assert!(scorer.score(&signals(&more)) >= base_score);
            }
        }
    }

    #[test]
    fn test_score_is_clamped() {
        let scorer = QualityScorer::new(QualityWeights::new([
            (Criterion::Identifier, 0.8),
            (Criterion::Description, 0.8),
        ]));
        assert_eq!(scorer.score(&signals(&[Criterion::Identifier, Criterion::Description])), 1.0);
        assert_eq!(scorer.score(&QualitySignals::new()), 0.0);
    }

    #[test]
    fn test_score_is_deterministic() {
        let scorer = QualityScorer::new(QualityWeights::new([
            (Criterion::Identifier, 0.1),
            (Criterion::Description, 0.2),
            (Criterion::References, 0.3),
        ]));
        let s = signals(&[Criterion::References, Criterion::Identifier, Criterion::Description]);
        let first = scorer.score(&s);
        for _ in 0..10 {
            assert_eq!(scorer.score(&s), first);
        }
        assert_eq!(first, 0.6);
    }

    #[test]
    fn test_weight_validation() {
        assert!(QualityWeights::for_profile(RecordProfile::Posts).validate().is_ok());
        assert!(QualityWeights::new([(Criterion::Title, -0.1)]).validate().is_err());
        assert!(QualityWeights::new([(Criterion::Title, f64::NAN)]).validate().is_err());
        assert!(QualityWeights::new([(Criterion::Title, 0.0)]).validate().is_err());
    }
}
