use crate::bocpd::{BocpdConfig, BocpdState, Classification};
use crate::consolidate::{ConsolidatorConfig, PatternObservation};
use std::collections::HashMap;
use sutradhar_core::{fnv1a_64, fnv1a_hex};
use sutradhar_types::{PatternType, Valence, Vasana, GLOBAL_PROJECT};

/// Feature dimensions tracked per samskara.
const FEATURES: usize = 4;

/// Outcome of crystallizing one samskara.
#[derive(Debug, Clone)]
pub enum VasanaChange {
    Created(Vasana),
    Reinforced(Vasana),
}

impl VasanaChange {
    pub fn vasana(&self) -> &Vasana {
        match self {
            VasanaChange::Created(v) | VasanaChange::Reinforced(v) => v,
        }
    }
}

/// 70/30 holdout validation: fraction of held-out values within 1.5σ of
/// the training mean. A zero-variance training set accepts exact matches.
pub fn holdout_accuracy(series: &[f64]) -> f64 {
    if series.len() < 2 {
        return 1.0;
    }
    let split = ((series.len() as f64) * 0.7).ceil() as usize;
    let split = split.clamp(1, series.len() - 1);
    let (train, holdout) = series.split_at(split);

    let mean: f64 = train.iter().sum::<f64>() / train.len() as f64;
    let variance: f64 =
        train.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / train.len() as f64;
    let sigma = variance.sqrt();

    let within = holdout
        .iter()
        .filter(|v| {
            if sigma == 0.0 {
                (**v - mean).abs() < 1e-9
            } else {
                (**v - mean).abs() <= 1.5 * sigma
            }
        })
        .count();
    within as f64 / holdout.len() as f64
}

/// Exponential decay: `strength * 2^(-dt / half_life)`.
pub fn decay_strength(strength: f64, elapsed_ms: i64, half_life_ms: i64) -> f64 {
    if elapsed_ms <= 0 || half_life_ms <= 0 {
        return strength;
    }
    strength * (-std::f64::consts::LN_2 * elapsed_ms as f64 / half_life_ms as f64).exp()
}

/// CRYSTALLIZE: BOCPD stability gate, holdout validation, vasana formation.
///
/// The crystallizer keeps one BOCPD state per feature dimension per
/// samskara across cycles; a candidate only crystallizes once every
/// dimension has been stable for the configured window, the pattern spans
/// at least two sessions, and holdout validation clears the threshold.
pub struct Crystallizer {
    config: ConsolidatorConfig,
    trackers: HashMap<String, [BocpdState; FEATURES]>,
}

impl Crystallizer {
    pub fn new(config: ConsolidatorConfig) -> Self {
        Self {
            config,
            trackers: HashMap::new(),
        }
    }

    fn tracker_config() -> BocpdConfig {
        BocpdConfig {
            expected_run_length: 100.0,
            revert_window: 3,
            confirm_ratio: 0.6,
            max_run_length: 200,
        }
    }

    /// Feature scalars for one samskara observation at cumulative state
    /// (count observed so far, running confidence).
    fn features(observation: &PatternObservation, cumulative: f64) -> [f64; FEATURES] {
        let type_code = match observation.samskara.pattern_type {
            PatternType::ToolSequence => 0.0,
            PatternType::Preference => 0.25,
            PatternType::Decision => 0.5,
            PatternType::Correction => 0.75,
            PatternType::Convention => 1.0,
        };
        let hash_cluster = (fnv1a_64(observation.samskara.id.as_bytes()) % 1000) as f64 / 1000.0;
        [
            type_code,
            cumulative / (cumulative + 2.0),
            (1.0 + cumulative).ln(),
            hash_cluster,
        ]
    }

    /// Run the stability gate and produce vasana changes. `existing` is the
    /// already-persisted tendency set keyed by id; `now_ms` stamps
    /// activations.
    pub fn crystallize(
        &mut self,
        observations: &[PatternObservation],
        existing: &HashMap<String, Vasana>,
        now_ms: i64,
    ) -> Vec<VasanaChange> {
        let mut changes = Vec::new();

        for observation in observations {
            let trackers = self
                .trackers
                .entry(observation.samskara.id.clone())
                .or_insert_with(|| {
                    [
                        BocpdState::new(Self::tracker_config()),
                        BocpdState::new(Self::tracker_config()),
                        BocpdState::new(Self::tracker_config()),
                        BocpdState::new(Self::tracker_config()),
                    ]
                });

            // One BOCPD observation per session the pattern appeared in,
            // with confidence and log-count evolving cumulatively.
            let mut cumulative = 0.0;
            let mut saw_change_point = false;
            for per_session in &observation.series {
                cumulative += per_session;
                let features = Self::features(observation, cumulative);
                for (tracker, feature) in trackers.iter_mut().zip(features.iter()) {
                    if tracker.observe(*feature) == Classification::ChangePoint {
                        saw_change_point = true;
                    }
                }
            }

            let stable_count = trackers
                .iter()
                .map(|t| t.consecutive_stable())
                .min()
                .unwrap_or(0);

            if saw_change_point || stable_count < self.config.stability_window {
                continue;
            }
            if observation.sessions.len() < 2 {
                continue;
            }
            let accuracy = holdout_accuracy(&observation.series);
            if accuracy < self.config.accuracy_threshold {
                continue;
            }

            let tendency = tendency_name(&observation.samskara.pattern_type, &observation.samskara.content);
            let id = fnv1a_hex(&format!("{}:{}", tendency, observation.samskara.project));

            let change = match existing.get(&id) {
                Some(current) => {
                    let mut vasana = current.clone();
                    vasana.strength = (vasana.strength + 0.1).min(1.0);
                    vasana.reinforcement_count += 1;
                    vasana.last_activated_ms = now_ms;
                    vasana.predictive_accuracy = accuracy;
                    if !vasana.source_samskaras.contains(&observation.samskara.id) {
                        vasana.source_samskaras.push(observation.samskara.id.clone());
                    }
                    VasanaChange::Reinforced(vasana)
                }
                None => VasanaChange::Created(Vasana {
                    id,
                    tendency: tendency.clone(),
                    description: format!(
                        "{} pattern observed {} times across {} sessions",
                        observation.samskara.pattern_type.as_str(),
                        observation.samskara.observation_count,
                        observation.sessions.len()
                    ),
                    strength: (0.5 + accuracy * 0.3).min(1.0),
                    stability: (observation.sessions.len() as f64
                        / self.config.stability_window.max(1) as f64)
                        .min(1.0),
                    valence: valence_for(observation.samskara.pattern_type),
                    source_samskaras: vec![observation.samskara.id.clone()],
                    reinforcement_count: 1,
                    last_activated_ms: now_ms,
                    predictive_accuracy: accuracy,
                    project: observation.samskara.project.clone(),
                }),
            };
            changes.push(change);
        }

        changes
    }
}

fn valence_for(pattern_type: PatternType) -> Valence {
    match pattern_type {
        PatternType::Correction => Valence::Negative,
        PatternType::Preference | PatternType::Convention => Valence::Positive,
        PatternType::ToolSequence | PatternType::Decision => Valence::Neutral,
    }
}

/// Human-readable tendency slug: `read,edit,bash` → `read-then-edit-then-bash`.
fn tendency_name(pattern_type: &PatternType, content: &str) -> String {
    if *pattern_type == PatternType::ToolSequence {
        return content
            .split(',')
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("-then-");
    }
    let slug: String = content
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let mut compact = String::with_capacity(slug.len());
    let mut last_dash = true;
    for c in slug.chars() {
        if c == '-' {
            if !last_dash {
                compact.push('-');
            }
            last_dash = true;
        } else {
            compact.push(c);
            last_dash = false;
        }
    }
    compact.trim_matches('-').chars().take(60).collect()
}

/// Promote tendencies that hold across enough projects into the global
/// scope: strengths are averaged and source samskaras unioned.
pub fn promote_vasanas(all: &[Vasana], min_projects: usize, now_ms: i64) -> Vec<Vasana> {
    let mut by_tendency: HashMap<&str, Vec<&Vasana>> = HashMap::new();
    for vasana in all {
        if vasana.project == GLOBAL_PROJECT || vasana.strength < 0.4 {
            continue;
        }
        by_tendency.entry(&vasana.tendency).or_default().push(vasana);
    }

    let mut promoted = Vec::new();
    for (tendency, group) in by_tendency {
        let projects: std::collections::HashSet<&str> =
            group.iter().map(|v| v.project.as_str()).collect();
        if projects.len() < min_projects {
            continue;
        }

        let strength = group.iter().map(|v| v.strength).sum::<f64>() / group.len() as f64;
        let stability = group.iter().map(|v| v.stability).sum::<f64>() / group.len() as f64;
        let mut sources: Vec<String> = group
            .iter()
            .flat_map(|v| v.source_samskaras.iter().cloned())
            .collect();
        sources.sort();
        sources.dedup();

        let mut negative = 0usize;
        let mut positive = 0usize;
        for vasana in &group {
            match vasana.valence {
                Valence::Negative => negative += 1,
                Valence::Positive => positive += 1,
                Valence::Neutral => {}
            }
        }
        let valence = if negative > positive {
            Valence::Negative
        } else if positive > negative {
            Valence::Positive
        } else {
            Valence::Neutral
        };

        promoted.push(Vasana {
            id: fnv1a_hex(&format!("{}:{}", tendency, GLOBAL_PROJECT)),
            tendency: tendency.to_string(),
            description: format!("{} (promoted from {} projects)", tendency, projects.len()),
            strength,
            stability,
            valence,
            source_samskaras: sources,
            reinforcement_count: group.iter().map(|v| v.reinforcement_count).sum(),
            last_activated_ms: now_ms,
            predictive_accuracy: group.iter().map(|v| v.predictive_accuracy).sum::<f64>()
                / group.len() as f64,
            project: GLOBAL_PROJECT.to_string(),
        });
    }

    promoted.sort_by(|a, b| a.id.cmp(&b.id));
    promoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use sutradhar_types::Samskara;

    fn observation(sessions: usize) -> PatternObservation {
        PatternObservation {
            samskara: Samskara {
                id: fnv1a_hex("tool-sequence:read,edit,bash"),
                session_id: format!("s{}", sessions - 1),
                pattern_type: PatternType::ToolSequence,
                content: "read,edit,bash".to_string(),
                observation_count: sessions as u64,
                confidence: 0.7,
                project: "demo".to_string(),
            },
            sessions: (0..sessions).map(|i| format!("s{}", i)).collect(),
            series: vec![1.0; sessions],
        }
    }

    #[test]
    fn test_holdout_accuracy_uniform_series() {
        assert_eq!(holdout_accuracy(&[1.0, 1.0, 1.0, 1.0, 1.0]), 1.0);
    }

    #[test]
    fn test_holdout_accuracy_outlier_tail() {
        let accuracy = holdout_accuracy(&[1.0, 1.0, 1.0, 1.0, 50.0]);
        assert_eq!(accuracy, 0.0);
    }

    #[test]
    fn test_decay_strength_half_life() {
        let half = decay_strength(0.8, 1000, 1000);
        assert!((half - 0.4).abs() < 1e-9);
        assert_eq!(decay_strength(0.8, 0, 1000), 0.8);
    }

    #[test]
    fn test_crystallize_stable_pattern_across_five_sessions() {
        let config = ConsolidatorConfig::default();
        let mut crystallizer = Crystallizer::new(config);

        let changes = crystallizer.crystallize(&[observation(5)], &HashMap::new(), 1_000);
        assert_eq!(changes.len(), 1);

        let vasana = changes[0].vasana();
        assert_eq!(vasana.tendency, "read-then-edit-then-bash");
        assert!(vasana.strength >= 0.5);
        assert!(vasana.stability >= 0.6);
        assert_eq!(vasana.valence, Valence::Neutral);
    }

    #[test]
    fn test_single_session_pattern_not_crystallized() {
        let mut crystallizer = Crystallizer::new(ConsolidatorConfig::default());
        let changes = crystallizer.crystallize(&[observation(1)], &HashMap::new(), 1_000);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_reinforcement_bumps_strength_and_count() {
        let mut crystallizer = Crystallizer::new(ConsolidatorConfig::default());
        let first = crystallizer.crystallize(&[observation(5)], &HashMap::new(), 1_000);
        let created = first[0].vasana().clone();

        let mut existing = HashMap::new();
        existing.insert(created.id.clone(), created.clone());

        let second = crystallizer.crystallize(&[observation(5)], &existing, 2_000);
        assert_eq!(second.len(), 1);
        match &second[0] {
            VasanaChange::Reinforced(vasana) => {
                assert!((vasana.strength - (created.strength + 0.1).min(1.0)).abs() < 1e-9);
                assert_eq!(vasana.reinforcement_count, created.reinforcement_count + 1);
                assert_eq!(vasana.last_activated_ms, 2_000);
            }
            other => panic!("Expected reinforcement, got {:?}", other),
        }
    }

    #[test]
    fn test_tendency_name_slugs() {
        assert_eq!(
            tendency_name(&PatternType::ToolSequence, "read,edit,bash"),
            "read-then-edit-then-bash"
        );
        assert_eq!(
            tendency_name(&PatternType::Preference, "please use rg for search"),
            "please-use-rg-for-search"
        );
    }

    #[test]
    fn test_promotion_requires_project_spread() {
        let make = |project: &str| Vasana {
            id: fnv1a_hex(&format!("read-then-edit:{}", project)),
            tendency: "read-then-edit".to_string(),
            description: String::new(),
            strength: 0.6,
            stability: 0.5,
            valence: Valence::Neutral,
            source_samskaras: vec![format!("src-{}", project)],
            reinforcement_count: 2,
            last_activated_ms: 0,
            predictive_accuracy: 0.8,
            project: project.to_string(),
        };

        let one_project = promote_vasanas(&[make("a")], 2, 10);
        assert!(one_project.is_empty());

        let promoted = promote_vasanas(&[make("a"), make("b")], 2, 10);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].project, GLOBAL_PROJECT);
        assert!((promoted[0].strength - 0.6).abs() < 1e-9);
        assert_eq!(promoted[0].source_samskaras.len(), 2);
    }

    #[test]
    fn test_weak_vasanas_not_promoted() {
        let weak = Vasana {
            id: "x".to_string(),
            tendency: "weak".to_string(),
            description: String::new(),
            strength: 0.2,
            stability: 0.5,
            valence: Valence::Neutral,
            source_samskaras: vec![],
            reinforcement_count: 1,
            last_activated_ms: 0,
            predictive_accuracy: 0.0,
            project: "a".to_string(),
        };
        let other = Vasana {
            project: "b".to_string(),
            ..weak.clone()
        };
        assert!(promote_vasanas(&[weak, other], 2, 10).is_empty());
    }
}
