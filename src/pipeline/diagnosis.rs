//! Rule-based diagnosis suggestions from extracted medicines.
//!
//! Pure table lookup: each known medicine maps to the conditions it is
//! typically prescribed for. No inference from symptoms is attempted.
//! Tiers are deterministic thresholds over supporting-medicine counts and
//! table specificity, never learned probabilities.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::entities::{MedicalVocabulary, MedicineRecord};
use super::extraction::ExtractionError;
use super::{read_reference, reference_error};

pub const KNOWLEDGE_FILE: &str = "condition_knowledge.json";

const BUNDLED_KNOWLEDGE: &str = include_str!("../../resources/condition_knowledge.json");

pub const DISCLAIMER: &str =
    "AI-suggested diagnosis for reference only. Doctor verification required.";

pub const MAX_CONDITIONS: usize = 5;
pub const MAX_RECOMMENDATIONS: usize = 12;
pub const MAX_SPECIALISTS: usize = 3;
/// Items taken per category from each matched template group.
pub const ITEMS_PER_CATEGORY: usize = 3;
/// Distinct medicines at or above which the polypharmacy warning is added.
pub const POLYPHARMACY_THRESHOLD: usize = 5;

/// Shortest table key used for substring matching.
const MIN_SUBSTRING_KEY: usize = 4;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// How strongly one medicine points at one condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Specificity {
    /// The medicine is prescribed essentially only for this condition.
    High,
    Moderate,
    Low,
}

impl Specificity {
    pub fn weight(self) -> f32 {
        match self {
            Specificity::High => 1.0,
            Specificity::Moderate => 0.6,
            Specificity::Low => 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSuggestion {
    pub condition: String,
    pub confidence_tier: ConfidenceTier,
    /// One display name per independent (distinct generic) medicine.
    pub supporting_medicines: Vec<String>,
    pub support_score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialistReferral {
    pub name: String,
    pub reason: String,
    pub urgency: String,
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisSuggestionResult {
    pub possible_conditions: Vec<ConditionSuggestion>,
    pub recommendations: Vec<String>,
    pub specialists: Vec<SpecialistReferral>,
    pub disclaimer: String,
}

// ═══════════════════════════════════════════════════════════
// Knowledge table
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConditionLink {
    pub condition: String,
    pub specificity: Specificity,
}

/// Recommendation categories in output priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendationCategory {
    WarningSigns,
    RiskReduction,
    LifestyleChanges,
    DietaryAdvice,
    PreventiveMeasures,
    FollowUp,
}

impl RecommendationCategory {
    pub const ORDER: [RecommendationCategory; 6] = [
        RecommendationCategory::WarningSigns,
        RecommendationCategory::RiskReduction,
        RecommendationCategory::LifestyleChanges,
        RecommendationCategory::DietaryAdvice,
        RecommendationCategory::PreventiveMeasures,
        RecommendationCategory::FollowUp,
    ];
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecommendationGroup {
    pub name: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub warning_signs: Vec<String>,
    #[serde(default)]
    pub risk_reduction: Vec<String>,
    #[serde(default)]
    pub lifestyle_changes: Vec<String>,
    #[serde(default)]
    pub dietary_advice: Vec<String>,
    #[serde(default)]
    pub preventive_measures: Vec<String>,
    #[serde(default)]
    pub follow_up: Vec<String>,
}

impl RecommendationGroup {
    pub fn items(&self, category: RecommendationCategory) -> &[String] {
        match category {
            RecommendationCategory::WarningSigns => &self.warning_signs,
            RecommendationCategory::RiskReduction => &self.risk_reduction,
            RecommendationCategory::LifestyleChanges => &self.lifestyle_changes,
            RecommendationCategory::DietaryAdvice => &self.dietary_advice,
            RecommendationCategory::PreventiveMeasures => &self.preventive_measures,
            RecommendationCategory::FollowUp => &self.follow_up,
        }
    }

    fn matches(&self, condition_lower: &str) -> bool {
        self.keywords.iter().any(|k| condition_lower.contains(k.as_str()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolypharmacyTemplates {
    pub warning: String,
    pub follow_up: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpecialistTemplate {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub reason: String,
    pub urgency: String,
}

impl SpecialistTemplate {
    fn matches(&self, condition_lower: &str) -> bool {
        self.keywords.iter().any(|k| condition_lower.contains(k.as_str()))
    }

    fn referral(&self, condition: &str) -> SpecialistReferral {
        SpecialistReferral {
            name: self.name.clone(),
            reason: self.reason.clone(),
            urgency: self.urgency.clone(),
            condition: condition.to_string(),
        }
    }
}

/// Curated medicine -> condition table plus the static template libraries.
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionKnowledge {
    medicines: BTreeMap<String, Vec<ConditionLink>>,
    #[serde(default)]
    class_suffixes: BTreeMap<String, Vec<ConditionLink>>,
    #[serde(default)]
    recommendation_groups: Vec<RecommendationGroup>,
    #[serde(default)]
    general_follow_up: Vec<String>,
    polypharmacy: PolypharmacyTemplates,
    #[serde(default)]
    specialists: Vec<SpecialistTemplate>,
    fallback_specialist: SpecialistTemplate,
}

impl ConditionKnowledge {
    pub fn bundled() -> Result<Self, ExtractionError> {
        Self::from_json(KNOWLEDGE_FILE, BUNDLED_KNOWLEDGE)
    }

    /// Load `condition_knowledge.json` from a reference-data directory.
    pub fn load(dir: &Path) -> Result<Self, ExtractionError> {
        let raw = read_reference(dir, KNOWLEDGE_FILE)?;
        Self::from_json(KNOWLEDGE_FILE, &raw)
    }

    pub fn from_json(file: &str, raw: &str) -> Result<Self, ExtractionError> {
        let parsed: ConditionKnowledge =
            serde_json::from_str(raw).map_err(|e| reference_error(file, e))?;
        parsed.normalized().map_err(|reason| reference_error(file, reason))
    }

    /// Lowercase all lookup keys and keywords; reject empty entries.
    fn normalized(self) -> Result<Self, String> {
        fn table(
            raw: BTreeMap<String, Vec<ConditionLink>>,
            what: &str,
        ) -> Result<BTreeMap<String, Vec<ConditionLink>>, String> {
            let mut out = BTreeMap::new();
            for (key, links) in raw {
                let key = key.trim().to_lowercase();
                if key.is_empty() {
                    return Err(format!("empty {what} key"));
                }
                if links.iter().any(|l| l.condition.trim().is_empty()) {
                    return Err(format!("{what} {key:?} lists an empty condition"));
                }
                out.insert(key, links);
            }
            Ok(out)
        }
        fn lower(words: Vec<String>) -> Vec<String> {
            words
                .into_iter()
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect()
        }

        let medicines = table(self.medicines, "medicine")?;
        if medicines.is_empty() {
            return Err("knowledge table lists no medicines".into());
        }
        let class_suffixes = table(self.class_suffixes, "class suffix")?;

        let mut recommendation_groups = self.recommendation_groups;
        for group in &mut recommendation_groups {
            group.keywords = lower(std::mem::take(&mut group.keywords));
            if group.keywords.is_empty() {
                return Err(format!("recommendation group {:?} has no keywords", group.name));
            }
        }
        let mut specialists = self.specialists;
        for specialist in &mut specialists {
            specialist.keywords = lower(std::mem::take(&mut specialist.keywords));
            if specialist.keywords.is_empty() {
                return Err(format!("specialist {:?} has no keywords", specialist.name));
            }
        }

        Ok(Self {
            medicines,
            class_suffixes,
            recommendation_groups,
            general_follow_up: self.general_follow_up,
            polypharmacy: self.polypharmacy,
            specialists,
            fallback_specialist: self.fallback_specialist,
        })
    }

    pub fn medicine_count(&self) -> usize {
        self.medicines.len()
    }

    /// Conditions for one medicine: exact generic, exact name, longest
    /// contained key, then drug-class suffix.
    fn links_for(&self, name_lower: &str, generic: &str) -> Option<&[ConditionLink]> {
        if let Some(links) = self.medicines.get(generic) {
            return Some(links);
        }
        if let Some(links) = self.medicines.get(name_lower) {
            return Some(links);
        }
        let contained = self
            .medicines
            .iter()
            .filter(|(key, _)| key.len() >= MIN_SUBSTRING_KEY && name_lower.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len());
        if let Some((_, links)) = contained {
            return Some(links);
        }
        self.class_suffixes
            .iter()
            .filter(|(suffix, _)| {
                name_lower.len() >= suffix.len() + 3 && name_lower.ends_with(suffix.as_str())
            })
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(_, links)| links.as_slice())
    }
}

// ═══════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════

#[derive(Default)]
struct Support {
    /// generic -> (display name, best specificity seen)
    medicines: BTreeMap<String, (String, Specificity)>,
}

impl Support {
    fn add(&mut self, generic: &str, display: &str, specificity: Specificity) {
        self.medicines
            .entry(generic.to_string())
            .and_modify(|(_, s)| {
                if specificity.weight() > s.weight() {
                    *s = specificity;
                }
            })
            .or_insert_with(|| (display.to_string(), specificity));
    }

    /// ≥2 independent medicines, or one high-specificity medicine: High.
    /// Exactly one moderate medicine: Medium. Otherwise Low.
    fn tier(&self) -> ConfidenceTier {
        let mut specificities = self.medicines.values().map(|(_, s)| *s);
        match (self.medicines.len(), specificities.next()) {
            (n, _) if n >= 2 => ConfidenceTier::High,
            (1, Some(Specificity::High)) => ConfidenceTier::High,
            (1, Some(Specificity::Moderate)) => ConfidenceTier::Medium,
            _ => ConfidenceTier::Low,
        }
    }

    fn score(&self) -> f32 {
        self.medicines.values().map(|(_, s)| s.weight()).sum()
    }
}

pub struct DiagnosisSuggestionEngine {
    knowledge: Arc<ConditionKnowledge>,
    vocabulary: Arc<MedicalVocabulary>,
}

impl DiagnosisSuggestionEngine {
    pub fn new(knowledge: Arc<ConditionKnowledge>, vocabulary: Arc<MedicalVocabulary>) -> Self {
        Self {
            knowledge,
            vocabulary,
        }
    }

    pub fn suggest_for_records(&self, records: &[MedicineRecord]) -> DiagnosisSuggestionResult {
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        self.suggest(&names)
    }

    /// Suggest conditions for a set of medicine names.
    pub fn suggest(&self, medicine_names: &[&str]) -> DiagnosisSuggestionResult {
        let mut supplied: BTreeSet<String> = BTreeSet::new();
        let mut support: BTreeMap<String, Support> = BTreeMap::new();

        for raw in medicine_names {
            let name = raw.trim();
            if name.is_empty() {
                continue;
            }
            let name_lower = name.to_lowercase();
            let generic = self.vocabulary.generic_name(name);
            supplied.insert(generic.clone());

            let Some(links) = self.knowledge.links_for(&name_lower, &generic) else {
                tracing::debug!(medicine = %name, "No condition mapping");
                continue;
            };
            for link in links {
                support
                    .entry(link.condition.trim().to_string())
                    .or_default()
                    .add(&generic, name, link.specificity);
            }
        }

        let mut conditions: Vec<ConditionSuggestion> = support
            .into_iter()
            .map(|(condition, s)| ConditionSuggestion {
                confidence_tier: s.tier(),
                supporting_medicines: s.medicines.values().map(|(d, _)| d.clone()).collect(),
                support_score: s.score(),
                condition,
            })
            .collect();
        conditions.sort_by(|a, b| {
            b.confidence_tier
                .cmp(&a.confidence_tier)
                .then_with(|| b.supporting_medicines.len().cmp(&a.supporting_medicines.len()))
                .then_with(|| a.condition.cmp(&b.condition))
        });
        conditions.truncate(MAX_CONDITIONS);

        let (recommendations, specialists) = if conditions.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            (
                self.recommendations(&conditions, supplied.len()),
                self.specialists(&conditions),
            )
        };

        tracing::info!(
            medicines = supplied.len(),
            conditions = conditions.len(),
            recommendations = recommendations.len(),
            specialists = specialists.len(),
            "Diagnosis suggestions generated"
        );

        DiagnosisSuggestionResult {
            possible_conditions: conditions,
            recommendations,
            specialists,
            disclaimer: DISCLAIMER.to_string(),
        }
    }

    /// Flatten template groups by category priority, three items per
    /// category per group, deduplicated and capped.
    fn recommendations(&self, conditions: &[ConditionSuggestion], medicine_count: usize) -> Vec<String> {
        let mut groups: Vec<&RecommendationGroup> = Vec::new();
        for c in conditions {
            let lower = c.condition.to_lowercase();
            if let Some(group) = self
                .knowledge
                .recommendation_groups
                .iter()
                .find(|g| g.matches(&lower))
            {
                if !groups.iter().any(|g| std::ptr::eq(*g, group)) {
                    groups.push(group);
                }
            }
        }

        let polypharmacy = medicine_count >= POLYPHARMACY_THRESHOLD;
        let mut out: Vec<String> = Vec::new();
        let mut push = |item: &str| {
            if !out.iter().any(|existing| existing == item) {
                out.push(item.to_string());
            }
        };

        for category in RecommendationCategory::ORDER {
            match category {
                RecommendationCategory::WarningSigns if polypharmacy => {
                    push(&self.knowledge.polypharmacy.warning)
                }
                RecommendationCategory::FollowUp if polypharmacy => {
                    push(&self.knowledge.polypharmacy.follow_up)
                }
                _ => {}
            }

            let mut supplied_any = false;
            for group in &groups {
                for item in group.items(category).iter().take(ITEMS_PER_CATEGORY) {
                    supplied_any = true;
                    push(item);
                }
            }

            if category == RecommendationCategory::FollowUp && !supplied_any {
                for item in self.knowledge.general_follow_up.iter().take(ITEMS_PER_CATEGORY) {
                    push(item);
                }
            }
        }

        out.truncate(MAX_RECOMMENDATIONS);
        out
    }

    /// First matching specialist per condition, in condition order.
    fn specialists(&self, conditions: &[ConditionSuggestion]) -> Vec<SpecialistReferral> {
        let mut out: Vec<SpecialistReferral> = Vec::new();
        for c in conditions {
            let lower = c.condition.to_lowercase();
            let Some(template) = self.knowledge.specialists.iter().find(|s| s.matches(&lower))
            else {
                continue;
            };
            if !out.iter().any(|r| r.name == template.name) {
                out.push(template.referral(&c.condition));
            }
        }
        if out.is_empty() {
            out.push(self.knowledge.fallback_specialist.referral("General Health"));
        }
        out.truncate(MAX_SPECIALISTS);
        out
    }
}
