//! Plan Resolver
//!
//! Maps a provider price id to one of our internal plan tiers. Provider
//! price ids are the authoritative mapping, but configuration drift or a
//! missing table entry must never drop an event, so resolution falls back
//! through metadata hints, substring heuristics, and finally the lowest
//! paid tier flagged as uncertain.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Internal subscription level, distinct from provider price/product ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Starter,
    Pro,
    Team,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
            PlanTier::Team => "team",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(PlanTier::Free),
            "starter" => Some(PlanTier::Starter),
            "pro" => Some(PlanTier::Pro),
            "team" => Some(PlanTier::Team),
            _ => None,
        }
    }

    pub fn is_paid(&self) -> bool {
        *self != PlanTier::Free
    }

    /// Lowest paid tier, used as the last-resort resolution fallback
    pub fn lowest_paid() -> Self {
        PlanTier::Starter
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a plan tier was resolved from the event payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    /// Metadata hint written by us at checkout time
    MetadataHint,
    /// Exact match against the configured price-to-plan table
    PriceTable,
    /// Substring heuristic on the price id
    Heuristic,
    /// Nothing matched; defaulted to the lowest paid tier
    DefaultFallback,
}

/// Output of plan resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPlan {
    pub tier: PlanTier,
    pub source: PlanSource,
    /// True when the tier is a best-effort guess rather than a confident
    /// mapping. Processing continues, but the result is logged for
    /// operator attention.
    pub uncertain: bool,
}

/// Resolve a provider price id to an internal plan tier.
///
/// Resolution order:
/// 1. explicit plan hint from checkout metadata
/// 2. exact match in the configured price-to-plan table
/// 3. substring heuristics on the price id (only when exactly one tier
///    keyword appears; competing keywords are ambiguous)
/// 4. lowest paid tier, flagged uncertain
pub fn resolve(
    provider_price_id: Option<&str>,
    metadata_plan_hint: Option<&str>,
    price_table: &HashMap<String, PlanTier>,
) -> ResolvedPlan {
    if let Some(hint) = metadata_plan_hint {
        if let Some(tier) = PlanTier::parse(hint.trim()) {
            return ResolvedPlan {
                tier,
                source: PlanSource::MetadataHint,
                uncertain: false,
            };
        }
        tracing::warn!(hint = %hint, "Unrecognized plan hint in metadata, ignoring");
    }

    if let Some(price_id) = provider_price_id {
        if let Some(tier) = price_table.get(price_id) {
            return ResolvedPlan {
                tier: *tier,
                source: PlanSource::PriceTable,
                uncertain: false,
            };
        }

        let lowered = price_id.to_ascii_lowercase();
        let keyword_matches: Vec<PlanTier> = [PlanTier::Starter, PlanTier::Pro, PlanTier::Team]
            .into_iter()
            .filter(|tier| lowered.contains(tier.as_str()))
            .collect();

        if let [tier] = keyword_matches.as_slice() {
            return ResolvedPlan {
                tier: *tier,
                source: PlanSource::Heuristic,
                uncertain: false,
            };
        }
    }

    ResolvedPlan {
        tier: PlanTier::lowest_paid(),
        source: PlanSource::DefaultFallback,
        uncertain: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> HashMap<String, PlanTier> {
        let mut t = HashMap::new();
        t.insert("price_abc123".to_string(), PlanTier::Pro);
        t.insert("price_def456".to_string(), PlanTier::Team);
        t
    }

    #[test]
    fn metadata_hint_takes_priority() {
        // Hint wins even when the price table disagrees
        let resolved = resolve(Some("price_abc123"), Some("team"), &table());
        assert_eq!(resolved.tier, PlanTier::Team);
        assert_eq!(resolved.source, PlanSource::MetadataHint);
        assert!(!resolved.uncertain);
    }

    #[test]
    fn exact_price_table_match() {
        let resolved = resolve(Some("price_abc123"), None, &table());
        assert_eq!(resolved.tier, PlanTier::Pro);
        assert_eq!(resolved.source, PlanSource::PriceTable);
        assert!(!resolved.uncertain);
    }

    #[test]
    fn substring_heuristic_on_unknown_price() {
        let resolved = resolve(Some("price_live_pro_monthly"), None, &table());
        assert_eq!(resolved.tier, PlanTier::Pro);
        assert_eq!(resolved.source, PlanSource::Heuristic);
        assert!(!resolved.uncertain);
    }

    #[test]
    fn competing_keywords_fall_through_to_default() {
        // "pro" and "team" both present: ambiguous, default to lowest paid
        let resolved = resolve(Some("price_pro_team_bundle"), None, &table());
        assert_eq!(resolved.tier, PlanTier::Starter);
        assert_eq!(resolved.source, PlanSource::DefaultFallback);
        assert!(resolved.uncertain);
    }

    #[test]
    fn missing_price_id_defaults_uncertain() {
        let resolved = resolve(None, None, &table());
        assert_eq!(resolved.tier, PlanTier::lowest_paid());
        assert!(resolved.uncertain);
    }

    #[test]
    fn bad_hint_falls_back_to_table() {
        let resolved = resolve(Some("price_def456"), Some("platinum"), &table());
        assert_eq!(resolved.tier, PlanTier::Team);
        assert_eq!(resolved.source, PlanSource::PriceTable);
    }
}
