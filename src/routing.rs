use crate::{
    config::{Mode, RoutingConfig, Thresholds, UpstreamConfig},
    quota::QuotaSnapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Universe {
    Free,
    Enterprise,
}

/// Where a request is going and why. Computed once per request; recomputed
/// at most once more if the upstream rejects and a transparent fallback
/// applies.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub universe: Universe,
    pub model: String,
    pub is_fallback_active: bool,
    pub fallback_reason: Option<String>,
}

impl RoutingDecision {
    pub fn chat_url<'a>(&self, upstream: &'a UpstreamConfig) -> &'a str {
        match self.universe {
            Universe::Enterprise => &upstream.enterprise_chat_url,
            Universe::Free => &upstream.free_chat_url,
        }
    }

    pub fn needs_auth(&self) -> bool {
        self.universe == Universe::Enterprise
    }
}

/// Splits an `enter/` or `free/` namespace prefix off a model id. Absence of
/// either prefix defaults to the free universe.
pub fn split_namespace(model: &str) -> (Universe, &str) {
    if let Some(rest) = model.strip_prefix("enter/") {
        (Universe::Enterprise, rest)
    } else if let Some(rest) = model.strip_prefix("free/") {
        (Universe::Free, rest)
    } else {
        (Universe::Free, model)
    }
}

/// Bare model id for outbound bodies; fallback config entries keep their
/// namespace for display purposes.
pub fn strip_namespace(model: &str) -> &str {
    split_namespace(model).1
}

/// The safety-net decision table, keyed by (mode, quota state). Only
/// consulted for enterprise-bound requests; manual mode never switches.
pub fn evaluate_safety_net(
    mode: Mode,
    quota: &QuotaSnapshot,
    thresholds: &Thresholds,
) -> Option<String> {
    let tier_low = quota.tier_ratio() <= thresholds.tier_percent / 100.0;
    match (mode, quota.is_error()) {
        (Mode::Manual, _) => None,
        (_, true) => Some("Quota Unreachable (Safety)".to_string()),
        (Mode::Alwaysfree, false) if tier_low => Some(format!(
            "Daily Tier < {}% (Wallet Protected)",
            thresholds.tier_percent
        )),
        // Tier-first, wallet-as-last-resort: enterprise stays usable as long
        // as either reservoir is healthy.
        (Mode::Pro, false)
            if tier_low && quota.wallet_balance < thresholds.wallet_usd =>
        {
            Some("Wallet & Tier Critical".to_string())
        }
        _ => None,
    }
}

pub fn resolve_route(
    model_field: &str,
    routing: &RoutingConfig,
    quota: &QuotaSnapshot,
) -> RoutingDecision {
    let requested = if model_field.is_empty() {
        "openai"
    } else {
        model_field
    };
    let (mut universe, model) = split_namespace(requested);
    let mut model = model.to_string();
    let mut is_fallback_active = false;
    let mut fallback_reason = None;

    if universe == Universe::Enterprise {
        if let Some(reason) = evaluate_safety_net(routing.mode, quota, &routing.thresholds) {
            model = strip_namespace(&routing.fallbacks.free_main).to_string();
            universe = Universe::Free;
            is_fallback_active = true;
            tracing::info!(reason = %reason, fallback = %model, "safety net rerouted request");
            fallback_reason = Some(reason);
        }
    }

    RoutingDecision {
        universe,
        model,
        is_fallback_active,
        fallback_reason,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroundingPolicy {
    Keep,
    /// The grounding-disable flag is required even for enterprise keys.
    DisableAlways,
    /// Enterprise keys reject the extra field; only send it on free.
    DisableOnFree,
}

/// Per-family body-rewriting behavior. Matched by ordered substring/prefix
/// rules so the rule set is testable without touching handler control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelRules {
    /// Cap on the forwarded tool list.
    pub max_tools: Option<usize>,
    /// Maximum accepted tool-call id length; ids and their back-references
    /// are truncated identically.
    pub truncate_tool_ids: Option<usize>,
    pub sanitize_schemas: bool,
    /// Drop the built-in search tool; it conflicts with function tools.
    pub drop_search_tool: bool,
    pub grounding: GroundingPolicy,
    /// Repetition/presence penalties plus stop sequences against observed
    /// infinite tool-call loops.
    pub loop_penalties: bool,
    pub inject_signatures: bool,
}

pub const PASSTHROUGH_RULES: ModelRules = ModelRules {
    max_tools: None,
    truncate_tool_ids: None,
    sanitize_schemas: false,
    drop_search_tool: false,
    grounding: GroundingPolicy::Keep,
    loop_penalties: false,
    inject_signatures: false,
};

enum FamilyMatch {
    Exact(&'static str),
    AnyOf(&'static [&'static str]),
}

impl FamilyMatch {
    fn matches(&self, model: &str) -> bool {
        match self {
            FamilyMatch::Exact(name) => model == *name,
            FamilyMatch::AnyOf(needles) => needles.iter().any(|needle| model.contains(needle)),
        }
    }
}

struct FamilyRule {
    matcher: FamilyMatch,
    rules: ModelRules,
}

const FAMILY_RULES: &[FamilyRule] = &[
    // Search-augmented Gemini variant: grounding must be disabled on every
    // universe, and the search tool itself is kept.
    FamilyRule {
        matcher: FamilyMatch::Exact("nomnom"),
        rules: ModelRules {
            sanitize_schemas: true,
            grounding: GroundingPolicy::DisableAlways,
            inject_signatures: true,
            ..PASSTHROUGH_RULES
        },
    },
    FamilyRule {
        matcher: FamilyMatch::AnyOf(&["kimi", "moonshot"]),
        rules: ModelRules {
            loop_penalties: true,
            ..PASSTHROUGH_RULES
        },
    },
    FamilyRule {
        matcher: FamilyMatch::AnyOf(&["gpt", "openai", "azure"]),
        rules: ModelRules {
            max_tools: Some(120),
            truncate_tool_ids: Some(40),
            ..PASSTHROUGH_RULES
        },
    },
    FamilyRule {
        matcher: FamilyMatch::AnyOf(&["gemini"]),
        rules: ModelRules {
            sanitize_schemas: true,
            drop_search_tool: true,
            grounding: GroundingPolicy::DisableOnFree,
            inject_signatures: true,
            ..PASSTHROUGH_RULES
        },
    },
];

pub fn rules_for(model: &str) -> ModelRules {
    FAMILY_RULES
        .iter()
        .find(|rule| rule.matcher.matches(model))
        .map(|rule| rule.rules)
        .unwrap_or(PASSTHROUGH_RULES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn quota(tier: &str, limit: f64, remaining: f64, wallet: f64) -> QuotaSnapshot {
        QuotaSnapshot {
            tier: tier.to_string(),
            tier_emoji: "🌸",
            tier_limit: limit,
            tier_used: (limit - remaining).max(0.0),
            tier_remaining: remaining,
            wallet_balance: wallet,
            next_reset_at: Utc::now(),
            can_use_enterprise: remaining > 0.05 || wallet > 0.05,
            is_using_wallet: remaining <= 0.05 && wallet > 0.05,
            needs_alert: false,
        }
    }

    fn routing(mode: Mode) -> RoutingConfig {
        let mut config = RoutingConfig::default();
        config.mode = mode;
        config.api_key = Some("sk-test".to_string());
        config
    }

    #[test]
    fn namespace_prefix_selects_universe_and_is_stripped() {
        assert_eq!(
            split_namespace("enter/gemini-pro"),
            (Universe::Enterprise, "gemini-pro")
        );
        assert_eq!(split_namespace("free/mistral"), (Universe::Free, "mistral"));
        assert_eq!(split_namespace("openai"), (Universe::Free, "openai"));
    }

    #[test]
    fn resolve_strips_namespace_for_outbound_model() {
        let q = quota("flower", 10.0, 8.0, 3.0);
        let decision = resolve_route("enter/gemini-pro", &routing(Mode::Manual), &q);
        assert_eq!(decision.universe, Universe::Enterprise);
        assert_eq!(decision.model, "gemini-pro");
        assert!(!decision.is_fallback_active);

        let decision = resolve_route("free/mistral", &routing(Mode::Manual), &q);
        assert_eq!(decision.universe, Universe::Free);
        assert_eq!(decision.model, "mistral");
    }

    #[test]
    fn alwaysfree_switches_at_or_below_tier_threshold() {
        // tierLimit=10, threshold=10%: remaining 0.5 (5%) switches.
        let decision = resolve_route(
            "enter/gemini-pro",
            &routing(Mode::Alwaysfree),
            &quota("flower", 10.0, 0.5, 50.0),
        );
        assert_eq!(decision.universe, Universe::Free);
        assert_eq!(decision.model, "mistral");
        assert!(decision.is_fallback_active);
        assert!(decision.fallback_reason.is_some());

        // Remaining 2 (20%) stays on enterprise.
        let decision = resolve_route(
            "enter/gemini-pro",
            &routing(Mode::Alwaysfree),
            &quota("flower", 10.0, 2.0, 50.0),
        );
        assert_eq!(decision.universe, Universe::Enterprise);
        assert!(!decision.is_fallback_active);
    }

    #[test]
    fn pro_requires_both_tier_and_wallet_low() {
        // Tier at 5% but wallet healthy ($20 >= $5 threshold): stay.
        let decision = resolve_route(
            "enter/gemini-pro",
            &routing(Mode::Pro),
            &quota("flower", 10.0, 0.5, 20.0),
        );
        assert_eq!(decision.universe, Universe::Enterprise);

        // Tier at 5% and wallet $2: switch.
        let decision = resolve_route(
            "enter/gemini-pro",
            &routing(Mode::Pro),
            &quota("flower", 10.0, 0.5, 2.0),
        );
        assert_eq!(decision.universe, Universe::Free);
        assert!(decision.is_fallback_active);

        // Tier healthy, wallet empty: tier-first policy keeps enterprise.
        let decision = resolve_route(
            "enter/gemini-pro",
            &routing(Mode::Pro),
            &quota("flower", 10.0, 8.0, 0.0),
        );
        assert_eq!(decision.universe, Universe::Enterprise);
    }

    #[test]
    fn oracle_error_forces_free_outside_manual() {
        let q = quota("error", 1.0, 0.0, 0.0);
        for mode in [Mode::Alwaysfree, Mode::Pro] {
            let decision = resolve_route("enter/gemini-pro", &routing(mode), &q);
            assert_eq!(decision.universe, Universe::Free, "mode {mode}");
            assert!(decision.is_fallback_active);
        }
    }

    #[test]
    fn manual_mode_never_switches() {
        let decision = resolve_route(
            "enter/gemini-pro",
            &routing(Mode::Manual),
            &quota("error", 1.0, 0.0, 0.0),
        );
        assert_eq!(decision.universe, Universe::Enterprise);
        assert!(!decision.is_fallback_active);
    }

    #[test]
    fn free_requests_skip_the_safety_net() {
        let decision = resolve_route(
            "free/gemini-fast",
            &routing(Mode::Alwaysfree),
            &quota("error", 1.0, 0.0, 0.0),
        );
        assert_eq!(decision.universe, Universe::Free);
        assert_eq!(decision.model, "gemini-fast");
        assert!(!decision.is_fallback_active);
    }

    #[test]
    fn family_rules_match_in_order() {
        let gpt = rules_for("gpt-4o-mini");
        assert_eq!(gpt.max_tools, Some(120));
        assert_eq!(gpt.truncate_tool_ids, Some(40));
        assert!(!gpt.sanitize_schemas);

        let gemini = rules_for("gemini-2.5-pro");
        assert!(gemini.sanitize_schemas);
        assert!(gemini.drop_search_tool);
        assert_eq!(gemini.grounding, GroundingPolicy::DisableOnFree);
        assert!(gemini.inject_signatures);

        let nomnom = rules_for("nomnom");
        assert_eq!(nomnom.grounding, GroundingPolicy::DisableAlways);
        assert!(!nomnom.drop_search_tool);
        assert!(nomnom.inject_signatures);

        let kimi = rules_for("kimi-k2");
        assert!(kimi.loop_penalties);
        assert_eq!(kimi.max_tools, None);

        assert_eq!(rules_for("mistral"), PASSTHROUGH_RULES);
    }
}
