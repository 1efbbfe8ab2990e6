//! Display-side helpers for the offer agent's output.
//!
//! [`parse_offer_reasoning`] scrapes the planner / worker / solver narration
//! into sections for the reasoning panel. It is best effort and never fails:
//! the structured decision mapped by [`map_decision`] is what counts.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{BackendDecision, Confidence, FinalDecision};

/// Stand-in purchase probability used when the backend sends no expected value.
pub const ASSUMED_PURCHASE_PROBABILITY: f64 = 0.40;
/// Stand-in margin used with [`ASSUMED_PURCHASE_PROBABILITY`].
pub const ASSUMED_MARGIN: f64 = 0.85;

const OFFER_NAMES: &[(&str, &str)] = &[
    ("IU_BUSINESS", "Business Class Upgrade"),
    ("IU_FIRST", "First Class Upgrade"),
    ("IU_PREMIUM_ECONOMY", "Premium Economy Upgrade"),
    ("MCE", "Main Cabin Extra"),
    ("LOUNGE_PASS", "Lounge Day Pass"),
    ("PRIORITY_BOARDING", "Priority Boarding"),
];

const RECOMMENDATION_GLYPHS: &[char] = &['→', '✓', '✗', '⚠'];

/// A header line holds the marker, optional uppercase qualifiers, one optional
/// parenthetical and decoration. Prose such as "Worker agents will..." is not
/// a header.
static RE_SECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^[^\w\n]*((?i:planner|worker|solver))(?:[ \t]+[A-Z][A-Z_]*)*[ \t]*(?:\([^)\n]*\)|\[[^\]\n]*\])?[ \t]*:?[^\w\n]*$",
    )
    .unwrap()
});

static RE_STEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*#(E\d+)[ \t]*\[([^\]\n]+)\][ \t]*:?[ \t]*").unwrap()
});

static RE_RECOMMENDATION_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^recommendation\s*:\s*").unwrap());

static RE_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[─━═=\-_*]{3,}\s*$").unwrap());

static RE_PARENTHETICAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:\([^)]*\)|\[[^\]]*\])\s*$").unwrap());

static RE_RESTATED_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:execution\s+)?(?:plan|synthesis|results?|final\s+decision)\s*:?\s*$")
        .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParsedWorkerStep {
    pub step_id: String,
    pub evaluation_type: String,
    pub body: String,
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParsedOfferReasoning {
    pub planner: String,
    /// The whole worker section, including text outside any `#E<n>` step.
    pub worker: String,
    /// Per-step breakdown of [`Self::worker`].
    pub workers: Vec<ParsedWorkerStep>,
    pub solver: String,
}

impl ParsedOfferReasoning {
    pub fn is_empty(&self) -> bool {
        self.planner.is_empty() && self.worker.is_empty() && self.solver.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Planner,
    Worker,
    Solver,
}

impl Section {
    fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "planner" => Some(Section::Planner),
            "worker" => Some(Section::Worker),
            "solver" => Some(Section::Solver),
            _ => None,
        }
    }
}

/// Header positions as `(start_of_header, end_of_header)`, taken in order:
/// a marker only counts if it appears after the previous one.
fn locate_sections(text: &str) -> [Option<(usize, usize)>; 3] {
    let mut found = [None; 3];
    let mut cursor = 0;
    let order = [Section::Planner, Section::Worker, Section::Solver];

    for (slot, wanted) in order.iter().enumerate() {
        let hit = RE_SECTION.captures_iter(&text[cursor..]).find_map(|caps| {
            let label = caps.get(1)?;
            if Section::from_label(label.as_str()) != Some(*wanted) {
                return None;
            }
            let whole = caps.get(0)?;
            Some((cursor + whole.start(), cursor + whole.end()))
        });

        if let Some((start, end)) = hit {
            found[slot] = Some((start, end));
            cursor = end;
        }
    }

    found
}

pub fn parse_offer_reasoning(text: &str) -> ParsedOfferReasoning {
    let headers = locate_sections(text);
    let worker = section_body(text, &headers, 1);

    ParsedOfferReasoning {
        planner: strip_decoration(section_body(text, &headers, 0)),
        worker: strip_decoration(worker),
        workers: parse_worker_steps(worker),
        solver: strip_decoration(section_body(text, &headers, 2)),
    }
}

fn section_body<'a>(text: &'a str, headers: &[Option<(usize, usize)>; 3], slot: usize) -> &'a str {
    let Some((_, end)) = headers[slot] else {
        return "";
    };
    let next_start = headers[slot + 1..]
        .iter()
        .flatten()
        .map(|(start, _)| *start)
        .next()
        .unwrap_or(text.len());
    &text[end..next_start]
}

fn parse_worker_steps(section: &str) -> Vec<ParsedWorkerStep> {
    let headers: Vec<_> = RE_STEP.captures_iter(section).collect();

    headers
        .iter()
        .enumerate()
        .filter_map(|(index, caps)| {
            let whole = caps.get(0)?;
            let end = headers
                .get(index + 1)
                .and_then(|next| next.get(0))
                .map(|m| m.start())
                .unwrap_or(section.len());
            let raw_body = &section[whole.end()..end];

            Some(ParsedWorkerStep {
                step_id: caps.get(1)?.as_str().to_string(),
                evaluation_type: caps.get(2)?.as_str().trim().to_string(),
                body: strip_decoration(raw_body),
                recommendation: extract_recommendation(raw_body),
            })
        })
        .collect()
}

/// First line that opens with one of the recommendation glyphs.
pub fn extract_recommendation(body: &str) -> Option<String> {
    body.lines().find_map(|line| {
        let trimmed = line.trim_start();
        let rest = trimmed.strip_prefix(RECOMMENDATION_GLYPHS)?;
        let rest = rest.trim_start_matches('\u{FE0F}').trim();
        let rest = RE_RECOMMENDATION_PREFIX.replace(rest, "");
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    })
}

/// Drops separator rules, bare parentheticals and restated headers, and
/// squeezes blank runs.
pub fn strip_decoration(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut previous_blank = true;

    for line in text.lines() {
        if RE_SEPARATOR.is_match(line)
            || RE_PARENTHETICAL.is_match(line)
            || RE_RESTATED_HEADER.is_match(line)
        {
            continue;
        }

        let line = line.trim_end();
        let blank = line.trim().is_empty();
        if blank && previous_blank {
            continue;
        }
        previous_blank = blank;
        lines.push(line);
    }

    lines.join("\n").trim().to_string()
}

pub fn offer_display_name(offer_type: &str) -> String {
    OFFER_NAMES
        .iter()
        .find(|(code, _)| *code == offer_type)
        .map(|(_, name)| (*name).to_string())
        .unwrap_or_else(|| offer_type.to_string())
}

/// Flattens the solver's decision into the display record.
///
/// The confidence label only reflects whether a discount was needed and the
/// expected value is a placeholder when the backend omits it.
pub fn map_decision(decision: &BackendDecision) -> FinalDecision {
    if !decision.should_send_offer {
        let reason = decision
            .suppression_reason
            .clone()
            .or_else(|| decision.reasoning.clone())
            .unwrap_or_else(|| "Offer suppressed".to_string());
        return FinalDecision::suppressed(reason);
    }

    let offer_type = decision.offer_type.clone().unwrap_or_default();
    let price = decision.price.unwrap_or(0.0);
    let discount = decision.discount_percent.unwrap_or(0.0);
    let confidence = if discount.abs() > f64::EPSILON {
        Confidence::Medium
    } else {
        Confidence::High
    };
    let expected_value = decision
        .expected_value
        .unwrap_or_else(|| placeholder_expected_value(price));

    FinalDecision {
        offer_name: offer_display_name(&offer_type),
        offer_type,
        price,
        discount,
        expected_value,
        confidence,
        channel: decision.channel.clone().unwrap_or_default(),
        reasoning: decision.reasoning.clone().unwrap_or_default(),
    }
}

fn placeholder_expected_value(price: f64) -> f64 {
    let raw = price * ASSUMED_PURCHASE_PROBABILITY * ASSUMED_MARGIN;
    (raw * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use crate::types::SUPPRESSED_OFFER_TYPE;

    use super::*;

    const SAMPLE: &str = "\
══════════════════════════
📋 PLANNER (ReWOO pattern)
══════════════════════════
Plan:
Check eligibility, inventory and price sensitivity before choosing an offer.

🔧 WORKER RESULTS
#E1 [customer_eligibility]: Gold member, no open complaints.
→ Recommendation: eligible
#E2 [inventory]: 6 business seats unsold.
✓ upgrade inventory healthy
#E3 [price_sensitivity]
High propensity, low price sensitivity.

✅ SOLVER
──────────
Send IU_BUSINESS at $499 via push.
";

    #[test]
    fn splits_all_three_sections() {
        let parsed = parse_offer_reasoning(SAMPLE);

        assert_eq!(
            parsed.planner,
            "Check eligibility, inventory and price sensitivity before choosing an offer."
        );
        assert_eq!(parsed.solver, "Send IU_BUSINESS at $499 via push.");
        assert_eq!(parsed.workers.len(), 3);

        let ids: Vec<_> = parsed.workers.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, ["E1", "E2", "E3"]);
        assert_eq!(parsed.workers[1].evaluation_type, "inventory");
        assert_eq!(parsed.workers[0].recommendation.as_deref(), Some("eligible"));
        assert_eq!(
            parsed.workers[1].recommendation.as_deref(),
            Some("upgrade inventory healthy")
        );
        assert_eq!(parsed.workers[2].recommendation, None);
        assert_eq!(parsed.workers[2].body, "High propensity, low price sensitivity.");
    }

    #[test]
    fn undelimited_worker_text_is_kept() {
        let parsed = parse_offer_reasoning(
            "PLANNER\nplan the checks\nWORKER\nAll checks passed, inventory healthy.\nSOLVER\nsend IU_BUSINESS",
        );

        assert_eq!(parsed.planner, "plan the checks");
        assert_eq!(parsed.worker, "All checks passed, inventory healthy.");
        assert!(parsed.workers.is_empty());
        assert_eq!(parsed.solver, "send IU_BUSINESS");
    }

    #[test]
    fn worker_section_keeps_preamble_before_first_step() {
        let parsed = parse_offer_reasoning(
            "PLANNER\nplan\nWORKER\nRan three tools.\n#E1 [inventory]: fine\nSOLVER\nsend",
        );

        assert_eq!(parsed.worker, "Ran three tools.\n#E1 [inventory]: fine");
        assert_eq!(parsed.workers.len(), 1);
        assert_eq!(parsed.workers[0].body, "fine");
    }

    #[test]
    fn prose_mentioning_a_marker_is_not_a_header() {
        let parsed = parse_offer_reasoning(
            "PLANNER\nWorker agents will check inventory.\nWORKER\n#E1 [inventory]: fine\nSOLVER\nsend",
        );

        assert_eq!(parsed.planner, "Worker agents will check inventory.");
        assert_eq!(parsed.workers.len(), 1);
        assert_eq!(parsed.solver, "send");
    }

    #[test]
    fn decorated_headers_are_recognised() {
        let parsed = parse_offer_reasoning(
            "=== Planner: ===\nplan\n🔧 WORKER RESULTS\nchecked\n✅ SOLVER (final)\nsend",
        );

        assert_eq!(parsed.planner, "plan");
        assert_eq!(parsed.worker, "checked");
        assert_eq!(parsed.solver, "send");
    }

    #[test]
    fn missing_marker_leaves_section_empty() {
        let parsed = parse_offer_reasoning("PLANNER\nlook at things\nSOLVER\nsend nothing");
        assert_eq!(parsed.planner, "look at things");
        assert!(parsed.worker.is_empty());
        assert!(parsed.workers.is_empty());
        assert_eq!(parsed.solver, "send nothing");
    }

    #[test]
    fn unstructured_text_yields_empty_result() {
        let parsed = parse_offer_reasoning("The customer is a good fit for an upgrade.");
        assert!(parsed.is_empty());
        assert!(parse_offer_reasoning("").is_empty());
    }

    #[test]
    fn out_of_order_markers_are_ignored() {
        let parsed = parse_offer_reasoning("SOLVER\nfinal\nPLANNER\nplan text");
        assert_eq!(parsed.planner, "plan text");
        assert!(parsed.solver.is_empty());
    }

    #[test]
    fn suppressed_decision_is_zeroed() {
        let decision = BackendDecision {
            should_send_offer: false,
            offer_type: Some("IU_BUSINESS".into()),
            price: Some(499.0),
            discount_percent: Some(0.2),
            expected_value: Some(120.0),
            channel: Some("email".into()),
            reasoning: Some("not worth it".into()),
            suppression_reason: Some("recent complaint".into()),
        };

        let mapped = map_decision(&decision);
        assert_eq!(mapped.offer_type, SUPPRESSED_OFFER_TYPE);
        assert_eq!(mapped.price, 0.0);
        assert_eq!(mapped.discount, 0.0);
        assert_eq!(mapped.expected_value, 0.0);
        assert_eq!(mapped.reasoning, "recent complaint");
    }

    #[test]
    fn offer_decision_uses_lookup_and_placeholder_value() {
        let decision = BackendDecision {
            should_send_offer: true,
            offer_type: Some("IU_PREMIUM_ECONOMY".into()),
            price: Some(200.0),
            discount_percent: Some(0.1),
            channel: Some("push".into()),
            ..BackendDecision::default()
        };

        let mapped = map_decision(&decision);
        assert_eq!(mapped.offer_name, "Premium Economy Upgrade");
        assert_eq!(mapped.confidence, Confidence::Medium);
        assert_eq!(mapped.expected_value, 68.0);
        assert_eq!(mapped.channel, "push");
    }

    #[test]
    fn unknown_offer_code_keeps_raw_name_and_high_confidence() {
        let decision = BackendDecision {
            should_send_offer: true,
            offer_type: Some("WIFI_PASS".into()),
            price: Some(19.0),
            expected_value: Some(5.5),
            ..BackendDecision::default()
        };

        let mapped = map_decision(&decision);
        assert_eq!(mapped.offer_name, "WIFI_PASS");
        assert_eq!(mapped.confidence, Confidence::High);
        assert_eq!(mapped.expected_value, 5.5);
    }
}
