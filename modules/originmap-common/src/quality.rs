//! Field-quality gates: industry and keyword sanitizers, placeholder
//! detection, location reality checks.
//!
//! These decide whether a value extracted upstream is "real" or must be
//! replaced by a typed placeholder during completeness enforcement.

use crate::domain::brand_token_from_url;
use crate::types::{NOT_DISCLOSED, UNKNOWN};

const PLACEHOLDER_STRINGS: [&str; 8] = [
    "unknown", "n/a", "na", "none", "not found", "not_found", "notfound", "n\\a",
];

const SENTINEL_STRINGS: [&str; 2] = ["not disclosed", "not_disclosed"];

/// Marketplace buckets too broad to count as industries.
const INDUSTRY_MARKETPLACE_BUCKETS: [&str; 7] = [
    "home goods", "home", "food", "electronics", "shopping", "retail", "marketplace",
];

/// Site-navigation crumbs that leak into scraped industry lists.
const INDUSTRY_NAV_TERMS: [&str; 24] = [
    "shop", "bestsellers", "best sellers", "featured", "new arrivals", "collections",
    "collection", "categories", "category", "accessories", "bundles", "bundle", "kits",
    "gift cards", "gift card", "customer service", "support", "contact", "about", "blog",
    "careers", "privacy", "shipping", "faq",
];

/// Map loose labels onto a short controlled vocabulary.
const INDUSTRY_CANONICAL_MAP: [(&[&str], &str); 16] = [
    (&["supplement", "vitamin", "nutrition", "wellness"], "Supplements"),
    (&["oral care", "dental", "tooth", "teeth"], "Oral Care"),
    (&["skin", "skincare", "cosmetic", "beauty"], "Skincare"),
    (&["personal care", "hygiene", "groom"], "Personal Care"),
    (&["soap", "bar soap", "hand soap"], "Soap"),
    (&["bath", "body wash", "shampoo", "conditioner"], "Bath & Body"),
    (&["fragrance", "candle", "diffuser", "aromatherapy"], "Home Fragrance"),
    (&["household", "laundry", "detergent"], "Household Cleaning"),
    (&["pet", "veterinary"], "Pet Care"),
    (&["medical", "healthcare", "pharma", "pharmaceutical"], "Healthcare"),
    (&["apparel", "clothing", "fashion"], "Apparel"),
    (&["technology", "software", "saas", "cloud"], "Technology"),
    (&["computer", "hardware", "peripheral"], "Computer Hardware"),
    (&["chocolate", "confection", "candy", "cocoa"], "Confectionery"),
    (&["automotive", "vehicle"], "Automotive"),
    (&["toy", "toys", "games", "gaming"], "Toys & Games"),
];

/// Navigation/UX/legal terms that disqualify a keyword.
const KEYWORD_DISALLOW_TERMS: [&str; 40] = [
    "unknown", "privacy", "terms", "policy", "cookie", "shop all", "all products",
    "collections", "new arrivals", "best sellers", "bestsellers", "featured", "sale",
    "clearance", "promo", "gift card", "bundles", "subscription", "subscribe", "rewards",
    "loyalty", "store locator", "track order", "wishlist", "shipping", "returns", "refund",
    "faq", "contact", "careers", "login", "sign in", "sign up", "account", "cart",
    "checkout", "sitemap", "instagram", "facebook", "wholesale",
];

/// ALL-CAPS tokens that are real product acronyms, not shouting navigation.
const PRODUCT_CAPS_ALLOWLIST: [&str; 18] = [
    "USB", "HDMI", "LED", "LCD", "SSD", "HDD", "RGB", "AC", "DC", "HD", "4K", "GPS",
    "CPU", "GPU", "RAM", "LAN", "OLED", "HDR",
];

fn normalize_key(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn is_placeholder_string(value: &str) -> bool {
    PLACEHOLDER_STRINGS.contains(&normalize_key(value).as_str())
}

pub fn is_sentinel_string(value: &str) -> bool {
    SENTINEL_STRINGS.contains(&normalize_key(value).as_str())
}

/// Trimmed value, or `None` when empty or a placeholder like "Unknown".
pub fn as_meaningful_string(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() || is_placeholder_string(trimmed) {
        return None;
    }
    Some(trimmed)
}

pub fn is_meaningful_string(value: &str) -> bool {
    as_meaningful_string(value).is_some()
}

fn to_title_case(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_plausible_industry_candidate(key: &str, raw: &str) -> bool {
    if key.is_empty() || raw.trim().is_empty() {
        return false;
    }
    if PLACEHOLDER_STRINGS.contains(&key) || SENTINEL_STRINGS.contains(&key) {
        return false;
    }
    if raw.contains("http://") || raw.contains("https://") {
        return false;
    }
    if raw.chars().any(|c| matches!(c, '<' | '>' | '|' | '{' | '}')) {
        return false;
    }
    let words = key.split_whitespace().count();
    if words == 0 || words > 5 {
        return false;
    }
    if key.len() < 3 || key.len() > 50 {
        return false;
    }
    if !key.chars().any(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    key.chars().filter(|c| c.is_ascii_digit()).count() <= 2
}

/// Sanitize an industry list: drop placeholders, navigation crumbs and
/// marketplace buckets, canonicalize onto the controlled vocabulary,
/// dedup case-insensitively.
pub fn sanitize_industries(values: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut valid = Vec::new();

    for item in values {
        let Some(item) = as_meaningful_string(item) else {
            continue;
        };
        let key = normalize_key(item);
        if key.is_empty() || key == "baby" || key == "babies" {
            continue;
        }
        if INDUSTRY_MARKETPLACE_BUCKETS.contains(&key.as_str()) {
            continue;
        }
        if INDUSTRY_NAV_TERMS.iter().any(|t| key.contains(t)) {
            continue;
        }

        let mapped = INDUSTRY_CANONICAL_MAP
            .iter()
            .find(|(tokens, _)| tokens.iter().any(|tok| key.contains(tok)))
            .map(|(_, canonical)| canonical.to_string());

        let accept = mapped.is_some() || is_plausible_industry_candidate(&key, item);
        if !accept {
            continue;
        }

        let candidate = mapped.unwrap_or_else(|| to_title_case(item));
        let candidate_key = normalize_key(&candidate);
        if candidate_key.is_empty() || !seen.insert(candidate_key) {
            continue;
        }
        valid.push(candidate);
    }

    valid
}

pub fn is_valid_industries(values: &[String]) -> bool {
    !sanitize_industries(values).is_empty()
}

fn is_keyword_junk(keyword: &str) -> bool {
    let raw = keyword.trim();
    let key = normalize_key(raw);
    if key.is_empty() || PLACEHOLDER_STRINGS.contains(&key.as_str()) {
        return true;
    }
    if key.contains("http://") || key.contains("https://") {
        return true;
    }
    if key == "close" || key == "view" || key == "order" {
        return true;
    }
    if KEYWORD_DISALLOW_TERMS.iter().any(|t| key.contains(t)) {
        return true;
    }

    // ALL-CAPS labels ("SHOP ALL") are rarely real product names; keep
    // digit-bearing SKUs and known product acronyms.
    let has_digits = raw.chars().any(|c| c.is_ascii_digit());
    let is_all_caps = !raw.is_empty()
        && raw == raw.to_uppercase()
        && raw.chars().any(|c| c.is_ascii_uppercase());
    if is_all_caps && !has_digits {
        let words: Vec<&str> = raw.split_whitespace().collect();
        let has_acronym = words.iter().any(|w| PRODUCT_CAPS_ALLOWLIST.contains(w));
        if !has_acronym && !words.is_empty() && words.len() <= 4 && raw.len() <= 30 {
            return true;
        }
    }

    if key.len() < 3 {
        return true;
    }
    !key.chars().any(|c| c.is_ascii_alphabetic())
}

#[derive(Debug, Clone, Default)]
pub struct KeywordStats {
    pub total_raw: usize,
    pub sanitized: Vec<String>,
}

impl KeywordStats {
    pub fn sanitized_count(&self) -> usize {
        self.sanitized.len()
    }
}

/// Split a comma-separated keyword string plus a keyword list, drop junk,
/// dedup case-insensitively. `total_raw` counts inputs before filtering —
/// the quality gate uses it to tell "low quality" from "not found".
pub fn sanitize_keywords(product_keywords: &str, keywords: &[String]) -> KeywordStats {
    let mut raw: Vec<String> = product_keywords
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    raw.extend(keywords.iter().map(|k| k.trim().to_string()).filter(|k| !k.is_empty()));

    let total_raw = raw.len();

    let mut seen = std::collections::HashSet::new();
    let mut sanitized = Vec::new();
    for k in raw {
        if is_keyword_junk(&k) {
            continue;
        }
        let key = normalize_key(&k);
        if !seen.insert(key) {
            continue;
        }
        sanitized.push(k);
    }

    KeywordStats { total_raw, sanitized }
}

/// Normalize a generated keyword list for storage: split on separators,
/// dedup, drop brand-name and domain-token substrings, cap at 25.
pub fn normalize_product_keywords(
    values: &[String],
    company_name: &str,
    website_url: &str,
) -> Vec<String> {
    let name_norm: String = company_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let brand_token = brand_token_from_url(website_url);

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for value in values {
        for part in value.split([',', ';', '|', '\n']) {
            let k = part.trim();
            if k.is_empty() {
                continue;
            }
            let kl = k.to_lowercase();
            if !name_norm.is_empty() && kl.contains(&name_norm) {
                continue;
            }
            if !brand_token.is_empty() && kl.contains(&brand_token) {
                continue;
            }
            if !seen.insert(kl) {
                continue;
            }
            out.push(k.to_string());
            if out.len() >= 25 {
                return out;
            }
        }
    }

    out
}

pub fn keyword_list_to_string(list: &[String]) -> String {
    list.join(", ")
}

/// Whether a string plausibly names a headquarters: "City, Region" or at
/// least two words within a sane length. Sentinels never qualify.
pub fn looks_like_hq_location(value: &str) -> bool {
    let Some(s) = as_meaningful_string(value) else {
        return false;
    };
    if is_sentinel_string(s) {
        return false;
    }

    let parts: Vec<&str> = s.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    if parts.len() >= 2 && parts[0].len() >= 2 && parts[1].len() >= 2 {
        return true;
    }

    s.split_whitespace().count() >= 2 && s.len() <= 80
}

/// Whether a location list has at least one real (non-placeholder,
/// non-sentinel) entry.
pub fn has_non_placeholder_location_entry(values: &[String]) -> bool {
    values.iter().any(|v| {
        let key = normalize_key(v);
        !key.is_empty()
            && !PLACEHOLDER_STRINGS.contains(&key.as_str())
            && !SENTINEL_STRINGS.contains(&key.as_str())
    })
}

/// True when the value is one of the exact persisted sentinels.
pub fn is_exact_sentinel(value: &str) -> bool {
    value == UNKNOWN || value == NOT_DISCLOSED
}
