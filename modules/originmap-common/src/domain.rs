//! URL and domain normalization shared across the pipeline.

use url::Url;

/// Derive the primary dedup key from a website URL: lower-cased host with
/// `www.` stripped, or `"unknown"` when underivable.
pub fn to_normalized_domain(raw: &str) -> String {
    let Some(url) = parse_loose(raw) else {
        return "unknown".to_string();
    };
    let Some(host) = url.host_str() else {
        return "unknown".to_string();
    };
    let host = host.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() {
        "unknown".to_string()
    } else {
        host.to_string()
    }
}

/// Canonical URL form stored on records: `https://<domain>/`.
pub fn canonical_url_for_domain(domain: &str) -> String {
    format!("https://{domain}/")
}

/// The https/http × trailing-slash variants tried during canonical-URL
/// dedup lookups, deduplicated, first variant first.
pub fn canonical_url_variants(raw: &str) -> Vec<String> {
    let host = to_normalized_domain(raw);
    if host == "unknown" {
        return Vec::new();
    }
    vec![
        format!("https://{host}/"),
        format!("https://{host}"),
        format!("http://{host}/"),
        format!("http://{host}"),
    ]
}

/// Parse with an `https://` fallback for scheme-less input.
pub fn parse_loose(raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains("://") {
        Url::parse(trimmed).ok()
    } else {
        Url::parse(&format!("https://{trimmed}")).ok()
    }
}

/// Whether a search query is itself a company URL: parseable, a real
/// dotted hostname with a plausible TLD, not localhost.
pub fn looks_like_company_url_query(raw: &str) -> bool {
    let Some(url) = parse_loose(raw) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_lowercase();
    if host == "localhost" || host.ends_with(".localhost") {
        return false;
    }
    let parts: Vec<&str> = host.split('.').filter(|p| !p.is_empty()).collect();
    if parts.len() < 2 {
        return false;
    }
    parts.last().is_some_and(|tld| tld.len() >= 2)
}

/// Host with `www.` stripped, lowercased. Empty string when unparseable.
pub fn host_of(raw: &str) -> String {
    parse_loose(raw)
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .map(|h| h.strip_prefix("www.").unwrap_or(&h).to_string())
        .unwrap_or_default()
}

/// Same-domain check including subdomain containment (blog.acme.com vs
/// acme.com matches both ways).
pub fn is_same_domain(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let a = a.strip_prefix("www.").unwrap_or(&a);
    let b = b.strip_prefix("www.").unwrap_or(&b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.ends_with(&format!(".{b}")) || b.ends_with(&format!(".{a}"))
}

/// Normalized form for review-URL comparison: lowercased host without
/// `www.`, path without trailing slashes, fragment dropped, query kept.
pub fn normalize_url_for_compare(raw: &str) -> String {
    let Some(mut url) = parse_loose(raw) else {
        return raw.trim().to_lowercase();
    };
    url.set_fragment(None);

    let host = url
        .host_str()
        .map(|h| {
            let h = h.to_lowercase();
            h.strip_prefix("www.").unwrap_or(&h).to_string()
        })
        .unwrap_or_default();
    let path = url.path().trim_end_matches('/');
    let query = url.query().map(|q| format!("?{q}")).unwrap_or_default();

    format!("{}://{}{}{}", url.scheme().to_lowercase(), host, path, query)
}

/// Derive a display company name from a URL host: first label, title-cased.
/// `acme-example.com` → `Acme-example`.
pub fn company_name_from_url(raw: &str) -> String {
    let host = host_of(raw);
    let Some(first) = host.split('.').next().filter(|s| !s.is_empty()) else {
        return String::new();
    };
    let mut chars = first.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// The brand token used to filter brand-name keywords: first host label.
pub fn brand_token_from_url(raw: &str) -> String {
    host_of(raw)
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Normalize trailing country variants to "USA" in location strings.
pub fn normalize_country_in_location(location: &str) -> String {
    let trimmed = location.trim();
    const VARIANTS: [&str; 5] = [
        "united states of america",
        "united states",
        "u.s.a.",
        "u.s.a",
        "u.s.",
    ];
    if let Some(comma) = trimmed.rfind(',') {
        let tail = trimmed[comma + 1..].trim().to_lowercase();
        if VARIANTS.contains(&tail.as_str()) || tail == "u.s" {
            return format!("{}, USA", &trimmed[..comma]);
        }
    }
    trimmed.to_string()
}
