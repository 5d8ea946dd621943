//! Canonical symbol form and the candidate-expansion rules used by the
//! resolver.
//!
//! Canonicalization is deterministic and idempotent: `normalize(normalize(x))
//! == normalize(x)`. It does not know which exchange it will be used
//! against — that's the resolver's job.

use serde::{Deserialize, Serialize};

/// An uppercase, separatorless base+quote pair, e.g. `BTCUSDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalSymbol(String);

impl CanonicalSymbol {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The base asset with the `USDT`/`USD` quote suffix stripped, e.g.
    /// `BTCUSDT` -> `BTC`. Used when rendering alert-trigger payloads.
    pub fn without_quote(&self) -> &str {
        self.0
            .strip_suffix("USDT")
            .or_else(|| self.0.strip_suffix("USD"))
            .unwrap_or(&self.0)
    }
}

impl std::fmt::Display for CanonicalSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const PERP_SUFFIXES: &[&str] = &[
    ".P",
    "-PERP",
    "-PERPETUAL",
    "-SWAP",
    "_PERP",
    "_PERPETUAL",
];

/// Normalize arbitrary user/venue symbol spelling into canonical form.
/// Returns `None` if nothing alphanumeric survives.
pub fn normalize(input: &str) -> Option<CanonicalSymbol> {
    let mut s = input.trim().to_ascii_uppercase();

    for suffix in PERP_SUFFIXES {
        if let Some(stripped) = s.strip_suffix(suffix) {
            s = stripped.to_string();
            break;
        }
    }
    if let Some(stripped) = s.strip_suffix("PERP") {
        s = stripped.to_string();
    }
    if let Some(stripped) = s.strip_suffix("USDTM") {
        s = format!("{stripped}USDT");
    }

    // Split at separators and rejoin bare, regardless of which segment the
    // quote lands in — separators carry no information once removed.
    let rejoined: String = s.split(['-', '_', '/']).filter(|p| !p.is_empty()).collect();

    let cleaned: String = rejoined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if cleaned.is_empty() {
        None
    } else {
        Some(CanonicalSymbol(cleaned))
    }
}

/// Which quote aliases and perpetual suffix variants to try, in order, for a
/// market kind. Used by the resolver to build its candidate list.
pub fn candidate_forms(symbol: &CanonicalSymbol) -> Vec<String> {
    let base = symbol.without_quote().to_string();
    let mut candidates = vec![symbol.as_str().to_string()];

    for quote in ["USDT", "USD"] {
        let form = format!("{base}{quote}");
        if !candidates.contains(&form) {
            candidates.push(form);
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        for input in ["btc/usdt", "BTCUSDT.P", "btc-usdt-swap", "BTC_USDT"] {
            let once = normalize(input).unwrap();
            let twice = normalize(once.as_str()).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn canonicalization_examples_agree() {
        let expected = "BTCUSDT";
        for input in ["btc/usdt", "BTCUSDT.P", "btc-usdt-swap", "BTC_USDT"] {
            assert_eq!(normalize(input).unwrap().as_str(), expected, "input={input}");
        }
    }

    #[test]
    fn strips_perp_suffix_variants() {
        assert_eq!(normalize("BTCUSDT-PERP").unwrap().as_str(), "BTCUSDT");
        assert_eq!(normalize("BTCUSDT-PERPETUAL").unwrap().as_str(), "BTCUSDT");
        assert_eq!(normalize("BTCUSDT_PERP").unwrap().as_str(), "BTCUSDT");
        assert_eq!(normalize("BTCUSDTM").unwrap().as_str(), "BTCUSDT");
    }

    #[test]
    fn empty_or_symbolic_input_is_none() {
        assert!(normalize("").is_none());
        assert!(normalize("---").is_none());
    }

    #[test]
    fn without_quote_strips_usdt_and_usd() {
        let usdt = normalize("BTCUSDT").unwrap();
        assert_eq!(usdt.without_quote(), "BTC");
        let usd = normalize("BTCUSD").unwrap();
        assert_eq!(usd.without_quote(), "BTC");
    }

    #[test]
    fn candidate_forms_include_both_quote_aliases() {
        let sym = normalize("BTCUSDT").unwrap();
        let candidates = candidate_forms(&sym);
        assert!(candidates.contains(&"BTCUSDT".to_string()));
        assert!(candidates.contains(&"BTCUSD".to_string()));
    }
}
