//! `Accept` header content negotiation
//!
//! Parses media ranges with q-values and picks the best match among the
//! media types a handler can produce. Specificity order: exact type/subtype,
//! then `type/*`, then `*/*`.

/// A single parsed media range from an `Accept` header
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRange {
    /// Primary type, `*` for wildcard
    pub main: String,
    /// Subtype, `*` for wildcard
    pub sub: String,
    /// Quality weight in [0.0, 1.0]
    pub quality: f32,
}

impl MediaRange {
    fn specificity(&self) -> u8 {
        match (self.main.as_str(), self.sub.as_str()) {
            ("*", _) => 0,
            (_, "*") => 1,
            _ => 2,
        }
    }

    fn matches(&self, main: &str, sub: &str) -> bool {
        (self.main == "*" || self.main.eq_ignore_ascii_case(main))
            && (self.sub == "*" || self.sub.eq_ignore_ascii_case(sub))
    }
}

/// Parse an `Accept` header into media ranges, most preferred first
///
/// Malformed entries are skipped. Ranges are ordered by q-value, ties broken
/// by specificity.
pub fn parse_accept(header: &str) -> Vec<MediaRange> {
    let mut ranges: Vec<MediaRange> = header
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.trim().split(';');
            let media = parts.next()?.trim();
            let (main, sub) = media.split_once('/')?;
            if main.is_empty() || sub.is_empty() {
                return None;
            }

            let mut quality = 1.0f32;
            for param in parts {
                if let Some((k, v)) = param.trim().split_once('=') {
                    if k.trim() == "q" {
                        quality = v.trim().parse().unwrap_or(0.0);
                    }
                }
            }

            Some(MediaRange {
                main: main.trim().to_ascii_lowercase(),
                sub: sub.trim().to_ascii_lowercase(),
                quality: quality.clamp(0.0, 1.0),
            })
        })
        .collect();

    ranges.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.specificity().cmp(&a.specificity()))
    });
    ranges
}

/// Pick the best of `offered` for an `Accept` header value
///
/// Returns `None` when nothing is acceptable (all matches have q=0 or no
/// range matches). Ties prefer the earlier offer.
pub fn negotiate<'a>(accept: &str, offered: &[&'a str]) -> Option<&'a str> {
    let ranges = parse_accept(accept);
    if ranges.is_empty() {
        return offered.first().copied();
    }

    let mut best: Option<(&'a str, f32, u8)> = None;
    for offer in offered {
        let (main, sub) = offer.split_once('/')?;
        let sub = sub.split(';').next().unwrap_or(sub).trim();

        for range in &ranges {
            if range.matches(main, sub) && range.quality > 0.0 {
                let candidate = (*offer, range.quality, range.specificity());
                let better = match best {
                    None => true,
                    Some((_, q, s)) => {
                        range.quality > q || (range.quality == q && range.specificity() > s)
                    }
                };
                if better {
                    best = Some(candidate);
                }
                break;
            }
        }
    }
    best.map(|(offer, _, _)| offer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_orders_by_quality() {
        let ranges = parse_accept("text/html;q=0.5, application/json, */*;q=0.1");
        assert_eq!(ranges[0].main, "application");
        assert_eq!(ranges[1].main, "text");
        assert_eq!(ranges[2].main, "*");
    }

    #[test]
    fn test_negotiate_exact_match() {
        let picked = negotiate(
            "application/json, text/html;q=0.9",
            &["text/html", "application/json"],
        );
        assert_eq!(picked, Some("application/json"));
    }

    #[test]
    fn test_negotiate_wildcard() {
        let picked = negotiate("*/*", &["application/json", "text/html"]);
        assert_eq!(picked, Some("application/json"));
    }

    #[test]
    fn test_negotiate_type_wildcard() {
        let picked = negotiate("text/*", &["application/json", "text/plain"]);
        assert_eq!(picked, Some("text/plain"));
    }

    #[test]
    fn test_negotiate_q_zero_unacceptable() {
        let picked = negotiate("text/html;q=0", &["text/html"]);
        assert_eq!(picked, None);
    }

    #[test]
    fn test_negotiate_nothing_matches() {
        let picked = negotiate("image/png", &["text/html"]);
        assert_eq!(picked, None);
    }
}
