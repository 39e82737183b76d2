//! Cookie parsing and `Set-Cookie` serialization

use std::fmt;

/// `SameSite` cookie attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    /// Sent only for same-site requests
    Strict,
    /// Sent for same-site requests and top-level navigations
    Lax,
    /// Sent for all requests; requires `Secure`
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "Strict"),
            Self::Lax => write!(f, "Lax"),
            Self::None => write!(f, "None"),
        }
    }
}

/// A response cookie, emitted as a `Set-Cookie` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Cookie name
    pub name: String,
    /// Cookie value
    pub value: String,
    /// `Path` attribute
    pub path: Option<String>,
    /// `Domain` attribute
    pub domain: Option<String>,
    /// `Max-Age` attribute in seconds
    pub max_age: Option<i64>,
    /// `Secure` flag
    pub secure: bool,
    /// `HttpOnly` flag
    pub http_only: bool,
    /// `SameSite` attribute
    pub same_site: Option<SameSite>,
}

impl Cookie {
    /// Create a cookie with only a name and value
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            max_age: None,
            secure: false,
            http_only: false,
            same_site: None,
        }
    }

    /// Set the `Path` attribute
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the `Domain` attribute
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Set the `Max-Age` attribute in seconds
    #[must_use]
    pub fn with_max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    /// Set the `Secure` flag
    #[must_use]
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// Set the `HttpOnly` flag
    #[must_use]
    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    /// Set the `SameSite` attribute
    #[must_use]
    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    /// Serialize as a `Set-Cookie` header value
    #[must_use]
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(ref path) = self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(ref domain) = self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(max_age) = self.max_age {
            out.push_str("; Max-Age=");
            out.push_str(&max_age.to_string());
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if let Some(same_site) = self.same_site {
            out.push_str("; SameSite=");
            out.push_str(&same_site.to_string());
        }
        out
    }
}

/// Parse a `Cookie` request header into `(name, value)` pairs
///
/// Malformed pairs (missing `=`) are skipped.
#[must_use]
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_cookie() {
        let cookie = Cookie::new("session", "abc123");
        assert_eq!(cookie.to_header_value(), "session=abc123");
    }

    #[test]
    fn test_full_cookie() {
        let cookie = Cookie::new("session", "abc123")
            .with_path("/")
            .with_domain("example.com")
            .with_max_age(3600)
            .secure()
            .http_only()
            .with_same_site(SameSite::Lax);

        assert_eq!(
            cookie.to_header_value(),
            "session=abc123; Path=/; Domain=example.com; Max-Age=3600; Secure; HttpOnly; SameSite=Lax"
        );
    }

    #[test]
    fn test_same_site_variants() {
        for (same_site, expected) in [
            (SameSite::Strict, "SameSite=Strict"),
            (SameSite::Lax, "SameSite=Lax"),
            (SameSite::None, "SameSite=None"),
        ] {
            let value = Cookie::new("a", "b").with_same_site(same_site).to_header_value();
            assert!(value.ends_with(expected), "{value}");
        }
    }

    #[test]
    fn test_parse_cookie_header() {
        let pairs = parse_cookie_header("a=1; b=2;c=3");
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
                ("c".to_string(), "3".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_skips_malformed() {
        let pairs = parse_cookie_header("a=1; garbage; =nope; b=2");
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }
}
