//! Contact header parsing and rewriting

use once_cell::sync::Lazy;
use regex::Regex;

static EXPIRES_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(;\s*)expires\s*=\s*\d+").unwrap());

/// One parsed Contact value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// The URI without angle brackets, or `*`
    pub uri: String,
    /// Header parameters following the URI, in order; names are lowercased
    pub params: Vec<(String, Option<String>)>,
}

impl Contact {
    /// Parse a Contact header value that may hold several comma-separated contacts
    pub fn parse_list(value: &str) -> Vec<Contact> {
        split_top_level(value)
            .into_iter()
            .filter_map(Contact::parse_one)
            .collect()
    }

    fn parse_one(value: &str) -> Option<Contact> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }

        let (uri, rest) = match (value.find('<'), value.find('>')) {
            (Some(open), Some(close)) if open < close => {
                (value[open + 1..close].trim().to_string(), &value[close + 1..])
            }
            _ => match value.find(';') {
                Some(semi) => (value[..semi].trim().to_string(), &value[semi..]),
                None => (value.to_string(), ""),
            },
        };

        let params = rest
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((name, val)) => (
                    name.trim().to_ascii_lowercase(),
                    Some(val.trim().trim_matches('"').to_string()),
                ),
                None => (p.to_ascii_lowercase(), None),
            })
            .collect();

        Some(Contact { uri, params })
    }

    /// Value of a header parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    /// The `expires` parameter, unparsed
    pub fn expires(&self) -> Option<&str> {
        self.param("expires")
    }
}

/// Split on commas that are not inside `<...>` or a quoted display name
fn split_top_level(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;

    for (i, ch) in value.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

/// Replace the first `;expires=<n>` parameter in a Contact header value,
/// appending the parameter if there is none.
pub fn rewrite_contact_expires(contact: &str, expires: u32) -> String {
    if EXPIRES_PARAM.is_match(contact) {
        EXPIRES_PARAM
            .replacen(contact, 1, format!("${{1}}expires={}", expires).as_str())
            .into_owned()
    } else {
        format!("{};expires={}", contact.trim_end(), expires)
    }
}
