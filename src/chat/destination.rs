//! Endpoint and destination name resolution.
//!
//! Pure functions: the only input besides their arguments is the configuration passed in.

use url::Url;

use super::config::Endpoint;
use crate::Result;

/// Placeholder name substituted with the identity in endpoints and destination templates.
pub const IDENTITY_PARAM: &str = "identity";

/// Builds the transport URL for `identity`.
///
/// An explicit override wins and only has its `{identity}` placeholder resolved. Otherwise the URL
/// is `{ws|wss}://{host}{prefix}/{identity}` with the identity percent-encoded as a path segment.
pub fn endpoint_url(endpoint: &Endpoint, identity: &str) -> Result<Url> {
    if let Some(url) = &endpoint.url_override {
        return Ok(Url::parse(&resolve(url, &[(IDENTITY_PARAM, identity)]))?);
    }

    let scheme = if endpoint.secure { "wss" } else { "ws" };
    let prefix = endpoint.prefix.trim_end_matches('/');
    let mut url = Url::parse(&format!("{scheme}://{}{prefix}", endpoint.host))?;
    url.path_segments_mut()
        .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
        .pop_if_empty()
        .push(identity);
    Ok(url)
}

/// Substitutes `{name}` placeholders in `template`.
///
/// Placeholders without a supplied value are left untouched, as is an unmatched `{`.
///
/// ```
/// use realtime_chat::chat::destination::resolve;
///
/// let destination = resolve("/user/{identity}/queue/{queue}", &[("identity", "42"), ("queue", "status")]);
/// assert_eq!(destination, "/user/42/queue/status");
/// ```
#[must_use]
pub fn resolve(template: &str, params: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let (before, placeholder) = rest.split_at(open);
        out.push_str(before);

        let Some(close) = placeholder.find('}') else {
            out.push_str(placeholder);
            return out;
        };

        let (name_with_brace, tail) = placeholder.split_at(close + 1);
        let name = name_with_brace
            .strip_prefix('{')
            .and_then(|n| n.strip_suffix('}'))
            .unwrap_or_default();

        match params.iter().find(|(key, _)| *key == name) {
            Some((_, value)) => out.push_str(value),
            None => out.push_str(name_with_brace),
        }
        rest = tail;
    }

    out.push_str(rest);
    out
}
