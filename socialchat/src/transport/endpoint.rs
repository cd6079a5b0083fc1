//! Derivation of the chat WebSocket URL from the backend origin.

use url::Url;

/// Errors raised while building the WebSocket endpoint.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// No backend origin is configured.
    #[error("backend origin is not configured")]
    MissingOrigin,

    /// The origin does not form a valid URL.
    #[error("invalid backend origin {origin:?}: {source}")]
    InvalidOrigin {
        /// The offending origin.
        origin: String,
        /// Parser error.
        source: url::ParseError,
    },
}

/// Build `ws(s)://<host>/ws?token=<token>` from the configured origin.
///
/// The `http://` or `https://` scheme and one trailing `/` are stripped from
/// the origin. `https` (or an explicit `wss`) selects `wss`, anything else
/// selects `ws`. The token is appended as a query parameter.
///
/// # Errors
///
/// - [`EndpointError::MissingOrigin`] if the origin is unset, blank or has
///   nothing after the scheme.
/// - [`EndpointError::InvalidOrigin`] if the result is not a valid URL.
pub fn websocket_url(origin: Option<&str>, token: &str) -> Result<Url, EndpointError> {
    let origin = origin
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .ok_or(EndpointError::MissingOrigin)?;

    let (secure, rest) = if let Some(rest) = strip_scheme(origin, "https://") {
        (true, rest)
    } else if let Some(rest) = strip_scheme(origin, "wss://") {
        (true, rest)
    } else if let Some(rest) = strip_scheme(origin, "http://") {
        (false, rest)
    } else if let Some(rest) = strip_scheme(origin, "ws://") {
        (false, rest)
    } else {
        (false, origin)
    };

    let host = rest.strip_suffix('/').unwrap_or(rest);
    if host.is_empty() {
        return Err(EndpointError::MissingOrigin);
    }

    let scheme = if secure { "wss" } else { "ws" };
    let mut url = Url::parse(&format!("{scheme}://{host}/ws")).map_err(|source| {
        EndpointError::InvalidOrigin {
            origin: origin.to_string(),
            source,
        }
    })?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

fn strip_scheme<'a>(origin: &'a str, scheme: &str) -> Option<&'a str> {
    let prefix = origin.get(..scheme.len())?;
    prefix
        .eq_ignore_ascii_case(scheme)
        .then(|| &origin[scheme.len()..])
}
