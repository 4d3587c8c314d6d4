//! Realtime endpoint URL construction.

use url::Url;

use serverwatch_protocol::constants::TOKEN_QUERY_PARAM;

use crate::config::EndpointConfig;

/// Reasons an endpoint URL cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid {field} '{value}': {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("unsupported {field} scheme '{scheme}'")]
    UnsupportedScheme { field: &'static str, scheme: String },

    #[error("refusing insecure ws:// override when the origin uses https://")]
    InsecureOverride,
}

/// Builds the WebSocket URL for `endpoint`, carrying `credential` as the
/// `token` query parameter.
///
/// The scheme mirrors the origin (`http` → `ws`, `https` → `wss`) unless an
/// explicit override URL is configured.
pub fn resolve_ws_url(endpoint: &EndpointConfig, credential: &str) -> Result<Url, EndpointError> {
    let origin = parse("origin", &endpoint.origin)?;

    let mut url = match endpoint.override_url.as_deref() {
        Some(raw) => {
            let url = parse("override_url", raw)?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(EndpointError::UnsupportedScheme {
                    field: "override_url",
                    scheme: url.scheme().to_owned(),
                });
            }
            if origin.scheme() == "https" && url.scheme() == "ws" {
                return Err(EndpointError::InsecureOverride);
            }
            url
        }
        None => {
            let scheme = match origin.scheme() {
                "http" | "ws" => "ws",
                "https" | "wss" => "wss",
                other => {
                    return Err(EndpointError::UnsupportedScheme {
                        field: "origin",
                        scheme: other.to_owned(),
                    });
                }
            };
            let mut url = origin.clone();
            url.set_scheme(scheme)
                .map_err(|()| EndpointError::UnsupportedScheme {
                    field: "origin",
                    scheme: origin.scheme().to_owned(),
                })?;
            url.set_path(&endpoint.path);
            url.set_query(None);
            url
        }
    };

    url.set_fragment(None);
    url.query_pairs_mut()
        .append_pair(TOKEN_QUERY_PARAM, credential);
    Ok(url)
}

/// Copy of `url` safe to log: the credential parameter is masked.
pub fn redacted(url: &Url) -> String {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let value = if k == TOKEN_QUERY_PARAM {
                "redacted".to_owned()
            } else {
                v.into_owned()
            };
            (k.into_owned(), value)
        })
        .collect();

    let mut masked = url.clone();
    if pairs.is_empty() {
        return masked.to_string();
    }
    masked.query_pairs_mut().clear().extend_pairs(pairs);
    masked.to_string()
}

fn parse(field: &'static str, raw: &str) -> Result<Url, EndpointError> {
    Url::parse(raw.trim()).map_err(|e| EndpointError::InvalidUrl {
        field,
        value: raw.to_owned(),
        reason: e.to_string(),
    })
}
