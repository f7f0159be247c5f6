//! `POST {endpoint}/negotiate` round trip.

use serde::Deserialize;

use super::TransportKind;
use crate::error::TransportError;

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    #[serde(default)]
    connection_id: Option<String>,
    #[serde(default)]
    connection_token: Option<String>,
    #[serde(default)]
    available_transports: Vec<AvailableTransport>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Outcome of negotiation after following redirects.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub endpoint: String,
    pub access_token: Option<String>,
    pub connection_token: Option<String>,
    pub transports: Vec<AvailableTransport>,
}

impl Negotiated {
    /// Whether the server offers `kind` with text framing.
    pub fn offers(&self, kind: TransportKind) -> bool {
        self.transports.iter().any(|t| {
            t.transport == kind.as_str()
                && (t.transfer_formats.is_empty()
                    || t.transfer_formats.iter().any(|f| f == "Text"))
        })
    }
}

pub fn negotiate_url(endpoint: &str) -> Result<reqwest::Url, TransportError> {
    let mut url =
        reqwest::Url::parse(endpoint).map_err(|e| TransportError::Negotiate(e.to_string()))?;
    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url)
}

pub async fn negotiate(
    http: &reqwest::Client,
    endpoint: &str,
    access_token: Option<&str>,
) -> Result<Negotiated, TransportError> {
    let mut endpoint = endpoint.to_string();
    let mut access_token = access_token.map(String::from);

    for _ in 0..=MAX_REDIRECTS {
        let mut request = http.post(negotiate_url(&endpoint)?);
        if let Some(token) = &access_token {
            request = request.bearer_auth(token);
        }
        let body: NegotiateResponse = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TransportError::Negotiate(e.to_string()))?
            .json()
            .await
            .map_err(|e| TransportError::Negotiate(e.to_string()))?;

        match resolve(body, &mut endpoint, &mut access_token)? {
            Some(negotiated) => return Ok(negotiated),
            None => continue,
        }
    }

    Err(TransportError::Negotiate(format!(
        "more than {MAX_REDIRECTS} negotiate redirects"
    )))
}

/// Apply one negotiate response. `None` means "redirected, negotiate again".
fn resolve(
    body: NegotiateResponse,
    endpoint: &mut String,
    access_token: &mut Option<String>,
) -> Result<Option<Negotiated>, TransportError> {
    if let Some(error) = body.error {
        return Err(TransportError::Negotiate(error));
    }
    if let Some(url) = body.url {
        *endpoint = url;
        if body.access_token.is_some() {
            *access_token = body.access_token;
        }
        return Ok(None);
    }
    Ok(Some(Negotiated {
        endpoint: endpoint.clone(),
        access_token: access_token.clone(),
        connection_token: body.connection_token.or(body.connection_id),
        transports: body.available_transports,
    }))
}
