//! URL helpers for the hub connection.

use url::Url;

const TOKEN_PARAM: &str = "token";

/// Parse a hub base URL, accepting `http(s)` by mapping it onto `ws(s)`.
///
/// # Examples
///
/// ```
/// use toolbridge::utils::url::parse_hub_url;
///
/// assert_eq!(parse_hub_url("https://hub.example.com/bridge/").unwrap().as_str(), "wss://hub.example.com/bridge");
/// assert!(parse_hub_url("ftp://hub.example.com").is_err());
/// ```
pub fn parse_hub_url(raw: &str) -> Result<Url, String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let mut url = Url::parse(trimmed).map_err(|err| format!("Invalid hub URL `{trimmed}`: {err}"))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(format!("Unsupported hub URL scheme `{other}`")),
    };
    url.set_scheme(scheme)
        .map_err(|_| format!("Unsupported hub URL scheme `{}`", url.scheme()))?;
    Ok(url)
}

/// Hub URL carrying `token` as a query parameter. An existing token
/// parameter is replaced; other parameters are kept.
pub fn hub_url_with_token(base: &Url, token: &str) -> Url {
    let mut url = base.clone();
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != TOKEN_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.set_query(None);
    {
        let mut pairs = url.query_pairs_mut();
        pairs.extend_pairs(kept);
        if !token.is_empty() {
            pairs.append_pair(TOKEN_PARAM, token);
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    url
}

/// Printable form of a hub URL with the token masked.
pub fn redact_token(url: &Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            if key == TOKEN_PARAM {
                (key.into_owned(), "***".to_string())
            } else {
                (key.into_owned(), value.into_owned())
            }
        })
        .collect();
    if !pairs.is_empty() {
        redacted.set_query(None);
        redacted.query_pairs_mut().extend_pairs(pairs);
    }
    redacted.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_appended_and_replaced() {
        let base = parse_hub_url("wss://hub.example.com/bridge?region=eu").unwrap();
        let first = hub_url_with_token(&base, "abc");
        assert_eq!(
            first.as_str(),
            "wss://hub.example.com/bridge?region=eu&token=abc"
        );

        let second = hub_url_with_token(&first, "xyz");
        assert_eq!(
            second.as_str(),
            "wss://hub.example.com/bridge?region=eu&token=xyz"
        );
    }

    #[test]
    fn empty_token_leaves_no_query() {
        let base = parse_hub_url("ws://localhost:8080/bridge").unwrap();
        assert_eq!(
            hub_url_with_token(&base, "").as_str(),
            "ws://localhost:8080/bridge"
        );
    }

    #[test]
    fn redaction_hides_only_the_token() {
        let base = parse_hub_url("wss://hub.example.com/bridge?region=eu").unwrap();
        let url = hub_url_with_token(&base, "s3cret");
        let shown = redact_token(&url);
        assert!(!shown.contains("s3cret"));
        assert!(shown.contains("region=eu"));
    }

    #[test]
    fn http_schemes_map_to_websocket() {
        assert_eq!(
            parse_hub_url("http://localhost:3000/").unwrap().scheme(),
            "ws"
        );
        assert!(parse_hub_url("not a url").is_err());
    }
}
