use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::CatalogError;
use crate::worker_proxy::AccountTokens;

const USER_AGENT: &str = "Music/5.7 Android/10 model/Pixel6GR1YH build/1234 (dt:66)";
const ORIGIN: &str = "https://music.apple.com";

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "https://amp-api.music.apple.com".to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Deserialize)]
struct LyricsResponse {
    #[serde(default)]
    data: Vec<LyricsResource>,
    #[serde(default)]
    errors: Option<Value>,
}

#[derive(Deserialize)]
struct LyricsResource {
    #[serde(default)]
    attributes: LyricsAttributes,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct LyricsAttributes {
    ttml_localizations: Option<String>,
}

/// Catalog lookups made with an account's tokens.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    config: CatalogConfig,
}

impl CatalogClient {
    pub fn new(config: CatalogConfig) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Fetches the syllable lyrics TTML for a song.
    ///
    /// # Arguments
    /// * `region` - Storefront to query, normally the serving account's region
    /// * `adam_id` - Song id
    /// * `language` - Lyrics language tag, e.g. `en-US`
    /// * `tokens` - Developer and media-user tokens of the serving account
    pub async fn lyrics(
        &self,
        region: &str,
        adam_id: &str,
        language: &str,
        tokens: &AccountTokens,
    ) -> Result<String, CatalogError> {
        let url = format!(
            "{}/v1/catalog/{}/songs/{}/syllable-lyrics",
            self.config.base_url.trim_end_matches('/'),
            region,
            adam_id
        );
        debug!("Fetching lyrics for {} from {}", adam_id, url);

        let response = self
            .http
            .get(&url)
            .query(&[
                ("l[lyrics]", language),
                ("extend", "ttmlLocalizations"),
                ("l[script]", "en-Latn"),
            ])
            .bearer_auth(&tokens.dev_token)
            .header("media-user-token", &tokens.media_token)
            .header(reqwest::header::ORIGIN, ORIGIN)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Status(status.as_u16()));
        }

        let body: LyricsResponse = response.json().await?;
        if let Some(errors) = body.errors {
            return Err(CatalogError::Api(errors.to_string()));
        }

        body.data
            .into_iter()
            .next()
            .and_then(|resource| resource.attributes.ttml_localizations)
            .filter(|ttml| !ttml.is_empty())
            .ok_or(CatalogError::NoLyrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wrapmgr_test_utils::MockCatalog;

    fn tokens() -> AccountTokens {
        AccountTokens {
            dev_token: "dev-token".to_string(),
            media_token: "media-token".to_string(),
        }
    }

    fn client_for(catalog: &MockCatalog) -> CatalogClient {
        CatalogClient::new(CatalogConfig {
            base_url: catalog.base_url(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_lyrics_success_sends_tokens() {
        let catalog = MockCatalog::start().await;
        catalog.set_lyrics("1440818664", "<tt>hello</tt>");

        let ttml = client_for(&catalog)
            .lyrics("us", "1440818664", "en-US", &tokens())
            .await
            .unwrap();
        assert_eq!(ttml, "<tt>hello</tt>");

        let seen = catalog.last_request().unwrap();
        assert_eq!(seen.path, "/v1/catalog/us/songs/1440818664/syllable-lyrics");
        assert_eq!(seen.authorization.as_deref(), Some("Bearer dev-token"));
        assert_eq!(seen.media_user_token.as_deref(), Some("media-token"));
        assert_eq!(seen.language.as_deref(), Some("en-US"));
    }

    #[tokio::test]
    async fn test_missing_lyrics() {
        let catalog = MockCatalog::start().await;
        let err = client_for(&catalog)
            .lyrics("us", "404", "en-US", &tokens())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::NoLyrics));
    }

    #[tokio::test]
    async fn test_api_errors_field() {
        let catalog = MockCatalog::start().await;
        catalog.set_error_body(r#"{"errors":[{"code":"40008","title":"Unauthorized"}]}"#);

        let err = client_for(&catalog)
            .lyrics("us", "1", "en-US", &tokens())
            .await
            .unwrap_err();
        match err {
            CatalogError::Api(detail) => assert!(detail.contains("40008")),
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_status_error() {
        let catalog = MockCatalog::start().await;
        catalog.set_status(401);

        let err = client_for(&catalog)
            .lyrics("us", "1", "en-US", &tokens())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Status(401)));
    }
}
