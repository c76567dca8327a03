//! Company homepage adapter
//!
//! Fetches `https://{domain}/` and reads what the company says about itself:
//! `og:site_name` (or the `<title>` prefix) as display name, the meta
//! description, and a LinkedIn company link when the page carries one.

use super::{classify_reqwest_error, classify_status, remaining, AdapterContext, SourceAdapter};
use crate::types::{AdapterError, AdapterErrorKind, FieldSet, KnownField};
use corpmap_common::config::{get_user_agent, WebsiteConfig};
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::Duration;
use tokio::time::Instant;

pub const WEBSITE_ADAPTER_NAME: &str = "website";

const DEFAULT_URL_TEMPLATE: &str = "https://{domain}/";

/// Homepage metadata adapter
pub struct WebsiteAdapter {
    client: Client,
    url_template: String,
    tier: u8,
    base_confidence: u8,
    timeout: Option<Duration>,
}

impl WebsiteAdapter {
    pub fn new(config: &WebsiteConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(get_user_agent())
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self {
            client,
            url_template: DEFAULT_URL_TEMPLATE.to_string(),
            tier: config.tier,
            base_confidence: config.base_confidence,
            timeout: config.timeout_ms.map(Duration::from_millis),
        })
    }

    /// Point the adapter at a different origin (`{domain}` is substituted)
    pub fn with_url_template(mut self, template: impl Into<String>) -> Self {
        self.url_template = template.into();
        self
    }
}

#[async_trait::async_trait]
impl SourceAdapter for WebsiteAdapter {
    fn name(&self) -> &str {
        WEBSITE_ADAPTER_NAME
    }

    fn tier(&self) -> u8 {
        self.tier
    }

    fn cost_units(&self) -> f64 {
        0.0
    }

    fn base_confidence(&self) -> u8 {
        self.base_confidence
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn fetch(&self, ctx: &AdapterContext, deadline: Instant) -> Result<FieldSet, AdapterError> {
        let budget = remaining(WEBSITE_ADAPTER_NAME, deadline)?;
        let url = self.url_template.replace("{domain}", ctx.domain_key.as_str());

        tracing::debug!(domain = %ctx.domain_key, url = %url, "Fetching homepage");

        let response = self
            .client
            .get(&url)
            .timeout(budget)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(WEBSITE_ADAPTER_NAME, &e))?;

        if let Some(err) = classify_status(WEBSITE_ADAPTER_NAME, response.status()) {
            return Err(err);
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(WEBSITE_ADAPTER_NAME, &e))?;

        let fields = parse_homepage(&body);
        if fields.is_empty() {
            return Err(AdapterError::new(
                AdapterErrorKind::NotFound,
                format!("{}: homepage carries no company metadata", ctx.domain_key),
            ));
        }
        Ok(fields)
    }
}

/// Extract company metadata from homepage HTML
pub fn parse_homepage(html: &str) -> FieldSet {
    let document = Html::parse_document(html);
    let mut fields = FieldSet::new();

    let site_name = meta_content(&document, r#"meta[property="og:site_name"]"#);
    let title = first_text(&document, "title").and_then(|t| title_prefix(&t));
    if let Some(name) = site_name.or(title) {
        fields = fields.with(KnownField::DisplayName(name));
    }

    let description = meta_content(&document, r#"meta[name="description"]"#)
        .or_else(|| meta_content(&document, r#"meta[property="og:description"]"#));
    if let Some(description) = description {
        fields = fields.with(KnownField::Description(description));
    }

    if let Some(linkedin) = linkedin_link(&document) {
        fields = fields.with(KnownField::LinkedinUrl(linkedin));
    }

    fields
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn meta_content(document: &Html, css: &str) -> Option<String> {
    let selector = selector(css)?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .map(|content| content.trim().to_string())
        .find(|content| !content.is_empty())
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    let selector = selector(css)?;
    document
        .select(&selector)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .find(|text| !text.is_empty())
}

/// "Acme Inc. | Home" → "Acme Inc."
fn title_prefix(title: &str) -> Option<String> {
    let prefix = [" | ", " - ", " – ", " — ", " :: "]
        .iter()
        .filter_map(|sep| title.find(sep))
        .min()
        .map_or(title, |idx| &title[..idx])
        .trim();
    (!prefix.is_empty()).then(|| prefix.to_string())
}

fn linkedin_link(document: &Html) -> Option<String> {
    let selector = selector("a[href]")?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .find(|href| href.contains("linkedin.com/company/"))
        .map(|href| href.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DomainKey;
    use axum::{http::StatusCode, response::Html as HtmlBody, routing::get, Router};

    const PAGE: &str = r#"
        <html><head>
          <title>Acme Widgets | Home</title>
          <meta name="description" content="  We make widgets.  ">
          <meta property="og:site_name" content="Acme">
        </head><body>
          <a href="https://www.linkedin.com/company/acme-widgets/">LinkedIn</a>
        </body></html>
    "#;

    #[test]
    fn test_parse_homepage_prefers_site_name() {
        let fields = parse_homepage(PAGE);
        assert!(fields.known.contains(&KnownField::DisplayName("Acme".to_string())));
        assert!(fields
            .known
            .contains(&KnownField::Description("We make widgets.".to_string())));
        assert!(fields.known.contains(&KnownField::LinkedinUrl(
            "https://www.linkedin.com/company/acme-widgets/".to_string()
        )));
    }

    #[test]
    fn test_parse_homepage_falls_back_to_title() {
        let fields = parse_homepage("<html><head><title>Globex - Welcome</title></head></html>");
        assert_eq!(fields.known, vec![KnownField::DisplayName("Globex".to_string())]);
    }

    #[test]
    fn test_parse_homepage_empty_document() {
        assert!(parse_homepage("<html><body>nothing</body></html>").is_empty());
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/{{domain}}")
    }

    fn adapter(template: String) -> WebsiteAdapter {
        WebsiteAdapter::new(&WebsiteConfig::default())
            .unwrap()
            .with_url_template(template)
    }

    fn ctx() -> AdapterContext {
        AdapterContext::new(DomainKey::parse("acme.test").unwrap(), 1)
    }

    #[tokio::test]
    async fn test_fetch_reads_served_page() {
        let template = serve(Router::new().route("/acme.test", get(|| async { HtmlBody(PAGE) }))).await;
        let deadline = Instant::now() + Duration::from_secs(5);

        let fields = adapter(template).fetch(&ctx(), deadline).await.unwrap();

        assert_eq!(fields.len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_maps_status_codes() {
        let template = serve(
            Router::new()
                .route("/acme.test", get(|| async { StatusCode::TOO_MANY_REQUESTS })),
        )
        .await;
        let deadline = Instant::now() + Duration::from_secs(5);

        let err = adapter(template).fetch(&ctx(), deadline).await.unwrap_err();

        assert_eq!(err.kind, AdapterErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn test_fetch_without_metadata_is_not_found() {
        let template = serve(
            Router::new().route("/acme.test", get(|| async { HtmlBody("<p>hi</p>") })),
        )
        .await;
        let deadline = Instant::now() + Duration::from_secs(5);

        let err = adapter(template).fetch(&ctx(), deadline).await.unwrap_err();

        assert_eq!(err.kind, AdapterErrorKind::NotFound);
    }
}
