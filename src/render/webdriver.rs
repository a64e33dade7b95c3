//! [`Browser`] over the W3C WebDriver protocol (chromedriver, geckodriver,
//! selenium).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, Method};
use serde_json::{Value, json};

use super::{BoundingBox, Browser, BrowserSession, PageSize, PdfOptions, POLL_INTERVAL, Viewport};
use crate::errors::RenderError;

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const ENTER_KEY: &str = "\u{E007}";

const A4_WIDTH_CM: f64 = 21.0;
const A4_HEIGHT_CM: f64 = 29.7;

fn px_to_cm(px: u32) -> f64 {
    f64::from(px) * 2.54 / 96.0
}

pub struct WebDriverBrowser {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl WebDriverBrowser {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RenderError> {
        let http = Client::builder()
            .timeout(timeout + Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, RenderError> {
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "acceptInsecureCerts": true,
                    "goog:chromeOptions": {
                        "args": ["--headless=new", "--no-sandbox", "--disable-setuid-sandbox"],
                        "excludeSwitches": ["enable-automation"]
                    }
                }
            }
        });

        let value = send(
            &self.http,
            Method::POST,
            &format!("{}/session", self.base_url),
            Some(capabilities),
        )
        .await?;

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| RenderError::Browser("session id missing from response".into()))?;

        let session = WebDriverSession {
            http: self.http.clone(),
            url: format!("{}/session/{}", self.base_url, session_id),
        };

        let millis = self.timeout.as_millis() as u64;
        session
            .command(
                Method::POST,
                "timeouts",
                Some(json!({ "pageLoad": millis, "script": millis, "implicit": 0 })),
            )
            .await?;

        tracing::debug!(%session_id, "WebDriver session started");
        Ok(Box::new(session))
    }
}

/// Sends a WebDriver command and unwraps its `value`.
async fn send(
    http: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, RenderError> {
    let mut request = http.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await?;
    let status = response.status();
    let mut payload: Value = response.json().await?;
    let value = payload.get_mut("value").map(Value::take).unwrap_or(Value::Null);

    if !status.is_success() {
        let error = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
        let message = value.get("message").and_then(Value::as_str).unwrap_or("");
        return Err(RenderError::Browser(format!("{} ({}): {}", error, status, message)));
    }

    Ok(value)
}

pub struct WebDriverSession {
    http: Client,
    url: String,
}

impl WebDriverSession {
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, RenderError> {
        let url = if path.is_empty() {
            self.url.clone()
        } else {
            format!("{}/{}", self.url, path)
        };
        send(&self.http, method, &url, body).await
    }

    async fn find(&self, selector: &str) -> Result<Option<String>, RenderError> {
        let found = self
            .command(
                Method::POST,
                "element",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await;

        match found {
            Ok(value) => Ok(value.get(ELEMENT_KEY).and_then(Value::as_str).map(String::from)),
            Err(RenderError::Browser(msg)) if msg.starts_with("no such element") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn element(&self, selector: &str) -> Result<String, RenderError> {
        self.find(selector)
            .await?
            .ok_or_else(|| RenderError::Browser(format!("no element matches '{}'", selector)))
    }

    async fn send_keys(&self, selector: &str, text: &str) -> Result<(), RenderError> {
        let element = self.element(selector).await?;
        self.command(
            Method::POST,
            &format!("element/{}/value", element),
            Some(json!({ "text": text })),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn goto(&self, url: &str) -> Result<(), RenderError> {
        self.command(Method::POST, "url", Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    async fn wait_for(&self, selector: &str) -> Result<(), RenderError> {
        while self.find(selector).await?.is_none() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), RenderError> {
        self.send_keys(selector, text).await
    }

    async fn press_enter(&self, selector: &str) -> Result<(), RenderError> {
        self.send_keys(selector, ENTER_KEY).await
    }

    async fn bounding_box(&self, selector: &str) -> Result<BoundingBox, RenderError> {
        let element = self.element(selector).await?;
        let rect = self
            .command(Method::GET, &format!("element/{}/rect", element), None)
            .await?;

        let field = |name: &str| rect.get(name).and_then(Value::as_f64).unwrap_or(0.0);
        Ok(BoundingBox {
            x: field("x"),
            y: field("y"),
            width: field("width"),
            height: field("height"),
        })
    }

    async fn count(&self, selector: &str) -> Result<usize, RenderError> {
        let elements = self
            .command(
                Method::POST,
                "elements",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await?;

        Ok(elements.as_array().map(Vec::len).unwrap_or(0))
    }

    async fn set_viewport(&self, viewport: Viewport) -> Result<(), RenderError> {
        self.command(
            Method::POST,
            "window/rect",
            Some(json!({ "width": viewport.width, "height": viewport.height })),
        )
        .await?;
        Ok(())
    }

    async fn evaluate(&self, script: &str, args: Value) -> Result<Value, RenderError> {
        self.command(
            Method::POST,
            "execute/sync",
            Some(json!({ "script": script, "args": [args] })),
        )
        .await
    }

    async fn pdf(&self, options: &PdfOptions) -> Result<Vec<u8>, RenderError> {
        // WebDriver printing has no header/footer templates; they are laid into the page instead.
        if options.display_header_footer {
            self.evaluate(
                r#"
                const params = arguments[0];
                const header = document.createElement('div');
                header.innerHTML = params.header;
                document.body.insertBefore(header, document.body.firstChild);
                const footer = document.createElement('div');
                footer.innerHTML = params.footer;
                document.body.appendChild(footer);
                "#,
                json!({ "header": options.header_template, "footer": options.footer_template }),
            )
            .await?;
        }

        let encoded = self
            .command(Method::POST, "print", Some(print_parameters(options)))
            .await?;

        let encoded = encoded
            .as_str()
            .ok_or_else(|| RenderError::Browser("print returned no document".into()))?;

        STANDARD
            .decode(encoded)
            .map_err(|e| RenderError::Browser(format!("invalid PDF encoding: {}", e)))
    }

    async fn close(&self) -> Result<(), RenderError> {
        self.command(Method::DELETE, "", None).await?;
        Ok(())
    }
}

/// Body of a `print` command.
fn print_parameters(options: &PdfOptions) -> Value {
    let (orientation, width, height) = match options.page {
        PageSize::Format { landscape, .. } => (
            if landscape { "landscape" } else { "portrait" },
            A4_WIDTH_CM,
            A4_HEIGHT_CM,
        ),
        PageSize::Explicit { width, height } => ("portrait", px_to_cm(width), px_to_cm(height)),
    };

    json!({
        "orientation": orientation,
        "background": options.print_background,
        "shrinkToFit": false,
        "page": { "width": width, "height": height },
        "margin": {
            "top": px_to_cm(options.margin.top),
            "bottom": px_to_cm(options.margin.bottom),
            "left": px_to_cm(options.margin.left),
            "right": px_to_cm(options.margin.right),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{MARGINS, PaperFormat};

    fn options(page: PageSize) -> PdfOptions {
        PdfOptions {
            page,
            margin: MARGINS,
            print_background: false,
            display_header_footer: false,
            header_template: String::new(),
            footer_template: String::new(),
        }
    }

    #[test]
    fn a4_prints_landscape() {
        let params = print_parameters(&options(PageSize::Format {
            format: PaperFormat::A4,
            landscape: true,
        }));

        assert_eq!(params["orientation"], "landscape");
        assert_eq!(params["page"]["width"], 21.0);
        assert_eq!(params["page"]["height"], 29.7);
    }

    #[test]
    fn explicit_size_converts_pixels() {
        let params = print_parameters(&options(PageSize::Explicit {
            width: 1920,
            height: 960,
        }));

        assert_eq!(params["orientation"], "portrait");
        let width = params["page"]["width"].as_f64().unwrap();
        let height = params["page"]["height"].as_f64().unwrap();
        assert!((width - 50.8).abs() < 1e-9);
        assert!((height - 25.4).abs() < 1e-9);
        let top = params["margin"]["top"].as_f64().unwrap();
        assert!((top - 2.6458).abs() < 0.001);
    }
}
