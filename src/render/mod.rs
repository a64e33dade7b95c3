//! Dashboard snapshots rendered to PDF through a headless browser.

use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use crate::clock::Clock;
use crate::config::{KibanaConfig, RenderConfig};
use crate::domain::{Frequency, Period};
use crate::elastic::DashboardSource;
use crate::errors::RenderError;

pub mod webdriver;

#[cfg(test)]
mod tests;

pub const USERNAME_FIELD: &str = "input[name=username]";
pub const PASSWORD_FIELD: &str = "input[name=password]";
pub const LOGIN_FORM: &str = "form";
pub const DASHBOARD_LAYOUT: &str = ".dshLayout--viewing";
pub const VISUALIZATIONS: &str = ".dshLayout--viewing .react-grid-item";

/// Page width used for screen renders.
pub const SCREEN_WIDTH: u32 = 1920;
/// A4 landscape in CSS pixels (29cm x 21cm).
pub const A4_WIDTH: u32 = 1096;
pub const A4_HEIGHT: u32 = 793;
pub const MIN_SCREEN_HEIGHT: u32 = 600;
pub const MARGINS: Margins = Margins {
    left: 50,
    right: 50,
    top: 100,
    bottom: 60,
};

const INJECT_LAYOUT_SCRIPT: &str = r#"
const params = arguments[0];
let css = params.preserveLayoutCss;
if (params.print) {
  css += params.printCss;
}
const style = document.createElement('style');
style.type = 'text/css';
style.innerHTML = css;
document.head.appendChild(style);
if (params.print) {
  document.querySelectorAll(params.visualizations).forEach((visualization, index) => {
    visualization.style.setProperty('top', `${(params.pageHeight - params.marginTop) * index}px`);
  });
}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Margins {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PaperFormat {
    A4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageSize {
    Format { format: PaperFormat, landscape: bool },
    /// Explicit size in CSS pixels.
    Explicit { width: u32, height: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PdfOptions {
    pub page: PageSize,
    pub margin: Margins,
    pub print_background: bool,
    pub display_header_footer: bool,
    pub header_template: String,
    pub footer_template: String,
}

/// An isolated browser session, one per render.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), RenderError>;
    /// Resolves once an element matches `selector`.
    async fn wait_for(&self, selector: &str) -> Result<(), RenderError>;
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), RenderError>;
    async fn press_enter(&self, selector: &str) -> Result<(), RenderError>;
    async fn bounding_box(&self, selector: &str) -> Result<BoundingBox, RenderError>;
    async fn count(&self, selector: &str) -> Result<usize, RenderError>;
    async fn set_viewport(&self, viewport: Viewport) -> Result<(), RenderError>;
    async fn evaluate(&self, script: &str, args: Value) -> Result<Value, RenderError>;
    async fn pdf(&self, options: &PdfOptions) -> Result<Vec<u8>, RenderError>;
    async fn close(&self) -> Result<(), RenderError>;
}

#[async_trait]
pub trait Browser: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, RenderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderParams {
    pub dashboard_id: String,
    pub space: Option<String>,
    pub frequency: String,
    pub print: bool,
}

#[derive(Debug, Clone)]
pub struct RenderResult {
    pub pdf: Vec<u8>,
    pub dashboard_title: Option<String>,
    /// Public address of the dashboard, period filter included.
    pub dashboard_url: String,
    pub period: Period,
}

#[async_trait]
pub trait DashboardRenderer: Send + Sync {
    /// Renders a dashboard over the period preceding now.
    ///
    /// Returns `Ok(None)` when the static assets cannot be found.
    async fn render(&self, params: &RenderParams) -> Result<Option<RenderResult>, RenderError>;
}

/// Static files embedded in every report.
#[derive(Debug, Clone)]
pub struct Assets {
    pub logo_base64: String,
    pub preserve_layout_css: String,
    pub print_css: String,
}

impl Assets {
    /// Reads the logo and stylesheets, `None` when one is missing or empty.
    pub async fn load(dir: &Path) -> Result<Option<Self>, RenderError> {
        let logo = read_asset(&dir.join("logo.png")).await?;
        let preserve_layout_css = read_asset(&dir.join("css").join("preserve_layout.css")).await?;
        let print_css = read_asset(&dir.join("css").join("print.css")).await?;

        let (Some(logo), Some(preserve_layout_css), Some(print_css)) =
            (logo, preserve_layout_css, print_css)
        else {
            return Ok(None);
        };

        Ok(Some(Assets {
            logo_base64: STANDARD.encode(logo),
            preserve_layout_css: String::from_utf8_lossy(&preserve_layout_css).into_owned(),
            print_css: String::from_utf8_lossy(&print_css).into_owned(),
        }))
    }
}

async fn read_asset(path: &Path) -> Result<Option<Vec<u8>>, RenderError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(None),
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "Report asset missing");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn iso(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Kibana path of a dashboard with its time filter set to `period`.
pub fn dashboard_path(dashboard_id: &str, space: Option<&str>, period: &Period) -> String {
    let prefix = match space.filter(|s| !s.is_empty()) {
        Some(space) => format!("s/{}/", space),
        None => String::new(),
    };

    format!(
        "{}app/dashboards#/view/{}?_g=(time:(from:'{}',mode:absolute,to:'{}'))",
        prefix,
        dashboard_id,
        iso(period.from),
        iso(period.to)
    )
}

/// Viewport the dashboard is laid out in before printing.
pub fn layout_viewport(print: bool, layout: BoundingBox, visualizations: usize) -> Viewport {
    if print {
        Viewport {
            width: A4_WIDTH,
            height: A4_HEIGHT.saturating_mul(u32::try_from(visualizations.max(1)).unwrap_or(u32::MAX)),
        }
    } else {
        Viewport {
            width: SCREEN_WIDTH,
            height: layout.height.ceil() as u32,
        }
    }
}

/// Page size of the exported PDF.
pub fn page_size(print: bool, layout: BoundingBox) -> PageSize {
    if print {
        PageSize::Format {
            format: PaperFormat::A4,
            landscape: true,
        }
    } else {
        let height = (layout.height.ceil() as u32)
            .saturating_add(MARGINS.top)
            .saturating_add(MARGINS.bottom);
        PageSize::Explicit {
            width: SCREEN_WIDTH,
            height: height.max(MIN_SCREEN_HEIGHT),
        }
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn header_template(title: Option<&str>, url: &str, period: &Period, now: DateTime<Utc>) -> String {
    let title = escape_html(title.unwrap_or("Dashboard"));
    format!(
        r#"
      <div style="width: {width}px; color: black; text-align: center; line-height: 5px">
        <h1 style="font-size: 14px;"><a href="{url}">{title}</a></h1>
        <p style="font-size: 10px;">Report covering the period from {from} to {to}</p>
        <p style="font-size: 10px;">Generated on {generated}</p>
      </div>
    "#,
        width = SCREEN_WIDTH,
        url = escape_html(url),
        from = period.from.format("%d/%m/%Y %H:%M"),
        to = period.to.format("%d/%m/%Y %H:%M"),
        generated = now.format("%A %-d %B %Y"),
    )
}

fn footer_template(kibana_url: &str, logo_base64: &str) -> String {
    format!(
        r#"
      <div style="width: {width}px; color: black;">
        <div style="text-align: center;">
          <a href="{kibana_url}"><img src="data:image/png;base64,{logo_base64}" width="128px" /></a>
        </div>
        <div style="text-align: right; margin-right: 60px;">
          <span class="pageNumber"></span> / <span class="totalPages"></span>
        </div>
      </div>
    "#,
        width = SCREEN_WIDTH,
        kibana_url = escape_html(kibana_url),
    )
}

pub struct BrowserRenderer {
    browser: Arc<dyn Browser>,
    dashboards: Arc<dyn DashboardSource>,
    clock: Arc<dyn Clock>,
    kibana: KibanaConfig,
    settings: RenderConfig,
    username: String,
    password: String,
}

impl BrowserRenderer {
    pub fn new(
        browser: Arc<dyn Browser>,
        dashboards: Arc<dyn DashboardSource>,
        clock: Arc<dyn Clock>,
        kibana: KibanaConfig,
        settings: RenderConfig,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            browser,
            dashboards,
            clock,
            kibana,
            settings,
            username: username.into(),
            password: password.into(),
        }
    }

    /// Bounds a navigation or wait step by the render timeout.
    async fn step<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = Result<T, RenderError>>,
    ) -> Result<T, RenderError> {
        tokio::time::timeout(self.settings.timeout, fut)
            .await
            .map_err(|_| RenderError::Timeout(what))?
    }

    async fn drive(
        &self,
        session: &dyn BrowserSession,
        print: bool,
        dashboard_path: &str,
        assets: &Assets,
        header: String,
    ) -> Result<Vec<u8>, RenderError> {
        let url = format!("{}/{}", self.kibana.browser_url().trim_end_matches('/'), dashboard_path);

        self.step("loading the dashboard", session.goto(&url)).await?;
        self.step("waiting for the login form", session.wait_for(LOGIN_FORM))
            .await?;

        self.step("waiting for the username field", session.wait_for(USERNAME_FIELD))
            .await?;
        session.type_text(USERNAME_FIELD, &self.username).await?;

        self.step("waiting for the password field", session.wait_for(PASSWORD_FIELD))
            .await?;
        session.type_text(PASSWORD_FIELD, &self.password).await?;
        session.press_enter(PASSWORD_FIELD).await?;

        self.step("waiting for the dashboard layout", session.wait_for(DASHBOARD_LAYOUT))
            .await?;

        let layout = session.bounding_box(DASHBOARD_LAYOUT).await?;
        let visualizations = session.count(VISUALIZATIONS).await?;
        tracing::debug!(?layout, visualizations, "Dashboard layout ready");

        session
            .set_viewport(layout_viewport(print, layout, visualizations))
            .await?;

        session
            .evaluate(
                INJECT_LAYOUT_SCRIPT,
                json!({
                    "print": print,
                    "preserveLayoutCss": assets.preserve_layout_css,
                    "printCss": assets.print_css,
                    "visualizations": VISUALIZATIONS,
                    "pageHeight": A4_HEIGHT,
                    "marginTop": MARGINS.top,
                }),
            )
            .await?;

        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        let options = PdfOptions {
            page: page_size(print, layout),
            margin: MARGINS,
            print_background: false,
            display_header_footer: true,
            header_template: header,
            footer_template: footer_template(&self.kibana.external_url, &assets.logo_base64),
        };

        session.pdf(&options).await
    }
}

#[async_trait]
impl DashboardRenderer for BrowserRenderer {
    async fn render(&self, params: &RenderParams) -> Result<Option<RenderResult>, RenderError> {
        let frequency = Frequency::new(params.frequency.clone());
        let now = self.clock.now();
        let period = frequency
            .reported_period(now)
            .ok_or_else(|| RenderError::InvalidFrequency(params.frequency.clone()))?;

        let space = params.space.as_deref();
        let dashboard_title = self
            .dashboards
            .dashboard_title(&params.dashboard_id, space)
            .await?;
        let path = dashboard_path(&params.dashboard_id, space, &period);
        let dashboard_url = format!("{}/{}", self.kibana.external_url.trim_end_matches('/'), path);

        let Some(assets) = Assets::load(&self.settings.assets_dir).await? else {
            return Ok(None);
        };

        let header = header_template(dashboard_title.as_deref(), &dashboard_url, &period, now);

        let session = self.browser.launch().await?;
        let started = std::time::Instant::now();
        let outcome = self
            .drive(session.as_ref(), params.print, &path, &assets, header)
            .await;

        if let Err(e) = session.close().await {
            tracing::warn!("Failed to close browser session: {}", e);
        }

        let pdf = outcome?;
        tracing::info!(
            dashboard = %params.dashboard_id,
            bytes = pdf.len(),
            elapsed = ?started.elapsed(),
            "Dashboard rendered"
        );

        Ok(Some(RenderResult {
            pdf,
            dashboard_title,
            dashboard_url,
            period,
        }))
    }
}

/// Default wait between two element lookups of a polling session.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
