use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeZone;
use serde_json::Value;

use super::*;
use crate::clock::ManualClock;
use crate::errors::ElasticError;

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
    pdf_options: Mutex<Option<PdfOptions>>,
    viewport: Mutex<Option<Viewport>>,
    launches: AtomicUsize,
    closes: AtomicUsize,
}

impl Recorder {
    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

struct FakeBrowser {
    recorder: Arc<Recorder>,
    /// Selector that never shows up.
    missing: Option<&'static str>,
}

struct FakeSession {
    recorder: Arc<Recorder>,
    missing: Option<&'static str>,
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, RenderError> {
        self.recorder.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            recorder: self.recorder.clone(),
            missing: self.missing,
        }))
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn goto(&self, url: &str) -> Result<(), RenderError> {
        self.recorder.log(format!("goto {url}"));
        Ok(())
    }

    async fn wait_for(&self, selector: &str) -> Result<(), RenderError> {
        if self.missing == Some(selector) {
            std::future::pending::<()>().await;
        }
        self.recorder.log(format!("wait {selector}"));
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), RenderError> {
        self.recorder.log(format!("type {selector} {text}"));
        Ok(())
    }

    async fn press_enter(&self, selector: &str) -> Result<(), RenderError> {
        self.recorder.log(format!("enter {selector}"));
        Ok(())
    }

    async fn bounding_box(&self, _selector: &str) -> Result<BoundingBox, RenderError> {
        Ok(BoundingBox {
            x: 0.0,
            y: 48.0,
            width: 1880.0,
            height: 1200.4,
        })
    }

    async fn count(&self, _selector: &str) -> Result<usize, RenderError> {
        Ok(3)
    }

    async fn set_viewport(&self, viewport: Viewport) -> Result<(), RenderError> {
        *self.recorder.viewport.lock().unwrap() = Some(viewport);
        Ok(())
    }

    async fn evaluate(&self, _script: &str, args: Value) -> Result<Value, RenderError> {
        self.recorder.log(format!("evaluate print={}", args["print"]));
        Ok(Value::Null)
    }

    async fn pdf(&self, options: &PdfOptions) -> Result<Vec<u8>, RenderError> {
        *self.recorder.pdf_options.lock().unwrap() = Some(options.clone());
        Ok(b"%PDF-1.7 fake".to_vec())
    }

    async fn close(&self) -> Result<(), RenderError> {
        self.recorder.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeDashboards {
    lookups: AtomicUsize,
}

#[async_trait]
impl DashboardSource for FakeDashboards {
    async fn dashboard_title(
        &self,
        _dashboard_id: &str,
        _space: Option<&str>,
    ) -> Result<Option<String>, ElasticError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(Some("Usage <monthly>".into()))
    }
}

fn assets_dir(with_print_css: bool) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ezreporting-assets-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(dir.join("css")).unwrap();
    std::fs::write(dir.join("logo.png"), [0x89, b'P', b'N', b'G']).unwrap();
    std::fs::write(dir.join("css/preserve_layout.css"), "body { margin: 0; }").unwrap();
    if with_print_css {
        std::fs::write(dir.join("css/print.css"), ".react-grid-item { position: absolute; }").unwrap();
    }
    dir
}

struct Harness {
    renderer: BrowserRenderer,
    recorder: Arc<Recorder>,
    dashboards: Arc<FakeDashboards>,
}

fn harness(missing: Option<&'static str>, assets: PathBuf) -> Harness {
    let recorder = Arc::new(Recorder::default());
    let dashboards = Arc::new(FakeDashboards::default());
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 19, 6, 0, 0).unwrap());

    let renderer = BrowserRenderer::new(
        Arc::new(FakeBrowser {
            recorder: recorder.clone(),
            missing,
        }),
        dashboards.clone(),
        Arc::new(clock),
        KibanaConfig {
            internal_url: Some("http://kibana:5601".into()),
            external_url: "https://stats.example.org".into(),
        },
        RenderConfig {
            webdriver_url: "http://unused".into(),
            timeout: Duration::from_millis(100),
            settle_delay: Duration::ZERO,
            assets_dir: assets,
        },
        "elastic",
        "secret",
    );

    Harness {
        renderer,
        recorder,
        dashboards,
    }
}

fn params(frequency: &str, print: bool) -> RenderParams {
    RenderParams {
        dashboard_id: "5b9c4a6e-3f0b-4d7a-9a4e-8c1f2d3e4f50".into(),
        space: Some("team".into()),
        frequency: frequency.into(),
        print,
    }
}

#[tokio::test]
async fn print_mode_uses_a4_landscape() {
    let h = harness(None, assets_dir(true));

    let result = h.renderer.render(&params("monthly", true)).await.unwrap().unwrap();
    assert_eq!(result.pdf, b"%PDF-1.7 fake");
    assert_eq!(result.dashboard_title.as_deref(), Some("Usage <monthly>"));
    assert!(result.dashboard_url.starts_with("https://stats.example.org/s/team/app/dashboards#/view/"));
    assert_eq!(result.period.from, Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap());
    assert_eq!(result.period.to, Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap());

    let options = h.recorder.pdf_options.lock().unwrap().clone().unwrap();
    assert_eq!(
        options.page,
        PageSize::Format {
            format: PaperFormat::A4,
            landscape: true
        }
    );
    assert_eq!(options.margin, MARGINS);
    assert!(options.display_header_footer);
    assert!(options.header_template.contains("Usage &lt;monthly&gt;"));

    let viewport = h.recorder.viewport.lock().unwrap().unwrap();
    assert_eq!(viewport, Viewport { width: A4_WIDTH, height: A4_HEIGHT * 3 });
    assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn screen_mode_sizes_page_from_layout() {
    let h = harness(None, assets_dir(true));

    h.renderer.render(&params("weekly", false)).await.unwrap().unwrap();

    let options = h.recorder.pdf_options.lock().unwrap().clone().unwrap();
    assert_eq!(
        options.page,
        PageSize::Explicit {
            width: SCREEN_WIDTH,
            height: 1201 + MARGINS.top + MARGINS.bottom
        }
    );

    let calls = h.recorder.calls.lock().unwrap().clone();
    assert!(calls[0].starts_with("goto http://kibana:5601/s/team/app/dashboards#/view/"));
    assert!(calls.contains(&"type input[name=username] elastic".to_string()));
    assert!(calls.contains(&"type input[name=password] secret".to_string()));
    assert!(calls.contains(&"enter input[name=password]".to_string()));
    assert!(calls.contains(&"evaluate print=false".to_string()));
}

#[test]
fn short_screen_pages_have_a_minimum_height() {
    let layout = BoundingBox {
        x: 0.0,
        y: 0.0,
        width: 1900.0,
        height: 120.0,
    };
    assert_eq!(
        page_size(false, layout),
        PageSize::Explicit {
            width: SCREEN_WIDTH,
            height: MIN_SCREEN_HEIGHT
        }
    );
}

#[test]
fn huge_layouts_saturate_instead_of_overflowing() {
    let layout = BoundingBox {
        x: 0.0,
        y: 0.0,
        width: 1900.0,
        height: f64::MAX,
    };

    assert_eq!(layout_viewport(true, layout, 0).height, A4_HEIGHT);
    assert_eq!(layout_viewport(true, layout, 3).height, 3 * A4_HEIGHT);
    assert_eq!(layout_viewport(true, layout, 10_000_000).height, u32::MAX);
    assert_eq!(layout_viewport(true, layout, usize::MAX).height, u32::MAX);
    assert_eq!(
        page_size(false, layout),
        PageSize::Explicit {
            width: SCREEN_WIDTH,
            height: u32::MAX
        }
    );
}

#[tokio::test]
async fn invalid_frequency_fails_before_any_call() {
    let h = harness(None, assets_dir(true));

    let err = h.renderer.render(&params("hourly", false)).await.unwrap_err();
    assert!(matches!(err, RenderError::InvalidFrequency(ref f) if f == "hourly"));
    assert_eq!(h.recorder.launches.load(Ordering::SeqCst), 0);
    assert_eq!(h.dashboards.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_assets_yield_no_result() {
    let h = harness(None, assets_dir(false));

    let result = h.renderer.render(&params("daily", true)).await.unwrap();
    assert!(result.is_none());
    assert_eq!(h.recorder.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn layout_timeout_is_fatal_and_closes_session() {
    let h = harness(Some(DASHBOARD_LAYOUT), assets_dir(true));

    let err = h.renderer.render(&params("daily", false)).await.unwrap_err();
    assert!(matches!(err, RenderError::Timeout("waiting for the dashboard layout")));
    assert!(h.recorder.pdf_options.lock().unwrap().is_none());
    assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn dashboard_path_embeds_period() {
    let period = Period {
        from: Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap(),
        to: Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap(),
    };

    assert_eq!(
        dashboard_path("abc", None, &period),
        "app/dashboards#/view/abc?_g=(time:(from:'2026-10-12T00:00:00.000Z',mode:absolute,to:'2026-10-19T00:00:00.000Z'))"
    );
    assert!(dashboard_path("abc", Some("team"), &period).starts_with("s/team/app/"));
}
