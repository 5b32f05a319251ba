//! plume view engine.
//!
//! Wraps the plume-core compiler with everything the serving side needs:
//! configuration, the coalescing per-path compilation cache with TTL and
//! file-watch invalidation, component and layout resolution against the
//! filesystem, the async render entry point with a per-request timeout,
//! failure-page mapping, cache warming, and the lazy fragment store.
//!
//! Rendering is request-scoped: each request carries its own context map
//! and produces independent output; the caches are the only state shared
//! across requests.

pub mod cache;
pub mod watch;

pub use cache::{CacheEntry, LazyCache, ViewCache};
pub use watch::WatchGuard;

use plume_core::expand::{ComponentSource, Expander};
use plume_core::rawblock::{BlockConverter, DefaultConverters};
use plume_core::{Binding, Diagnostic, Document, Registry, compile_source};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::Cell;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Engine configuration. Duration fields accept `ms`/`s`/`m`/`h`/`d`
/// suffixes or bare milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    /// Base directory that relative roots resolve under.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_views")]
    pub views: String,
    /// Component directory, resolved under the views root unless absolute.
    #[serde(default = "default_components")]
    pub components: String,
    #[serde(default = "default_ext")]
    pub ext: String,
    /// Layout template name, applied to every render unless the request
    /// context overrides it.
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default = "default_cache")]
    pub cache: String,
    #[serde(default = "default_lazy_cache")]
    pub lazy_cache: String,
    #[serde(default = "default_timeout")]
    pub timeout: String,
    /// When set, only the `public` context subtree reaches client-visible
    /// output; switching it off exposes the whole context.
    #[serde(default = "default_secure")]
    pub secure: bool,
    /// Includes failure detail in error pages.
    #[serde(default)]
    pub debug: bool,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_views() -> String {
    "views".to_string()
}

fn default_components() -> String {
    "components".to_string()
}

fn default_ext() -> String {
    "xhtml".to_string()
}

fn default_cache() -> String {
    "2h".to_string()
}

fn default_lazy_cache() -> String {
    "12h".to_string()
}

fn default_timeout() -> String {
    "30s".to_string()
}

fn default_secure() -> bool {
    true
}

impl Default for Options {
    fn default() -> Self {
        Self {
            root: default_root(),
            views: default_views(),
            components: default_components(),
            ext: default_ext(),
            layout: None,
            cache: default_cache(),
            lazy_cache: default_lazy_cache(),
            timeout: default_timeout(),
            secure: default_secure(),
            debug: false,
        }
    }
}

/// Parses `"2h"`, `"30s"`, `"250ms"`, `"1.5m"` or bare milliseconds.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let (number, scale_ms) = if let Some(n) = text.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = text.strip_suffix(['s', 'S']) {
        (n, 1000.0)
    } else if let Some(n) = text.strip_suffix(['m', 'M']) {
        (n, 60_000.0)
    } else if let Some(n) = text.strip_suffix(['h', 'H']) {
        (n, 3_600_000.0)
    } else if let Some(n) = text.strip_suffix(['d', 'D']) {
        (n, 86_400_000.0)
    } else {
        (text, 1.0)
    };
    let value: f64 = number.trim().parse().ok()?;
    if value < 0.0 {
        return None;
    }
    Some(Duration::from_millis((value * scale_ms) as u64))
}

/// The distinguished failure states a render can end in. Everything else
/// degrades to empty output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RenderError {
    NotFound,
    Timeout,
    Internal { detail: String },
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::NotFound => write!(f, "view not found"),
            RenderError::Timeout => write!(f, "render timed out"),
            RenderError::Internal { detail } => write!(f, "internal error: {detail}"),
        }
    }
}

impl std::error::Error for RenderError {}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderOutput {
    pub html: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// A render result mapped to an HTTP-shaped status and body.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub status: u16,
    pub html: String,
}

pub type BeforeHook = Arc<dyn Fn(&mut Map<String, Value>) + Send + Sync>;
pub type AfterHook = Arc<dyn Fn(&Map<String, Value>, &mut RenderOutput) + Send + Sync>;

struct EngineInner {
    options: Options,
    views_root: PathBuf,
    components_root: PathBuf,
    default_timeout: Duration,
    registry: RwLock<Registry>,
    cache: ViewCache,
    lazy: LazyCache,
    converters: Box<dyn BlockConverter + Send + Sync>,
    before: RwLock<Option<BeforeHook>>,
    after: RwLock<Option<AfterHook>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(options: Options) -> Self {
        Self::with_converters(options, Box::new(DefaultConverters))
    }

    pub fn with_converters(
        options: Options,
        converters: Box<dyn BlockConverter + Send + Sync>,
    ) -> Self {
        let views_root = resolve_root(&options.root, &options.views);
        let components_root = resolve_root(&views_root, &options.components);
        let cache_ttl = parse_duration(&options.cache).unwrap_or(Duration::from_secs(7200));
        let lazy_ttl =
            parse_duration(&options.lazy_cache).unwrap_or(Duration::from_secs(43_200));
        let default_timeout =
            parse_duration(&options.timeout).unwrap_or(Duration::from_secs(30));

        Self {
            inner: Arc::new(EngineInner {
                options,
                views_root,
                components_root,
                default_timeout,
                registry: RwLock::new(Registry::with_builtins()),
                cache: ViewCache::new(cache_ttl),
                lazy: LazyCache::new(lazy_ttl),
                converters,
                before: RwLock::new(None),
                after: RwLock::new(None),
            }),
        }
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Extension API; first registration for a name wins.
    pub fn register_tag_function(&self, names: &[&str], binding: Binding) -> bool {
        match self.inner.registry.write() {
            Ok(mut registry) => registry.register(names, binding),
            Err(_) => false,
        }
    }

    pub fn on_before(&self, hook: BeforeHook) {
        if let Ok(mut slot) = self.inner.before.write() {
            *slot = Some(hook);
        }
    }

    pub fn on_after(&self, hook: AfterHook) {
        if let Ok(mut slot) = self.inner.after.write() {
            *slot = Some(hook);
        }
    }

    /// Renders a view with the given request context.
    pub async fn render(
        &self,
        view: &str,
        ctx: Map<String, Value>,
    ) -> Result<RenderOutput, RenderError> {
        let budget = request_timeout(&ctx).unwrap_or(self.inner.default_timeout);
        let inner = self.inner.clone();
        let view = view.to_string();

        let task = tokio::task::spawn_blocking(move || {
            inner.render_sync(&view, ctx, Instant::now() + budget)
        });
        match tokio::time::timeout(budget, task).await {
            Err(_) => Err(RenderError::Timeout),
            Ok(Err(join)) => Err(RenderError::Internal {
                detail: join.to_string(),
            }),
            Ok(Ok(result)) => result,
        }
    }

    /// Renders a view and maps failures onto the configured error pages.
    pub async fn render_page(&self, view: &str, ctx: Map<String, Value>) -> Page {
        match self.render(view, ctx.clone()).await {
            Ok(output) => Page {
                status: 200,
                html: output.html,
            },
            Err(err) => self.failure_page(err, ctx).await,
        }
    }

    async fn failure_page(&self, err: RenderError, ctx: Map<String, Value>) -> Page {
        match err {
            RenderError::NotFound => {
                for candidate in ["error/404", "404"] {
                    if let Ok(out) = self.render(candidate, ctx.clone()).await {
                        return Page {
                            status: 404,
                            html: out.html,
                        };
                    }
                }
                Page {
                    status: 404,
                    html: "<h1>Error 404</h1><h2>Page Not Found</h2>".to_string(),
                }
            }
            RenderError::Timeout => Page {
                status: 503,
                html: "<h1>Error 503</h1><h2>Service Unavailable</h2>\
                       <p>The server failed to complete your request. Please try again \
                       or contact a server administrator if this happens frequently.</p>"
                    .to_string(),
            },
            RenderError::Internal { detail } => {
                for candidate in ["error/500", "500"] {
                    if let Ok(out) = self.render(candidate, ctx.clone()).await {
                        return Page {
                            status: 500,
                            html: out.html,
                        };
                    }
                }
                let mut html = "<h1>Error 500</h1><h2>Internal Server Error</h2>".to_string();
                if self.inner.options.debug {
                    html.push_str(&format!("<p>{}</p>", plume_core::escape_html(&detail)));
                }
                Page { status: 500, html }
            }
        }
    }

    /// Forces cache population for a view without rendering it.
    pub async fn precompile(
        &self,
        view: &str,
        ctx: Map<String, Value>,
    ) -> Result<(), RenderError> {
        let budget = request_timeout(&ctx).unwrap_or(self.inner.default_timeout);
        let inner = self.inner.clone();
        let view = view.to_string();
        let task = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + budget;
            inner
                .load_view(&view, cache_suffix(&ctx).as_deref(), deadline)
                .map(|_| ())
        });
        match tokio::time::timeout(budget, task).await {
            Err(_) => Err(RenderError::Timeout),
            Ok(Err(join)) => Err(RenderError::Internal {
                detail: join.to_string(),
            }),
            Ok(Ok(result)) => result,
        }
    }

    /// True when the view's compiled document is currently cached.
    pub fn has_cache(&self, view: &str, ctx: &Map<String, Value>) -> bool {
        let Some(path) = self.inner.view_path(view) else {
            return false;
        };
        self.inner
            .cache
            .contains(&view_key(&path, cache_suffix(ctx).as_deref()))
    }

    /// Stores an expanded fragment for deferred delivery, returning its
    /// one-time token.
    pub fn stash_fragment(&self, html: String) -> String {
        self.inner.lazy.stash(html)
    }

    /// Consumes a previously stashed fragment.
    pub fn take_fragment(&self, token: &str) -> Option<String> {
        self.inner.lazy.take(token)
    }

    pub fn invalidate(&self, path: &Path) {
        self.inner.cache.invalidate_path(path);
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Starts watching the views tree; file changes drop the affected
    /// cache entries.
    pub fn watch(&self) -> Result<WatchGuard, String> {
        let inner = self.inner.clone();
        watch::watch_invalidate(&self.inner.views_root, move |path| {
            inner.cache.invalidate_path(path);
        })
    }
}

impl EngineInner {
    fn render_sync(
        &self,
        view: &str,
        mut ctx: Map<String, Value>,
        deadline: Instant,
    ) -> Result<RenderOutput, RenderError> {
        if let Ok(before) = self.before.read() {
            if let Some(hook) = before.as_ref() {
                hook(&mut ctx);
            }
        }

        let layout = layout_name(&ctx).or_else(|| self.options.layout.clone());
        let doc = self.load_view(view, cache_suffix(&ctx).as_deref(), deadline)?;

        let registry = self
            .registry
            .read()
            .map_err(|_| RenderError::Internal {
                detail: "tag function registry is unavailable".to_string(),
            })?;
        let components = CacheComponents {
            inner: self,
            deadline,
            failure: Cell::new(None),
        };
        let expander = Expander::new(&registry, &components);

        let mut diagnostics = Vec::new();
        let mut html = expander.render_document(&doc, &ctx, &mut diagnostics);

        if let Some(name) = layout {
            match self.load_view(&name, None, deadline) {
                Ok(layout_doc) => {
                    html = expander.render_with_body(
                        &layout_doc,
                        &ctx,
                        Some(&html),
                        &mut diagnostics,
                    );
                }
                Err(RenderError::NotFound) => {
                    diagnostics.push(Diagnostic::warn(
                        "missing_layout",
                        format!("layout '{}' not found", name),
                    ));
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(err) = components.failure.take() {
            return Err(err);
        }

        let html = self.inject_public(html, &ctx);

        let mut output = RenderOutput {
            html,
            diagnostics,
        };
        if let Ok(after) = self.after.read() {
            if let Some(hook) = after.as_ref() {
                hook(&ctx, &mut output);
            }
        }
        Ok(output)
    }

    fn view_path(&self, view: &str) -> Option<PathBuf> {
        let rel = sanitize_rel(view, &self.options.ext)?;
        Some(append_ext(self.views_root.join(rel), &self.options.ext))
    }

    fn load_view(
        &self,
        view: &str,
        cache_id: Option<&str>,
        deadline: Instant,
    ) -> Result<Arc<Document>, RenderError> {
        let path = self.view_path(view).ok_or(RenderError::NotFound)?;
        if !path.is_file() {
            return Err(RenderError::NotFound);
        }
        let key = view_key(&path, cache_id);
        self.cache
            .get_or_compile(&key, deadline, || self.compile_file(&path))
    }

    fn load_component(
        &self,
        name: &str,
        deadline: Instant,
    ) -> Result<Option<Arc<Document>>, RenderError> {
        let Some(rel) = sanitize_rel(name, &self.options.ext) else {
            return Ok(None);
        };

        let candidates = [
            append_ext(self.components_root.join(&rel), &self.options.ext),
            append_ext(self.views_root.join(&rel), &self.options.ext),
            append_ext(self.views_root.join(&rel).join("index"), &self.options.ext),
        ];

        for path in candidates {
            if !path.is_file() {
                continue;
            }
            let key = format!("comp:{}", path.display());
            return match self
                .cache
                .get_or_compile(&key, deadline, || self.compile_file(&path))
            {
                Ok(doc) => Ok(Some(doc)),
                // The file vanished between the check and the read.
                Err(RenderError::NotFound) => Ok(None),
                Err(err) => Err(err),
            };
        }
        Ok(None)
    }

    fn compile_file(
        &self,
        path: &Path,
    ) -> Result<(Arc<Document>, Vec<PathBuf>), RenderError> {
        let source = fs::read_to_string(path).map_err(|_| RenderError::NotFound)?;
        let doc = compile_source(&source, self.converters.as_ref()).map_err(|detail| {
            RenderError::Internal {
                detail: format!("{}: {detail}", path.display()),
            }
        })?;
        Ok((Arc::new(doc), vec![path.to_path_buf()]))
    }

    /// Injects the client-visible context subtree into the document head:
    /// `public.js` as script constants, `public.css` as root custom
    /// properties. With `secure` off the whole context is exposed as well.
    fn inject_public(&self, html: String, ctx: &Map<String, Value>) -> String {
        let mut head = String::new();

        if let Some(Value::Object(public)) = ctx.get("public") {
            if let Some(Value::Object(js)) = public.get("js") {
                if !js.is_empty() {
                    let mut script = String::from("<script>");
                    for (key, value) in js {
                        let key = js_identifier(key);
                        let Ok(json) = serde_json::to_string(value) else {
                            continue;
                        };
                        if !key.is_empty() {
                            script.push_str(&format!("const {key}={json};"));
                        }
                    }
                    script.push_str("</script>");
                    head.push_str(&script);
                }
            }
            if let Some(Value::Object(css)) = public.get("css") {
                if !css.is_empty() {
                    let mut style = String::from("<style>:root{");
                    for (key, value) in css {
                        let key: String = key
                            .chars()
                            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
                            .collect();
                        if !key.is_empty() {
                            style.push_str(&format!(
                                "--{key}:{};",
                                plume_core::ctx::display(value)
                            ));
                        }
                    }
                    style.push_str("}</style>");
                    head.push_str(&style);
                }
            }
        }

        if !self.options.secure {
            if let Ok(json) = serde_json::to_string(ctx) {
                head.push_str(&format!("<script>const PLUME_CTX={json};</script>"));
            }
        }

        if head.is_empty() {
            return html;
        }
        match html.find("</head>") {
            Some(pos) => {
                let mut out = String::with_capacity(html.len() + head.len());
                out.push_str(&html[..pos]);
                out.push_str(&head);
                out.push_str(&html[pos..]);
                out
            }
            None => format!("{head}{html}"),
        }
    }
}

/// Component lookups during expansion go through the cache under the
/// `comp:` namespace. Fatal lookup failures (timeout, conversion) are
/// parked and surfaced after expansion; a plain miss stays tolerant.
struct CacheComponents<'a> {
    inner: &'a EngineInner,
    deadline: Instant,
    failure: Cell<Option<RenderError>>,
}

impl ComponentSource for CacheComponents<'_> {
    fn load(&self, name: &str) -> Option<Arc<Document>> {
        match self.inner.load_component(name, self.deadline) {
            Ok(found) => found,
            Err(err) => {
                self.failure.set(Some(err));
                None
            }
        }
    }
}

/// Appends the template extension without clobbering dots already in the
/// file name.
fn append_ext(mut path: PathBuf, ext: &str) -> PathBuf {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        let name = format!("{name}.{ext}");
        path.set_file_name(name);
    }
    path
}

fn resolve_root(base: &Path, dir: &str) -> PathBuf {
    let path = Path::new(dir);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Normalizes a view name: extension stripped, leading separators removed,
/// parent-directory escapes rejected.
fn sanitize_rel(view: &str, ext: &str) -> Option<PathBuf> {
    let trimmed = view.trim_start_matches(['/', '\\']);
    let trimmed = trimmed
        .strip_suffix(&format!(".{ext}"))
        .unwrap_or(trimmed);

    let mut out = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        return None;
    }
    Some(out)
}

fn view_key(path: &Path, cache_id: Option<&str>) -> String {
    match cache_id {
        Some(id) => format!("view:{}:{id}", path.display()),
        None => format!("view:{}", path.display()),
    }
}

fn cache_suffix(ctx: &Map<String, Value>) -> Option<String> {
    let id = ctx.get("cacheID")?.as_str()?;
    let id: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect();
    (!id.is_empty()).then_some(id)
}

fn layout_name(ctx: &Map<String, Value>) -> Option<String> {
    for key in ["layout", "template"] {
        if let Some(Value::String(name)) = ctx.get(key) {
            if !name.trim().is_empty() {
                return Some(name.clone());
            }
        }
    }
    None
}

fn request_timeout(ctx: &Map<String, Value>) -> Option<Duration> {
    match ctx.get("timeout")? {
        Value::Number(n) => Some(Duration::from_millis(n.as_f64()?.max(0.0) as u64)),
        Value::String(s) => parse_duration(s),
        _ => None,
    }
}

fn js_identifier(key: &str) -> String {
    key.replace('-', "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write_file(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = fs::File::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    fn engine_at(root: &Path) -> Engine {
        Engine::new(Options {
            root: root.to_path_buf(),
            ..Options::default()
        })
    }

    fn ctx_of(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("object expected"),
        }
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("1.5m"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("500"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn test_sanitize_rel_rejects_escapes() {
        assert!(sanitize_rel("../etc/passwd", "xhtml").is_none());
        assert_eq!(
            sanitize_rel("/blog/post.xhtml", "xhtml"),
            Some(PathBuf::from("blog/post"))
        );
    }

    #[tokio::test]
    async fn test_render_basic_view() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            &dir.path().join("views/index.xhtml"),
            "<h1>{{title}}</h1>",
        );
        let engine = engine_at(dir.path());
        let out = engine
            .render("index", ctx_of(json!({"title": "Hi"})))
            .await
            .unwrap();
        assert_eq!(out.html, "<h1>Hi</h1>");
    }

    #[tokio::test]
    async fn test_missing_view_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("views")).unwrap();
        let engine = engine_at(dir.path());
        let err = engine.render("nope", Map::new()).await.unwrap_err();
        assert_eq!(err, RenderError::NotFound);

        let page = engine.render_page("nope", Map::new()).await;
        assert_eq!(page.status, 404);
        assert!(page.html.contains("Error 404"));
    }

    #[tokio::test]
    async fn test_configured_404_page_is_used() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            &dir.path().join("views/error/404.xhtml"),
            "<p>custom missing</p>",
        );
        let engine = engine_at(dir.path());
        let page = engine.render_page("ghost", Map::new()).await;
        assert_eq!(page.status, 404);
        assert_eq!(page.html, "<p>custom missing</p>");
    }

    #[tokio::test]
    async fn test_component_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("views/page.xhtml"), "<Widget/>");
        write_file(
            &dir.path().join("views/components/Widget.xhtml"),
            "<b>from components</b>",
        );
        write_file(
            &dir.path().join("views/Widget.xhtml"),
            "<b>from views</b>",
        );
        let engine = engine_at(dir.path());
        let out = engine.render("page", Map::new()).await.unwrap();
        assert_eq!(out.html, "<b>from components</b>");
    }

    #[tokio::test]
    async fn test_component_index_fallback() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("views/page.xhtml"), "<Panel/>");
        write_file(
            &dir.path().join("views/Panel/index.xhtml"),
            "<b>panel</b>",
        );
        let engine = engine_at(dir.path());
        let out = engine.render("page", Map::new()).await.unwrap();
        assert_eq!(out.html, "<b>panel</b>");
    }

    #[tokio::test]
    async fn test_missing_component_renders_empty() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("views/page.xhtml"), "a<Ghost/>b");
        let engine = engine_at(dir.path());
        let out = engine.render("page", Map::new()).await.unwrap();
        assert_eq!(out.html, "ab");
        assert!(out.diagnostics.iter().any(|d| d.code == "missing_component"));
    }

    #[tokio::test]
    async fn test_component_body_slot() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            &dir.path().join("views/page.xhtml"),
            "<Card title=\"T\">inner</Card>",
        );
        write_file(
            &dir.path().join("views/components/Card.xhtml"),
            "<div><h2>{{title}}</h2>{{{body}}}</div>",
        );
        let engine = engine_at(dir.path());
        let out = engine.render("page", Map::new()).await.unwrap();
        assert_eq!(out.html, "<div><h2>T</h2>inner</div>");
    }

    #[tokio::test]
    async fn test_layout_from_context() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("views/page.xhtml"), "<p>content</p>");
        write_file(
            &dir.path().join("views/layout.xhtml"),
            "<html><head><title>{{title}}</title></head><body>{{{body}}}</body></html>",
        );
        let engine = engine_at(dir.path());
        let out = engine
            .render(
                "page",
                ctx_of(json!({"layout": "layout", "title": "L"})),
            )
            .await
            .unwrap();
        assert_eq!(
            out.html,
            "<html><head><title>L</title></head><body><p>content</p></body></html>"
        );
    }

    #[tokio::test]
    async fn test_layout_without_slot_merges_into_main() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("views/page.xhtml"), "<p>x</p>");
        write_file(
            &dir.path().join("views/shell.xhtml"),
            "<header>h</header><main></main><footer>f</footer>",
        );
        let engine = Engine::new(Options {
            root: dir.path().to_path_buf(),
            layout: Some("shell".to_string()),
            ..Options::default()
        });
        let out = engine.render("page", Map::new()).await.unwrap();
        assert_eq!(
            out.html,
            "<header>h</header><main><p>x</p></main><footer>f</footer>"
        );
    }

    #[tokio::test]
    async fn test_precompile_and_has_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("views/warm.xhtml"), "<p>w</p>");
        let engine = engine_at(dir.path());
        let ctx = Map::new();
        assert!(!engine.has_cache("warm", &ctx));
        engine.precompile("warm", ctx.clone()).await.unwrap();
        assert!(engine.has_cache("warm", &ctx));
    }

    #[tokio::test]
    async fn test_file_change_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("views/live.xhtml");
        write_file(&path, "<p>v1</p>");
        let engine = engine_at(dir.path());
        let out = engine.render("live", Map::new()).await.unwrap();
        assert_eq!(out.html, "<p>v1</p>");

        write_file(&path, "<p>v2</p>");
        engine.invalidate(&path);
        let out = engine.render("live", Map::new()).await.unwrap();
        assert_eq!(out.html, "<p>v2</p>");
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_distinctly() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("views/slow.xhtml"), "<p>s</p>");
        let engine = engine_at(dir.path());
        let err = engine
            .render("slow", ctx_of(json!({"timeout": 0})))
            .await
            .unwrap_err();
        assert_eq!(err, RenderError::Timeout);
    }

    #[tokio::test]
    async fn test_custom_tag_function() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("views/page.xhtml"), "<_shout/>");
        let engine = engine_at(dir.path());

        fn shout(
            _: &plume_core::Invocation,
            _: &Map<String, Value>,
        ) -> plume_core::TagOutput {
            plume_core::TagOutput::Html("LOUD".to_string())
        }
        assert!(engine.register_tag_function(&["shout"], Binding::Direct(shout)));
        // Re-registering the same name is ignored.
        assert!(!engine.register_tag_function(&["shout"], Binding::Direct(shout)));

        let out = engine.render("page", Map::new()).await.unwrap();
        assert_eq!(out.html, "LOUD");
    }

    #[tokio::test]
    async fn test_before_and_after_hooks() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("views/page.xhtml"), "<p>{{who}}</p>");
        let engine = engine_at(dir.path());
        engine.on_before(Arc::new(|ctx| {
            ctx.insert("who".to_string(), Value::String("hook".to_string()));
        }));
        engine.on_after(Arc::new(|_, out| {
            out.html.push_str("<!-- after -->");
        }));
        let out = engine.render("page", Map::new()).await.unwrap();
        assert_eq!(out.html, "<p>hook</p><!-- after -->");
    }

    #[tokio::test]
    async fn test_public_context_injection() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            &dir.path().join("views/page.xhtml"),
            "<html><head></head><body></body></html>",
        );
        let engine = engine_at(dir.path());
        let ctx = ctx_of(json!({
            "public": {
                "js": {"site-name": "plume"},
                "css": {"accent": "#f00"},
            },
            "hidden": "secret",
        }));
        let out = engine.render("page", ctx).await.unwrap();
        assert!(out.html.contains("const site_name=\"plume\";"));
        assert!(out.html.contains("--accent:#f00;"));
        assert!(out.html.find("</head>").unwrap() > out.html.find("const").unwrap());
        assert!(!out.html.contains("secret"));
    }

    #[tokio::test]
    async fn test_insecure_mode_exposes_context() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("views/page.xhtml"), "<p>x</p>");
        let engine = Engine::new(Options {
            root: dir.path().to_path_buf(),
            secure: false,
            ..Options::default()
        });
        let out = engine
            .render("page", ctx_of(json!({"who": "me"})))
            .await
            .unwrap();
        assert!(out.html.contains("PLUME_CTX"));
        assert!(out.html.contains("\"who\":\"me\""));
    }

    #[tokio::test]
    async fn test_lazy_fragment_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("views")).unwrap();
        let engine = engine_at(dir.path());
        let token = engine.stash_fragment("<p>deferred</p>".to_string());
        assert_eq!(engine.take_fragment(&token).as_deref(), Some("<p>deferred</p>"));
        assert_eq!(engine.take_fragment(&token), None);
    }
}
