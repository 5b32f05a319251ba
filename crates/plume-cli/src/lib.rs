//! Command line interface for the plume view engine.
//!
//! `plume render <view>` compiles and renders a view against a JSON data
//! file; `plume precompile <view>` warms the cache and exits. Render mode
//! can keep watching the views tree and re-render on change.

use plume_engine::{Engine, Options, Page};
use serde_json::{Map, Value};
use std::env;
use std::fs;
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
enum CliCommand {
    Render {
        view: String,
        common: CommonArgs,
        watch: bool,
        out: Option<PathBuf>,
    },
    Precompile {
        view: String,
        common: CommonArgs,
    },
    Help,
}

#[derive(Debug, Clone, Default)]
struct CommonArgs {
    root: Option<PathBuf>,
    views: Option<String>,
    components: Option<String>,
    ext: Option<String>,
    layout: Option<String>,
    timeout: Option<String>,
    data: Option<PathBuf>,
    debug: bool,
}

impl CommonArgs {
    fn into_options(self) -> Options {
        let mut options = Options::default();
        if let Some(root) = self.root {
            options.root = root;
        }
        if let Some(views) = self.views {
            options.views = views;
        }
        if let Some(components) = self.components {
            options.components = components;
        }
        if let Some(ext) = self.ext {
            options.ext = ext;
        }
        if let Some(timeout) = self.timeout {
            options.timeout = timeout;
        }
        options.layout = self.layout;
        options.debug = self.debug;
        options
    }
}

pub async fn run() -> Result<(), String> {
    match parse_args(env::args().skip(1))? {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Precompile { view, common } => {
            let data = load_data(common.data.clone())?;
            let engine = Engine::new(common.into_options());
            engine
                .precompile(&view, data)
                .await
                .map_err(|e| e.to_string())?;
            println!("precompiled {view}");
            Ok(())
        }
        CliCommand::Render {
            view,
            common,
            watch,
            out,
        } => {
            let data = load_data(common.data.clone())?;
            let engine = Engine::new(common.into_options());
            if watch {
                render_watch(&engine, &view, data).await
            } else {
                let page = engine.render_page(&view, data).await;
                emit(&page, out.as_deref())
            }
        }
    }
}

async fn render_watch(
    engine: &Engine,
    view: &str,
    data: Map<String, Value>,
) -> Result<(), String> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _invalidate = engine.watch()?;
    let views_root = engine.options().root.join(&engine.options().views);
    let _trigger = plume_engine::watch::watch_invalidate(&views_root, move |_| {
        tx.send(()).ok();
    })?;

    println!("[watch] watching {}", views_root.display());
    loop {
        let page = engine.render_page(view, data.clone()).await;
        emit(&page, None)?;

        if rx.recv().await.is_none() {
            return Ok(());
        }
        // Editors fire bursts of events; settle before re-rendering.
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        while rx.try_recv().is_ok() {}
        println!("[watch] change detected");
    }
}

fn emit(page: &Page, out: Option<&std::path::Path>) -> Result<(), String> {
    if page.status != 200 {
        eprintln!("[render] status {}", page.status);
    }
    match out {
        Some(path) => {
            fs::write(path, &page.html)
                .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
            println!("wrote {}", path.display());
        }
        None => println!("{}", page.html),
    }
    Ok(())
}

fn load_data(path: Option<PathBuf>) -> Result<Map<String, Value>, String> {
    let Some(path) = path else {
        return Ok(Map::new());
    };
    let text = fs::read_to_string(&path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    match serde_json::from_str(&text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(format!("{} must contain a JSON object", path.display())),
        Err(e) => Err(format!("invalid JSON in {}: {e}", path.display())),
    }
}

fn parse_args<I>(args: I) -> Result<CliCommand, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let Some(command) = args.next() else {
        return Ok(CliCommand::Help);
    };

    if matches!(command.as_str(), "help" | "--help" | "-h") {
        return Ok(CliCommand::Help);
    }

    let mut view: Option<String> = None;
    let mut common = CommonArgs::default();
    let mut watch = false;
    let mut out: Option<PathBuf> = None;

    let mut next_value = |args: &mut dyn Iterator<Item = String>, flag: &str| {
        args.next().ok_or_else(|| format!("{flag} expects a value"))
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--root" => common.root = Some(PathBuf::from(next_value(&mut args, "--root")?)),
            "--views" => common.views = Some(next_value(&mut args, "--views")?),
            "--components" => {
                common.components = Some(next_value(&mut args, "--components")?)
            }
            "--ext" => common.ext = Some(next_value(&mut args, "--ext")?),
            "--layout" => common.layout = Some(next_value(&mut args, "--layout")?),
            "--timeout" => common.timeout = Some(next_value(&mut args, "--timeout")?),
            "--data" => common.data = Some(PathBuf::from(next_value(&mut args, "--data")?)),
            "--out" => out = Some(PathBuf::from(next_value(&mut args, "--out")?)),
            "--watch" => watch = true,
            "--debug" => common.debug = true,
            other if other.starts_with('-') => {
                return Err(format!("unknown flag {other}"));
            }
            other if view.is_none() => view = Some(other.to_string()),
            other => return Err(format!("unexpected argument {other}")),
        }
    }

    let need_view = |view: Option<String>| view.ok_or_else(|| "missing view name".to_string());
    match command.as_str() {
        "render" => Ok(CliCommand::Render {
            view: need_view(view)?,
            common,
            watch,
            out,
        }),
        "precompile" | "pre" => Ok(CliCommand::Precompile {
            view: need_view(view)?,
            common,
        }),
        other => Err(format!("unknown command {other}")),
    }
}

fn print_help() {
    println!("plume - tag template view engine");
    println!();
    println!("Usage:");
    println!("  plume render <view> [options]      render a view to stdout");
    println!("  plume precompile <view> [options]  warm the compile cache");
    println!();
    println!("Options:");
    println!("  --root <dir>        base directory (default .)");
    println!("  --views <dir>       views directory (default views)");
    println!("  --components <dir>  components directory (default components)");
    println!("  --ext <ext>         template extension (default xhtml)");
    println!("  --layout <name>     layout template name");
    println!("  --timeout <dur>     render budget, e.g. 30s or 500ms");
    println!("  --data <file.json>  request context data");
    println!("  --out <file>        write output to a file");
    println!("  --watch             re-render when the views tree changes");
    println!("  --debug             include failure detail in error pages");
}
