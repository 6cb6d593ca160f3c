//! Hot-reloadable configuration templates
//!
//! Named templates come from two feeds: `.tmpl` files in a watched
//! directory and swarm config objects tagged with the template label. Both
//! land on a bounded update queue that is drained, without blocking, at the
//! start of every render. A template that fails to compile is dropped from
//! the runnable set until new content for it compiles; sibling templates
//! are unaffected.
//!
//! Each template renders from scratch against one entity per pass. The
//! entity is exposed through a [`TemplateContext`]: `entitytype`,
//! `matcher`, and `labels` are plain values, `upstreams(...)` and
//! `hostname(...)` are callable. Rendered output parses into a Caddyfile
//! fragment and merges independently of its siblings.

use minijinja::value::{Rest, Value};
use minijinja::Environment;
use notify::{RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::caddyfile::Document;
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};

const TEMPLATE_SUFFIX: &str = ".tmpl";
const QUEUE_CAPACITY: usize = 20;

/// One pending `(name, text)` registry update
#[derive(Debug, Clone)]
pub struct TemplateUpdate {
    pub name: String,
    pub text: String,
}

/// An argument to the `upstreams` template function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamArg {
    /// String argument: prefixed as `<scheme>://`
    Scheme(String),
    /// Integer argument: suffixed as `:<port>`
    Port(i64),
}

/// The function contract templates render against
pub trait TemplateContext: Send + Sync {
    /// `"service"` or `"container"`
    fn entity_type(&self) -> &'static str;
    /// Raw display name, possibly with Docker's leading slash
    fn display_name(&self) -> &str;
    fn labels(&self) -> &HashMap<String, String>;
    /// Candidate proxy-target addresses, already resolved and filtered
    fn upstream_addrs(&self) -> &[String];

    /// Display name with any leading path separator stripped
    fn matcher(&self) -> &str {
        self.display_name().trim_start_matches('/')
    }

    /// A non-empty override wins, otherwise the matcher
    fn hostname(&self, explicit: Option<&str>) -> String {
        match explicit {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => self.matcher().to_string(),
        }
    }

    /// Space-joined upstream addresses with scheme/port args applied in order
    fn upstreams(&self, args: &[UpstreamArg]) -> String {
        let targets: Vec<String> = self
            .upstream_addrs()
            .iter()
            .map(|addr| {
                let mut target = addr.clone();
                for arg in args {
                    match arg {
                        UpstreamArg::Scheme(scheme) => {
                            target = format!("{}://{}", scheme, target);
                        }
                        UpstreamArg::Port(port) => {
                            target = format!("{}:{}", target, port);
                        }
                    }
                }
                target
            })
            .collect();
        targets.join(" ")
    }
}

/// Template view of a swarm service
pub struct ServiceContext {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub upstream_addrs: Vec<String>,
}

impl TemplateContext for ServiceContext {
    fn entity_type(&self) -> &'static str {
        "service"
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    fn upstream_addrs(&self) -> &[String] {
        &self.upstream_addrs
    }
}

/// Template view of a container
pub struct ContainerContext {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub upstream_addrs: Vec<String>,
}

impl TemplateContext for ContainerContext {
    fn entity_type(&self) -> &'static str {
        "container"
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    fn upstream_addrs(&self) -> &[String] {
        &self.upstream_addrs
    }
}

/// Shared registry of compiled named templates
pub struct TemplateEngine {
    env: Mutex<Environment<'static>>,
    queue_tx: mpsc::Sender<TemplateUpdate>,
    queue_rx: Mutex<mpsc::Receiver<TemplateUpdate>>,
    template_dir: PathBuf,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl TemplateEngine {
    pub fn new(template_dir: PathBuf) -> Self {
        let mut env = Environment::new();
        env.add_global("http", Value::from("http"));
        env.add_global("https", Value::from("https"));
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        TemplateEngine {
            env: Mutex::new(env),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            template_dir,
            watcher: Mutex::new(None),
        }
    }

    /// Queue new content for a named template; drained on the next render
    pub fn queue_template(&self, name: impl Into<String>, text: impl Into<String>) {
        let update = TemplateUpdate {
            name: name.into(),
            text: text.into(),
        };
        if let Err(err) = self.queue_tx.try_send(update) {
            warn!(error = %err, "template queue full, dropping update");
        }
    }

    /// Watch the template directory and queue its existing `.tmpl` files
    ///
    /// Lazy and idempotent: a no-op once the watcher exists, retried on the
    /// next pass while the directory is missing. Errors are non-fatal.
    pub fn ensure_watcher(&self) -> Result<()> {
        let mut guard = self.watcher.lock();
        if guard.is_some() {
            return Ok(());
        }

        let dir = self.template_dir.clone();
        let meta = std::fs::metadata(&dir)?;
        if !meta.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("{} is not a directory", dir.display()),
            )));
        }

        let tx = self.queue_tx.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            let event = match result {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "template watcher error");
                    return;
                }
            };
            for path in event.paths {
                if !is_template_file(&path) {
                    continue;
                }
                let name = path.display().to_string();
                let text = match std::fs::read_to_string(&path) {
                    Ok(text) => text,
                    // Deleted or unreadable: replace with a comment so the
                    // old content stops rendering
                    Err(_) => format!("## removed {} file\n\n", name),
                };
                if let Err(err) = tx.try_send(TemplateUpdate { name, text }) {
                    warn!(error = %err, "template queue full, dropping update");
                }
            }
        })
        .map_err(|err| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            ))
        })?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|err| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    err.to_string(),
                ))
            })?;

        // Pre-existing templates are loaded once at watcher setup
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !is_template_file(&path) {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    debug!(path = %path.display(), "found template file");
                    self.queue_template(path.display().to_string(), text);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable template file");
                }
            }
        }

        debug!(dir = %dir.display(), "watching template directory");
        *guard = Some(watcher);
        Ok(())
    }

    /// Apply all pending updates without waiting for new ones
    pub fn drain_queue(&self, diags: &mut Diagnostics) {
        let mut rx = self.queue_rx.lock();
        let mut env = self.env.lock();
        while let Ok(update) = rx.try_recv() {
            env.remove_template(&update.name);
            match env.add_template_owned(update.name.clone(), update.text) {
                Ok(()) => diags.debug(format!("compiled template {}", update.name)),
                Err(err) => diags.error(
                    Error::template(update.name, err.to_string()).to_string(),
                ),
            }
        }
    }

    /// Render every loaded template against one entity
    ///
    /// Each output parses into its own fragment; a render or parse failure
    /// skips only that template.
    pub fn render_all(&self, ctx: Arc<dyn TemplateContext>, diags: &mut Diagnostics) -> Document {
        self.drain_queue(diags);

        let env = self.env.lock();
        let render_ctx = render_context(&ctx);

        let mut merged = Document::new();
        for (name, template) in env.templates() {
            let rendered = match template.render(&render_ctx) {
                Ok(text) => text,
                Err(err) => {
                    diags.error(Error::template(name, err.to_string()).to_string());
                    continue;
                }
            };
            match Document::parse(rendered.as_bytes()) {
                Ok(fragment) => merged.merge(fragment),
                Err(err) => {
                    diags.error(Error::template(name, err.to_string()).to_string());
                }
            }
        }
        merged
    }

    /// Names of currently runnable templates (test visibility)
    pub fn template_names(&self) -> Vec<String> {
        self.env
            .lock()
            .templates()
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

fn is_template_file(path: &Path) -> bool {
    path.to_string_lossy().ends_with(TEMPLATE_SUFFIX)
}

/// Expose the context contract to the template runtime
fn render_context(ctx: &Arc<dyn TemplateContext>) -> Value {
    let upstreams_ctx = Arc::clone(ctx);
    let hostname_ctx = Arc::clone(ctx);

    minijinja::context! {
        entitytype => ctx.entity_type(),
        matcher => ctx.matcher(),
        labels => ctx.labels().clone(),
        upstreams => Value::from_function(
            move |args: Rest<Value>| -> std::result::Result<String, minijinja::Error> {
                let mut parsed = Vec::new();
                for value in args.iter() {
                    if let Some(scheme) = value.as_str() {
                        parsed.push(UpstreamArg::Scheme(scheme.to_string()));
                    } else if let Ok(port) = i64::try_from(value.clone()) {
                        parsed.push(UpstreamArg::Port(port));
                    } else {
                        return Err(minijinja::Error::new(
                            minijinja::ErrorKind::InvalidOperation,
                            "upstreams arguments must be schemes or ports",
                        ));
                    }
                }
                Ok(upstreams_ctx.upstreams(&parsed))
            },
        ),
        hostname => Value::from_function(
            move |args: Rest<Value>| -> std::result::Result<String, minijinja::Error> {
                let explicit = args.first().and_then(|value| value.as_str());
                Ok(hostname_ctx.hostname(explicit))
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container_ctx() -> Arc<dyn TemplateContext> {
        Arc::new(ContainerContext {
            name: "/web1".to_string(),
            labels: HashMap::from([("caddy.handle".to_string(), "/api".to_string())]),
            upstream_addrs: vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()],
        })
    }

    fn render_one(engine: &TemplateEngine, ctx: Arc<dyn TemplateContext>) -> String {
        let mut diags = Diagnostics::new();
        let doc = engine.render_all(ctx, &mut diags);
        String::from_utf8(doc.serialize()).unwrap()
    }

    #[test]
    fn test_matcher_strips_leading_slash() {
        let ctx = container_ctx();
        assert_eq!(ctx.matcher(), "web1");
    }

    #[test]
    fn test_hostname_prefers_non_empty_override() {
        let ctx = container_ctx();
        assert_eq!(ctx.hostname(Some("example.com")), "example.com");
        assert_eq!(ctx.hostname(Some("")), "web1");
        assert_eq!(ctx.hostname(None), "web1");
    }

    #[test]
    fn test_upstreams_applies_scheme_and_port() {
        let ctx = container_ctx();
        let joined = ctx.upstreams(&[
            UpstreamArg::Scheme("http".to_string()),
            UpstreamArg::Port(8080),
        ]);
        assert_eq!(joined, "http://10.0.0.2:8080 http://10.0.0.3:8080");
        assert_eq!(ctx.upstreams(&[]), "10.0.0.2 10.0.0.3");
    }

    #[test]
    fn test_rendered_template_becomes_fragment() {
        let engine = TemplateEngine::new(PathBuf::from("/nonexistent"));
        engine.queue_template(
            "site.tmpl",
            "{{ matcher }}.example.com {\n\treverse_proxy {{ upstreams(8080) }}\n}\n",
        );
        let rendered = render_one(&engine, container_ctx());
        assert!(rendered.contains("web1.example.com {"));
        assert!(rendered.contains("reverse_proxy 10.0.0.2:8080 10.0.0.3:8080"));
    }

    #[test]
    fn test_compile_failure_removes_only_that_template() {
        let engine = TemplateEngine::new(PathBuf::from("/nonexistent"));
        engine.queue_template("good.tmpl", "{{ matcher }}\n");
        engine.queue_template("bad.tmpl", "{% if %}broken\n");
        let mut diags = Diagnostics::new();
        engine.drain_queue(&mut diags);

        assert_eq!(engine.template_names(), vec!["good.tmpl"]);
        assert!(diags.as_text().contains("bad.tmpl"));

        // New content for the broken name brings it back
        engine.queue_template("bad.tmpl", "fixed\n");
        engine.drain_queue(&mut Diagnostics::new());
        let mut names = engine.template_names();
        names.sort();
        assert_eq!(names, vec!["bad.tmpl", "good.tmpl"]);
    }

    #[test]
    fn test_failing_template_skips_siblings_only() {
        let engine = TemplateEngine::new(PathBuf::from("/nonexistent"));
        engine.queue_template("ok.tmpl", "handle /ok\n");
        // Renders fine but produces unbalanced braces
        engine.queue_template("broken.tmpl", "site {\n");
        let mut diags = Diagnostics::new();
        let doc = engine.render_all(container_ctx(), &mut diags);
        let text = String::from_utf8(doc.serialize()).unwrap();
        assert!(text.contains("handle /ok"));
        assert!(diags.as_text().contains("broken.tmpl"));
    }

    #[test]
    fn test_watcher_setup_missing_dir_is_retryable() {
        let engine = TemplateEngine::new(PathBuf::from("/definitely/not/here"));
        assert!(engine.ensure_watcher().is_err());
        // Still no watcher; a later call retries rather than wedging
        assert!(engine.ensure_watcher().is_err());
    }

    #[test]
    fn test_watcher_setup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("site.tmpl"), "handle /tmpl\n").unwrap();
        let engine = TemplateEngine::new(dir.path().to_path_buf());
        engine.ensure_watcher().unwrap();
        engine.ensure_watcher().unwrap();

        let rendered = render_one(&engine, container_ctx());
        assert!(rendered.contains("handle /tmpl"));
    }
}
