//! Placeholder/pipeline log formatter (spec.md §4.8), implemented as a
//! `tracing_subscriber::Layer` so every `tracing::info!`/`warn!`/etc. call
//! anywhere in the crate flows through the same rendering path the teacher's
//! `event/log.rs` gave the event log, generalized from event-sourcing
//! storage to byte-exact text rendering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use camino::Utf8Path;
use chrono::Local;
use colored::{Color, Colorize};
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Bare,
    Pretty,
    Json,
    KeyValue,
}

impl Preset {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bare" => Some(Self::Bare),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            "key-value" => Some(Self::KeyValue),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct FieldVisitor {
    message: String,
    fields: HashMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        let rendered = rendered.trim_matches('"').to_string();
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.insert(field.name().to_string(), rendered);
        }
    }
}

pub struct LogRecord {
    pub level: Level,
    pub message: String,
    pub fields: HashMap<String, String>,
}

impl LogRecord {
    fn field(&self, key: &str) -> &str {
        self.fields.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Rotating color palette, one entry sticky per `prefix` value so the same
/// unit always renders in the same color within a run.
struct PrefixPalette {
    assigned: Mutex<HashMap<String, Color>>,
    palette: &'static [Color],
}

impl PrefixPalette {
    fn new() -> Self {
        Self {
            assigned: Mutex::new(HashMap::new()),
            palette: &[
                Color::Cyan,
                Color::Magenta,
                Color::Yellow,
                Color::Green,
                Color::Blue,
                Color::Red,
            ],
        }
    }

    fn color_for(&self, prefix: &str) -> Color {
        let mut assigned = self.assigned.lock().unwrap();
        let next_index = assigned.len();
        *assigned
            .entry(prefix.to_string())
            .or_insert_with(|| self.palette[next_index % self.palette.len()])
    }
}

/// Caches `prefix` (absolute unit path) -> path relative to `base_dir`, so
/// repeated emissions from the same unit don't re-walk path components.
/// Per spec.md §4.8, attaching the cache must happen before the first
/// emission for it to take effect; later attachment is a no-op for records
/// already rendered.
pub struct RelativePathCache {
    base_dir: camino::Utf8PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl RelativePathCache {
    pub fn new(base_dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn relative(&self, prefix: &str) -> String {
        if let Some(hit) = self.cache.lock().unwrap().get(prefix) {
            return hit.clone();
        }
        let rel = Utf8Path::new(prefix)
            .strip_prefix(&self.base_dir)
            .map(|p| p.to_string())
            .unwrap_or_else(|_| prefix.to_string());
        self.cache.lock().unwrap().insert(prefix.to_string(), rel.clone());
        rel
    }
}

pub struct StratumLogLayer {
    preset: Preset,
    colors_enabled: bool,
    palette: PrefixPalette,
    relative_cache: Option<Arc<RelativePathCache>>,
}

impl StratumLogLayer {
    pub fn new(preset: Preset, colors_enabled: bool) -> Self {
        Self {
            preset,
            colors_enabled,
            palette: PrefixPalette::new(),
            relative_cache: None,
        }
    }

    /// Must be called before the first emission for the cache to be used
    /// (spec.md §4.8); later calls replace the cache but already-rendered
    /// records are unaffected.
    pub fn with_relative_path_cache(mut self, cache: Arc<RelativePathCache>) -> Self {
        self.relative_cache = Some(cache);
        self
    }

    fn rel_module_path(&self, record: &LogRecord) -> String {
        let prefix = record.field("prefix");
        if prefix.is_empty() {
            return String::new();
        }
        match &self.relative_cache {
            Some(cache) => cache.relative(prefix),
            None => prefix.to_string(),
        }
    }

    fn colorize_prefix(&self, rel: &str) -> String {
        if rel.is_empty() || !self.colors_enabled {
            return rel.to_string();
        }
        rel.color(self.palette.color_for(rel)).to_string()
    }

    pub fn render(&self, record: &LogRecord) -> String {
        let rel = self.rel_module_path(record);
        let colored_rel = self.colorize_prefix(&rel);
        let tfpath = record.field("tfpath");
        let now = Local::now();

        match self.preset {
            Preset::Bare => format!(
                "{} [{}] {}  prefix=[{}]",
                level_str(record.level),
                now.format("%H:%M:%S"),
                record.message,
                colored_rel
            ),
            Preset::Pretty => format!(
                "{} {}  [{}] {}: {}",
                now.format("%H:%M:%S%.3f"),
                level_str(record.level),
                colored_rel,
                tfpath,
                record.message
            ),
            Preset::Json => {
                let obj = serde_json::json!({
                    "time": now.to_rfc3339(),
                    "level": level_str(record.level),
                    "prefix": rel,
                    "tfpath": tfpath,
                    "msg": record.message,
                });
                obj.to_string()
            }
            Preset::KeyValue => format!(
                "time={} level={} prefix={} tfpath={} msg={}",
                now.to_rfc3339(),
                level_str(record.level),
                rel,
                tfpath,
                record.message
            ),
        }
    }
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

impl<S: Subscriber> Layer<S> for StratumLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let record = LogRecord {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        };
        println!("{}", self.render(&record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(level: Level, message: &str, prefix: &str, tfpath: &str) -> LogRecord {
        let mut fields = HashMap::new();
        fields.insert("prefix".to_string(), prefix.to_string());
        fields.insert("tfpath".to_string(), tfpath.to_string());
        LogRecord {
            level,
            message: message.to_string(),
            fields,
        }
    }

    #[test]
    fn bare_preset_has_expected_shape() {
        let layer = StratumLogLayer::new(Preset::Bare, false);
        let rendered = layer.render(&record(Level::INFO, "applying", "/units/vpc", "tofu"));
        assert!(rendered.starts_with("info ["));
        assert!(rendered.contains("applying"));
        assert!(rendered.contains("prefix=[/units/vpc]"));
    }

    #[test]
    fn json_preset_is_valid_json_with_expected_keys() {
        let layer = StratumLogLayer::new(Preset::Json, false);
        let rendered = layer.render(&record(Level::ERROR, "boom", "/units/eks", "terraform"));
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["level"], "error");
        assert_eq!(parsed["msg"], "boom");
        assert_eq!(parsed["tfpath"], "terraform");
    }

    #[test]
    fn key_value_preset_has_expected_keys() {
        let layer = StratumLogLayer::new(Preset::KeyValue, false);
        let rendered = layer.render(&record(Level::WARN, "retrying", "/units/rds", "tofu"));
        assert!(rendered.contains("level=warn"));
        assert!(rendered.contains("msg=retrying"));
    }

    #[test]
    fn relative_path_cache_strips_base_dir() {
        let cache = Arc::new(RelativePathCache::new("/units"));
        let layer = StratumLogLayer::new(Preset::Bare, false).with_relative_path_cache(cache);
        let rendered = layer.render(&record(Level::INFO, "x", "/units/vpc", "tofu"));
        assert!(rendered.contains("prefix=[vpc]"));
    }

    #[test]
    fn same_prefix_gets_stable_color_across_calls() {
        let palette = PrefixPalette::new();
        let a = palette.color_for("/units/vpc");
        let b = palette.color_for("/units/vpc");
        assert_eq!(a, b);
    }

    #[test]
    fn preset_parses_known_names_only() {
        assert_eq!(Preset::parse("pretty"), Some(Preset::Pretty));
        assert_eq!(Preset::parse("xml"), None);
    }
}
