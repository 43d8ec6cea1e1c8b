use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use countersign_core::config::{AppConfig, LoadOptions, LogFormat};
use toml::Value;

struct FieldSpec<'a> {
    key_path: &'a str,
    env_keys: &'a [&'a str],
    value: String,
}

pub fn run(options: LoadOptions) -> String {
    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let fields = [
        FieldSpec {
            key_path: "database.url",
            env_keys: &["COUNTERSIGN_DATABASE_URL"],
            value: config.database.url.clone(),
        },
        FieldSpec {
            key_path: "database.max_connections",
            env_keys: &["COUNTERSIGN_DATABASE_MAX_CONNECTIONS"],
            value: config.database.max_connections.to_string(),
        },
        FieldSpec {
            key_path: "database.timeout_secs",
            env_keys: &["COUNTERSIGN_DATABASE_TIMEOUT_SECS"],
            value: config.database.timeout_secs.to_string(),
        },
        FieldSpec {
            key_path: "logging.level",
            env_keys: &["COUNTERSIGN_LOGGING_LEVEL", "COUNTERSIGN_LOG_LEVEL"],
            value: config.logging.level.clone(),
        },
        FieldSpec {
            key_path: "logging.format",
            env_keys: &["COUNTERSIGN_LOGGING_FORMAT", "COUNTERSIGN_LOG_FORMAT"],
            value: render_format(config.logging.format).to_string(),
        },
        FieldSpec {
            key_path: "workflow.default_page_size",
            env_keys: &["COUNTERSIGN_WORKFLOW_DEFAULT_PAGE_SIZE"],
            value: config.workflow.default_page_size.to_string(),
        },
        FieldSpec {
            key_path: "workflow.max_page_size",
            env_keys: &["COUNTERSIGN_WORKFLOW_MAX_PAGE_SIZE"],
            value: config.workflow.max_page_size.to_string(),
        },
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in &fields {
        let source = field_source(
            field.key_path,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key_path, &field.value, source));
    }

    lines.join("\n")
}

fn render_format(format: LogFormat) -> &'static str {
    match format {
        LogFormat::Compact => "compact",
        LogFormat::Pretty => "pretty",
        LogFormat::Json => "json",
    }
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    [PathBuf::from("countersign.toml"), PathBuf::from("config/countersign.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    let env_key = env_keys
        .iter()
        .find(|key| env::var(key).is_ok_and(|value| !value.trim().is_empty()));
    if let Some(env_key) = env_key {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, field_source};

    #[test]
    fn file_source_is_reported_for_present_keys() {
        let doc: Value = "[workflow]\nmax_page_size = 50\n".parse().expect("toml");

        assert!(contains_path(&doc, "workflow.max_page_size"));
        assert!(!contains_path(&doc, "workflow.default_page_size"));
        assert_eq!(
            field_source("workflow.max_page_size", &["COUNTERSIGN_TEST_NEVER_SET"], Some(&doc), None),
            "file (config file)"
        );
        assert_eq!(
            field_source("database.url", &["COUNTERSIGN_TEST_NEVER_SET"], Some(&doc), None),
            "default"
        );
    }
}
