use log::kv::{self, Key, Value, Visitor};

use log::{Log, Metadata, Record, SetLoggerError};

use once_cell::sync::OnceCell;

use serde::{Deserialize, Serialize};

use serde_json::json;

use std::cell::RefCell;

use std::collections::HashMap;

// --- Thread-local tenant ID storage ---

thread_local! {

    static CURRENT_TENANT_ID: RefCell<Option<String>> = RefCell::new(None);

}

/// Sets the current tenant ID for the calling thread.

pub fn set_current_tenant_id(tenant_id: String) {
    CURRENT_TENANT_ID.with(|id_cell| {
        *id_cell.borrow_mut() = Some(tenant_id);
    });
}

/// Clears the current tenant ID for the calling thread.

pub fn clear_current_tenant_id() {
    CURRENT_TENANT_ID.with(|id_cell| {
        *id_cell.borrow_mut() = None;
    });
}

// --- Log Record Structure for JSON output ---

#[derive(Debug, Serialize, Deserialize)]

pub struct JsonLogRecord {
    pub timestamp: String,

    pub level: String,

    pub message: String,

    pub tenant_id: Option<String>,

    pub name: String,

    pub module_path: Option<String>,

    pub file: Option<String>,

    pub line: Option<u32>,

    #[serde(flatten)] // Flatten to include extra fields directly
    pub extra: HashMap<String, serde_json::Value>,
}

// --- Custom Logger Implementation ---

struct JsonLogger;

/// Helper to collect key-value pairs from `log::kv::Source`

struct KeyValueCollector<'a>(&'a mut HashMap<String, serde_json::Value>);

impl<'a> Visitor<'a> for KeyValueCollector<'a> {
    fn visit_pair(&mut self, key: Key<'a>, value: Value<'a>) -> Result<(), kv::Error> {
        self.0
            .insert(key.as_str().to_string(), json!(value.to_string()));

        Ok(())
    }
}

impl Log for JsonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let tenant_id = CURRENT_TENANT_ID.with(|id_cell| id_cell.borrow().clone());

        let mut extra_fields = HashMap::new();

        let mut collector = KeyValueCollector(&mut extra_fields);

        if let Err(e) = record.key_values().visit(&mut collector) {
            eprintln!("Error visiting key-value pairs: {:?}", e);
        }

        let log_record = JsonLogRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),

            level: record.level().to_string(),

            message: format!("{}", record.args()),

            tenant_id,

            name: record.target().to_string(),

            module_path: record.module_path().map(|s| s.to_string()),

            file: record.file().map(|s| s.to_string()),

            line: record.line(),

            extra: extra_fields,
        };

        println!(
            "{}",
            serde_json::to_string(&log_record).expect("Failed to serialize log record to JSON")
        );
    }

    fn flush(&self) {}
}

static LOGGER: JsonLogger = JsonLogger;

static INIT_LOGGER_ONCE: OnceCell<()> = OnceCell::new();

/// Initializes the custom JSON logger. This function should be called once at the start of the application.

pub fn init_logger() -> Result<(), SetLoggerError> {
    INIT_LOGGER_ONCE
        .get_or_try_init(|| {
            log::set_logger(&LOGGER)?;

            log::set_max_level(level_from_env());

            Ok(())
        })
        .map(|_| ())
}

fn level_from_env() -> log::LevelFilter {
    match std::env::var("LOG_LEVEL").as_deref() {
        Ok("trace") => log::LevelFilter::Trace,
        Ok("debug") => log::LevelFilter::Debug,
        Ok("warn") => log::LevelFilter::Warn,
        Ok("error") => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

/// Logs a pipeline-level event.

pub fn log_pipeline_event(job_type: &str, event_type: &str, details: &serde_json::Value) {
    let details_str = details.to_string();

    log::info!(

        target: job_type,

        event_type = event_type,

        details = details_str.as_str();

        "Pipeline Event"

    );
}
