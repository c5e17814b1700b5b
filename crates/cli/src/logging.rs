use crate::config::LoggingConfig;
use regex::Regex;
use std::io;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

const IPV4_PATTERN: &str = r"\b(?:\d{1,3}\.){3}\d{1,3}\b";
const IPV4_PLACEHOLDER: &str = "[scrubbed]";

struct RedactingWriter<W> {
    inner: W,
    patterns: Vec<(Regex, String)>,
}

impl<W: io::Write> io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let redacted = redact(&self.patterns, &text);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter {
    patterns: Vec<(Regex, String)>,
}

impl<'a> fmt::MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter<io::Stderr>;

    fn make_writer(&self) -> Self::Writer {
        RedactingWriter {
            inner: io::stderr(),
            patterns: self.patterns.clone(),
        }
    }
}

fn redact(patterns: &[(Regex, String)], text: &str) -> String {
    let mut out = text.to_string();
    for (re, replacement) in patterns {
        out = re.replace_all(&out, replacement.as_str()).into_owned();
    }
    out
}

fn redaction_patterns(config: &LoggingConfig) -> Vec<(Regex, String)> {
    let mut patterns = Vec::new();
    if config.redact_ip_addresses {
        if let Ok(re) = Regex::new(IPV4_PATTERN) {
            patterns.push((re, IPV4_PLACEHOLDER.to_string()));
        }
    }
    for p in &config.patterns {
        match Regex::new(&p.regex) {
            Ok(re) => patterns.push((re, p.placeholder.clone())),
            Err(e) => eprintln!("warning: ignoring redaction pattern {}: {}", p.name, e),
        }
    }
    patterns
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let make_writer = RedactingMakeWriter {
        patterns: redaction_patterns(config),
    };

    // boxed so both branches share a type
    let fmt_layer = if config.show_time {
        fmt::layer()
            .with_writer(make_writer)
            .with_target(config.show_target)
            .with_thread_names(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(make_writer)
            .with_target(config.show_target)
            .with_thread_names(true)
            .without_time()
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
