use std::collections::HashMap;

use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    Context,
};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// W3C Trace Context header names
pub const TRACEPARENT: &str = "traceparent";
pub const TRACESTATE: &str = "tracestate";

struct HeaderInjector<'a>(&'a mut HashMap<String, String>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

struct HeaderExtractor<'a>(&'a HashMap<String, String>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Write the current span's trace context into message headers.
///
/// A no-op until a propagator is registered by `init_telemetry`.
pub fn inject_current_context(headers: &mut HashMap<String, String>) {
    let ctx = Span::current().context();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderInjector(headers));
    });
}

/// Read a propagated trace context from message headers.
pub fn extract_context(headers: &HashMap<String, String>) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

/// Parent `span` to the trace carried in `headers`, if any.
pub fn set_parent_from_headers(span: &Span, headers: &HashMap<String, String>) {
    if headers.contains_key(TRACEPARENT) {
        span.set_parent(extract_context(headers));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_without_propagator_does_not_panic() {
        let mut headers = HashMap::new();
        inject_current_context(&mut headers);
    }

    #[test]
    fn test_extract_handles_empty_headers() {
        let _ctx = extract_context(&HashMap::new());
        set_parent_from_headers(&Span::none(), &HashMap::new());
    }

    #[test]
    fn test_extractor_reads_traceparent() {
        let headers = HashMap::from([(
            TRACEPARENT.to_string(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
        )]);

        let extractor = HeaderExtractor(&headers);
        assert!(extractor.get(TRACEPARENT).unwrap().starts_with("00-"));
        assert_eq!(extractor.keys(), vec![TRACEPARENT]);
    }
}
