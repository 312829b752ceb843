//! [`CheckLogLayer`] – routes tracing events raised inside a check's span
//! to that check's log file.
//!
//! The scheduler opens a [`CHECK_SPAN`] span per check with the log path in
//! its `log` field.  Workers, pumps and monitors started by the check run
//! in the same span, so dropped frames, malformed commands and teardown
//! warnings are attributed to the right plugin even when many suites run
//! at once.

use std::fmt::{self, Write as _};
use std::path::PathBuf;

use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::scheduler::{CHECK_SPAN, CheckLog};

const LOG_FIELD: &str = "log";

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckLogLayer;

impl<S> Layer<S> for CheckLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != CHECK_SPAN {
            return;
        }
        let mut path = LogPath::default();
        attrs.record(&mut path);
        let (Some(path), Some(span)) = (path.0, ctx.span(id)) else {
            return;
        };
        if let Ok(log) = CheckLog::append(PathBuf::from(path)) {
            span.extensions_mut().insert(log);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        for span in scope {
            let extensions = span.extensions();
            let Some(log) = extensions.get::<CheckLog>() else {
                continue;
            };
            let mut text = EventText::default();
            event.record(&mut text);
            let meta = event.metadata();
            // Nowhere to report a failed write from inside the subscriber.
            log.write_line(&format!(
                "{} {}: {}{}",
                meta.level(),
                meta.target(),
                text.message,
                text.fields
            ))
            .ok();
            return;
        }
    }
}

#[derive(Default)]
struct LogPath(Option<String>);

impl Visit for LogPath {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == LOG_FIELD {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == LOG_FIELD {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

#[derive(Default)]
struct EventText {
    message: String,
    fields: String,
}

impl Visit for EventText {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            write!(self.fields, " {}={value}", field.name()).ok();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            write!(self.message, "{value:?}").ok();
        } else {
            write!(self.fields, " {}={value:?}", field.name()).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{CheckContext, CheckFailure, ComplianceCheck, Scheduler, Suite, TestMeta};
    use async_trait::async_trait;
    use robohub_kernel::PluginManifest;
    use std::fs;
    use tracing::Instrument;
    use tracing_subscriber::layer::SubscriberExt;

    struct Chatty(&'static str);

    #[async_trait]
    impl ComplianceCheck for Chatty {
        fn meta(&self) -> TestMeta {
            TestMeta::new(self.0, "emits events")
        }

        async fn run(&self, _ctx: &CheckContext) -> Result<(), CheckFailure> {
            tracing::warn!(check = self.0, frame = "garbage", "dropped serial frame");
            let name = self.0;
            tokio::spawn(
                async move { tracing::info!("helper task for {name}") }.in_current_span(),
            )
            .await
            .map_err(|e| CheckFailure::Assertion(e.to_string()))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_inside_a_check_reach_its_log_only() {
        let _default = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(CheckLogLayer),
        );
        let logs = tempfile::tempdir().unwrap();
        let mut suite = Suite::new();
        suite.register(Chatty("first")).unwrap().register(Chatty("second")).unwrap();
        let manifest = PluginManifest {
            module_id: "sample".into(),
            dir: logs.path().join("sample"),
            author: "Ada".into(),
            title: "Sample".into(),
        };

        let report = Scheduler::new(suite, logs.path()).run(&manifest).await.unwrap();
        assert!(report.all_passed());
        tracing::info!("outside every check");

        let first = fs::read_to_string(logs.path().join("sample").join("first.log")).unwrap();
        assert!(first.contains("WARN"));
        assert!(first.contains("dropped serial frame"));
        assert!(first.contains("frame=garbage"));
        assert!(first.contains("helper task for first"));
        assert!(!first.contains("second"));
        assert!(first.contains("PASSED"));

        let second = fs::read_to_string(logs.path().join("sample").join("second.log")).unwrap();
        assert!(second.contains("helper task for second"));
        assert!(!second.contains("helper task for first"));
        assert!(!second.contains("outside every check"));
    }
}
