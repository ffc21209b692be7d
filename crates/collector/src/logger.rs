// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector log lines.
//!
//! Every line names the component that emitted it, taken from the first
//! module of the event target, followed by the fields of the enclosing spans:
//!
//! ```text
//! COLLECTOR | INFO | accumulator | Accumulator started for metric bk_apm_count (count)
//! COLLECTOR | WARN | pipeline | [processor=traces_deriver/duration] Processor failed on traces record
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

/// First module below the crate root, the crate itself for root events.
fn component(target: &str) -> &str {
    let mut parts = target.split("::");
    let root = parts.next().unwrap_or(target);
    parts.next().unwrap_or(root)
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            writer,
            "COLLECTOR | {} | {} | ",
            metadata.level(),
            component(metadata.target())
        )?;

        // span names carry no information here, only their fields do
        let mut scope_fields = Vec::new();
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                if let Some(fields) = span.extensions().get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        scope_fields.push(fields.fields.clone());
                    }
                }
            }
        }
        if !scope_fields.is_empty() {
            write!(writer, "[{}] ", scope_fields.join(" "))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture(f: impl FnOnce()) -> String {
        let buffer = Buffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(buffer.clone())
            .with_ansi(false)
            .event_format(Formatter)
            .finish();
        {
            let _guard = subscriber.set_default();
            f();
        }
        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_component() {
        assert_eq!(component("traces_deriver::accumulator::recorder"), "accumulator");
        assert_eq!(component("collector::pipeline"), "pipeline");
        assert_eq!(component("collector"), "collector");
    }

    #[test]
    fn test_line_names_component() {
        let out = capture(|| {
            tracing::info!(
                target: "traces_deriver::serieslimiter",
                data_id = 7,
                "Series limiter created recorder"
            );
        });
        assert_eq!(
            out,
            "COLLECTOR | INFO | serieslimiter | Series limiter created recorder data_id=7\n"
        );
    }

    #[test]
    fn test_line_carries_span_fields() {
        let out = capture(|| {
            let span = tracing::info_span!("processor", processor = %"traces_deriver/duration");
            let _entered = span.enter();
            tracing::warn!(target: "collector::pipeline", "Processor failed");
        });
        assert_eq!(
            out,
            "COLLECTOR | WARN | pipeline | [processor=traces_deriver/duration] Processor failed\n"
        );
    }
}
