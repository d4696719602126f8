//! Payload dispatch
//!
//! Walks a decoded message tree depth-first and routes every leaf to the
//! handler registered for its content type, falling back to the type its
//! body marker implies. Every handler sees `begin` before the first part
//! and `end` after the last, including handlers registered mid-walk.
//! A failing handler costs only the part it was handling.

use tracing::{debug, info, warn};

use super::mime::{Node, Part};
use super::types::ContentType;
use crate::InitError;
use crate::handlers::{HandlerContext, HandlerRegistry};

/// Hook name recorded for failures in `begin`
pub const BEGIN: &str = "__begin__";
/// Hook name recorded for failures in `end`
pub const END: &str = "__end__";

/// One failed handler call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: String,
    /// Content type of the part, or [`BEGIN`]/[`END`]
    pub hook: String,
    pub filename: Option<String>,
    pub message: String,
}

/// Result of one dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Parts handed to a handler
    pub dispatched: usize,
    /// Parts no handler claimed
    pub dropped: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    /// Whether every handler call succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, handler: &str, hook: &str, filename: Option<&str>, error: InitError) {
        let message = match error {
            InitError::HandlerFailed { message, .. } => message,
            other => other.to_string(),
        };
        warn!("Handler {} failed in {}: {}", handler, hook, message);
        self.failures.push(HandlerFailure {
            handler: handler.to_string(),
            hook: hook.to_string(),
            filename: filename.map(str::to_string),
            message,
        });
    }
}

/// Decode raw user-data and dispatch it
pub async fn dispatch_payload(
    raw: &[u8],
    registry: &mut HandlerRegistry,
    ctx: &mut HandlerContext,
) -> Result<DispatchReport, InitError> {
    let root = super::decode_userdata(raw)?;
    Ok(dispatch(&root, registry, ctx).await)
}

/// Dispatch every leaf of `root` in document order
pub async fn dispatch(
    root: &Node,
    registry: &mut HandlerRegistry,
    ctx: &mut HandlerContext,
) -> DispatchReport {
    let mut report = DispatchReport::default();

    for idx in 0..registry.len() {
        begin(registry, idx, ctx, &mut report).await;
    }

    for part in root.parts() {
        dispatch_part(part, registry, ctx, &mut report).await;

        for registration in ctx.take_registrations() {
            let idx = registry.register(&registration.content_types, registration.handler);
            begin(registry, idx, ctx, &mut report).await;
        }
    }

    for idx in 0..registry.len() {
        let Some(handler) = registry.get_mut(idx) else {
            continue;
        };
        if let Err(e) = handler.end(ctx).await {
            report.record(handler.name(), END, None, e);
        }
    }

    info!(
        "Dispatched {} part(s), dropped {}, {} failure(s)",
        report.dispatched,
        report.dropped,
        report.failures.len()
    );
    report
}

async fn begin(
    registry: &mut HandlerRegistry,
    idx: usize,
    ctx: &mut HandlerContext,
    report: &mut DispatchReport,
) {
    let Some(handler) = registry.get_mut(idx) else {
        return;
    };
    debug!("Starting handler {}", handler.name());
    if let Err(e) = handler.begin(ctx).await {
        report.record(handler.name(), BEGIN, None, e);
    }
}

async fn dispatch_part(
    part: &Part,
    registry: &mut HandlerRegistry,
    ctx: &mut HandlerContext,
    report: &mut DispatchReport,
) {
    let filename = part.filename.as_deref();

    let (idx, routed) = match registry.lookup(&part.content_type) {
        Some(idx) => (idx, None),
        None => {
            let sniffed = ContentType::sniff(&part.body)
                .and_then(|ct| registry.lookup(ct.mime_type()).map(|idx| (idx, ct)));
            match sniffed {
                Some((idx, ct)) => {
                    debug!(
                        "Part {:?} declared {} sniffed as {}",
                        filename, part.content_type, ct
                    );
                    let routed = Part {
                        content_type: ct.mime_type().to_string(),
                        ..part.clone()
                    };
                    (idx, Some(routed))
                }
                None => {
                    info!(
                        "No handler for part {:?} ({}), dropping",
                        filename, part.content_type
                    );
                    report.dropped += 1;
                    return;
                }
            }
        }
    };
    let part = routed.as_ref().unwrap_or(part);

    let Some(handler) = registry.get_mut(idx) else {
        report.dropped += 1;
        return;
    };

    debug!("Handing part {:?} to {}", filename, handler.name());
    report.dispatched += 1;
    if let Err(e) = handler.handle(ctx, part).await {
        report.record(handler.name(), &part.content_type, filename, e);
    }
}
