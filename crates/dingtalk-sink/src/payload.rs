use bytes::Bytes;
use nanoserde::SerJson;
use thiserror::Error;
use tracing::warn;

use crate::event::LogEvent;
use crate::render::EventRenderer;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("refusing to build a payload for an empty batch")]
    EmptyBatch,

    #[error("none of the {0} events in the batch could be rendered")]
    NothingRendered(usize),
}

#[derive(Debug, SerJson)]
pub struct RobotMessage {
    pub msgtype: String,
    pub text: RobotText,
}

#[derive(Debug, SerJson)]
pub struct RobotText {
    pub content: String,
}

impl RobotMessage {
    pub fn text(content: String) -> Self {
        Self {
            msgtype: "text".to_owned(),
            text: RobotText { content },
        }
    }
}

/// Render every event in order and wrap the concatenated text in a
/// `{"msgtype":"text","text":{"content":...}}` envelope.
///
/// Events that fail to render are skipped; the rest of the batch is kept.
pub fn build_payload<R: EventRenderer + ?Sized>(
    batch: &[LogEvent],
    renderer: &R,
) -> Result<Bytes, PayloadError> {
    if batch.is_empty() {
        return Err(PayloadError::EmptyBatch);
    }

    let mut content = String::new();
    let mut rendered = 0usize;
    for event in batch {
        let mark = content.len();
        match renderer.render(event, &mut content) {
            Ok(()) => rendered += 1,
            Err(e) => {
                content.truncate(mark);
                warn!(error = %e, level = %event.level, "skipping event that failed to render");
            }
        }
    }

    if rendered == 0 {
        return Err(PayloadError::NothingRendered(batch.len()));
    }

    Ok(Bytes::from(RobotMessage::text(content).serialize_json()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Level;
    use crate::render::TemplateRenderer;
    use crate::testing::SelectiveRenderer;

    fn parse(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    #[test]
    fn concatenates_events_in_order() {
        let renderer = TemplateRenderer::new("{Message}{NewLine}").unwrap();
        let batch = vec![
            LogEvent::new(Level::Information, "first"),
            LogEvent::new(Level::Information, "second"),
            LogEvent::new(Level::Information, "third"),
        ];

        let body = build_payload(&batch, &renderer).unwrap();
        let json = parse(&body);
        assert_eq!(json["msgtype"], "text");
        assert_eq!(json["text"]["content"], "first\nsecond\nthird\n");
    }

    #[test]
    fn content_is_json_escaped() {
        let renderer = TemplateRenderer::new("{Message}").unwrap();
        let batch = vec![LogEvent::new(
            Level::Error,
            "quote \" backslash \\ tab \t 中文",
        )];

        let body = build_payload(&batch, &renderer).unwrap();
        assert_eq!(
            parse(&body)["text"]["content"],
            "quote \" backslash \\ tab \t 中文"
        );
    }

    #[test]
    fn empty_batch_is_rejected() {
        let renderer = TemplateRenderer::new("{Message}").unwrap();
        let err = build_payload(&[], &renderer).unwrap_err();
        assert!(matches!(err, PayloadError::EmptyBatch));
    }

    #[test]
    fn failed_event_is_skipped_and_rest_kept() {
        let renderer = SelectiveRenderer::failing_on("bad");
        let batch = vec![
            LogEvent::new(Level::Information, "ok1"),
            LogEvent::new(Level::Information, "bad"),
            LogEvent::new(Level::Information, "ok2"),
        ];

        let body = build_payload(&batch, &renderer).unwrap();
        assert_eq!(parse(&body)["text"]["content"], "ok1\nok2\n");
    }

    #[test]
    fn all_events_failing_yields_error() {
        let renderer = SelectiveRenderer::failing_on("bad");
        let batch = vec![LogEvent::new(Level::Information, "bad")];
        let err = build_payload(&batch, &renderer).unwrap_err();
        assert!(matches!(err, PayloadError::NothingRendered(1)));
    }
}
