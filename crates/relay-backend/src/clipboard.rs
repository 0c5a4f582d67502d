use crate::types::BackendError;

/// Seam over the system clipboard; the invoker is the only writer, and
/// only when a feature explicitly opted into the clipboard hand-off.
pub trait ClipboardSink: Send + Sync {
    fn copy(&self, text: &str) -> Result<(), BackendError>;
}

/// System clipboard backed by `arboard`.
#[derive(Debug, Default)]
pub struct SystemClipboard;

impl ClipboardSink for SystemClipboard {
    fn copy(&self, text: &str) -> Result<(), BackendError> {
        let mut clipboard =
            arboard::Clipboard::new().map_err(|error| BackendError::Clipboard(error.to_string()))?;
        clipboard
            .set_text(text.to_string())
            .map_err(|error| BackendError::Clipboard(error.to_string()))
    }
}
