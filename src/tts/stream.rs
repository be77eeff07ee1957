//! Streaming synthesis pipeline
//!
//! Converts a lazy stream of text fragments into ordered PCM chunks.
//! Three tasks cooperate over bounded channels:
//!
//! ```text
//! fragments → [accumulator] → sentences → [dispatcher] → result slots
//!                                                             ↓
//!                                  PCM chunks ← [collector, in order]
//! ```
//!
//! The dispatcher enqueues a one-shot result slot per sentence before it
//! launches the HTTP call that will fill it. The slot queue is bounded
//! at [`LOOKAHEAD`], which throttles how many synthesises run at once,
//! and the collector drains slots in FIFO order, so output order always
//! equals sentence order even when the server answers out of order.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SpeechError;
use crate::types::VoiceProfile;

use super::CoquiTts;

/// Number of sentences whose synthesis may be in flight before dispatch
/// blocks.
pub(crate) const LOOKAHEAD: usize = 4;

/// Output channel depth, in PCM chunks.
pub(crate) const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Size of the PCM chunks emitted on the output channel.
pub(crate) const PCM_CHUNK_SIZE: usize = 4096;

/// Buffers incoming text fragments and drains complete sentences.
///
/// A sentence ends at the first `.`, `!` or `?` whose next character is
/// whitespace (or at the end of the buffer). The heuristic is
/// intentionally simple: abbreviations followed by a space ("Dr. Smith")
/// split. That is documented behaviour, not a bug.
#[derive(Debug, Default)]
pub(crate) struct SentenceAccumulator {
    buf: String,
}

impl SentenceAccumulator {
    /// Append a fragment and return any sentences it completed, trimmed,
    /// with empty ones dropped.
    pub(crate) fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buf.push_str(fragment);
        let mut sentences = Vec::new();
        while let Some(end) = self.boundary() {
            let rest = self.buf.split_off(end);
            let sentence = std::mem::replace(&mut self.buf, rest);
            let trimmed = sentence.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
        }
        sentences
    }

    /// Take whatever is left as a final sentence, if non-empty.
    pub(crate) fn flush(&mut self) -> Option<String> {
        let residual = std::mem::take(&mut self.buf);
        let trimmed = residual.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Byte offset one past the first sentence terminator, or `None` if
    /// the buffer holds no complete sentence yet.
    fn boundary(&self) -> Option<usize> {
        let mut chars = self.buf.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if matches!(c, '.' | '!' | '?') {
                match chars.peek() {
                    None => return Some(i + c.len_utf8()),
                    Some((_, next)) if next.is_whitespace() => return Some(i + c.len_utf8()),
                    _ => {}
                }
            }
        }
        None
    }
}

/// Wire up the three pipeline tasks and hand back the output channel.
///
/// All tasks run under a child of the caller's token; the collector
/// cancels that child on the first synthesis failure so the upstream
/// tasks shut down promptly.
pub(crate) fn spawn_pipeline(
    tts: CoquiTts,
    cancel: &CancellationToken,
    fragments: mpsc::Receiver<String>,
    voice: VoiceProfile,
) -> mpsc::Receiver<Vec<u8>> {
    let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let (sentence_tx, sentence_rx) = mpsc::channel::<String>(LOOKAHEAD);
    let (slot_tx, slot_rx) =
        mpsc::channel::<oneshot::Receiver<Result<Vec<u8>, SpeechError>>>(LOOKAHEAD);

    let pipeline = cancel.child_token();
    tokio::spawn(accumulate(fragments, sentence_tx, pipeline.clone()));
    tokio::spawn(dispatch(tts, voice, sentence_rx, slot_tx, pipeline.clone()));
    tokio::spawn(collect(slot_rx, out_tx, pipeline));

    out_rx
}

/// Accumulator task: fragments in, sentences out.
async fn accumulate(
    mut fragments: mpsc::Receiver<String>,
    sentences: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let mut acc = SentenceAccumulator::default();
    loop {
        let fragment = tokio::select! {
            _ = cancel.cancelled() => return,
            fragment = fragments.recv() => fragment,
        };
        let Some(fragment) = fragment else {
            break;
        };
        for sentence in acc.push(&fragment) {
            if !send_or_cancel(&sentences, sentence, &cancel).await {
                return;
            }
        }
    }
    if let Some(residual) = acc.flush() {
        send_or_cancel(&sentences, residual, &cancel).await;
    }
}

/// Dispatcher task: one bounded-lookahead HTTP call per sentence.
///
/// The result slot is enqueued before the call is launched; the bounded
/// slot queue is what holds dispatch back when the collector falls
/// behind.
async fn dispatch(
    tts: CoquiTts,
    voice: VoiceProfile,
    mut sentences: mpsc::Receiver<String>,
    slots: mpsc::Sender<oneshot::Receiver<Result<Vec<u8>, SpeechError>>>,
    cancel: CancellationToken,
) {
    loop {
        let sentence = tokio::select! {
            _ = cancel.cancelled() => return,
            sentence = sentences.recv() => sentence,
        };
        let Some(sentence) = sentence else {
            return;
        };

        let (result_tx, result_rx) = oneshot::channel();
        if !send_or_cancel(&slots, result_rx, &cancel).await {
            return;
        }

        debug!(sentence = crate::truncate_safe(&sentence, 60), "dispatching synthesis");
        let tts = tts.clone();
        let voice = voice.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tts.synthesize_sentence(&sentence, &voice) => result,
            };
            let _ = result_tx.send(result);
        });
    }
}

/// Collector task: awaits result slots in FIFO order and emits PCM in
/// fixed-size chunks. Exits (and cancels the pipeline) on the first
/// failed slot.
async fn collect(
    mut slots: mpsc::Receiver<oneshot::Receiver<Result<Vec<u8>, SpeechError>>>,
    out: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let slot = tokio::select! {
            _ = cancel.cancelled() => return,
            slot = slots.recv() => slot,
        };
        let Some(slot) = slot else {
            return;
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = slot => result,
        };

        match result {
            Ok(Ok(pcm)) => {
                for chunk in pcm.chunks(PCM_CHUNK_SIZE) {
                    if !send_or_cancel(&out, chunk.to_vec(), &cancel).await {
                        cancel.cancel();
                        return;
                    }
                }
            }
            Ok(Err(err)) => {
                warn!(error = %err, "synthesis failed, terminating stream");
                cancel.cancel();
                return;
            }
            // Synthesis task dropped its slot without a result.
            Err(_) => {
                cancel.cancel();
                return;
            }
        }
    }
}

/// Bounded send raced against cancellation. Returns false when the send
/// was abandoned (cancelled or receiver gone).
async fn send_or_cancel<T>(tx: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_all(acc: &mut SentenceAccumulator, fragments: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        for fragment in fragments {
            out.extend(acc.push(fragment));
        }
        if let Some(residual) = acc.flush() {
            out.push(residual);
        }
        out
    }

    #[test]
    fn test_groups_fragments_into_sentences() {
        let mut acc = SentenceAccumulator::default();
        let sentences = push_all(&mut acc, &["Hello ", "world. ", "Are ", "you ", "there?"]);
        assert_eq!(sentences, vec!["Hello world.", "Are you there?"]);
    }

    #[test]
    fn test_multiple_sentences_in_one_fragment() {
        let mut acc = SentenceAccumulator::default();
        let sentences = acc.push("One. Two! Three? ");
        assert_eq!(sentences, vec!["One.", "Two!", "Three?"]);
    }

    #[test]
    fn test_terminator_without_whitespace_does_not_split() {
        let mut acc = SentenceAccumulator::default();
        assert!(acc.push("version 3.14 is ").is_empty());
        assert_eq!(acc.push("out. "), vec!["version 3.14 is out."]);
    }

    #[test]
    fn test_abbreviation_with_space_splits() {
        // Documented behaviour of the simple boundary heuristic.
        let mut acc = SentenceAccumulator::default();
        let sentences = push_all(&mut acc, &["Dr. Smith arrived."]);
        assert_eq!(sentences, vec!["Dr.", "Smith arrived."]);
    }

    #[test]
    fn test_residual_flushed_on_close() {
        let mut acc = SentenceAccumulator::default();
        assert!(acc.push("no terminator here").is_empty());
        assert_eq!(acc.flush().as_deref(), Some("no terminator here"));
        assert_eq!(acc.flush(), None);
    }

    #[test]
    fn test_whitespace_only_sentences_dropped() {
        let mut acc = SentenceAccumulator::default();
        assert!(acc.push("   . ").is_empty());
        assert_eq!(acc.flush(), None);
    }

    #[test]
    fn test_terminator_at_buffer_end_completes() {
        let mut acc = SentenceAccumulator::default();
        assert_eq!(acc.push("Done!"), vec!["Done!"]);
    }
}
