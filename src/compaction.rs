//! Context compaction for long-running conversations.
//!
//! Two phases, cheapest first: structural pruning strips tool payloads
//! from older turns, then (if the window is still too large) the older
//! half is replaced with a model-written summary. Compaction never
//! fails the job: a summarizer error falls back to keeping only the
//! recent tail.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, Role};

const SUMMARY_INSTRUCTION: &str =
    "Summarize the conversation so far. Preserve facts, decisions, and action items; omit filler.";

/// Compaction thresholds.
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Window size that triggers compaction.
    pub max_messages: usize,
    /// Reported input tokens that trigger compaction.
    pub max_input_tokens: u32,
    /// How many trailing messages survive summarization verbatim.
    pub keep_recent: usize,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            max_messages: 20,
            max_input_tokens: 100_000,
            keep_recent: 10,
        }
    }
}

/// Shrinks a conversation window while preserving its recent tail.
pub struct ContextCompactor {
    llm: Arc<dyn LlmProvider>,
    config: CompactorConfig,
}

impl ContextCompactor {
    pub fn new(llm: Arc<dyn LlmProvider>, config: CompactorConfig) -> Self {
        Self { llm, config }
    }

    /// Whether the window needs shrinking before the next model call.
    /// A leading system message is exempt from the message budget, the
    /// same way `compact` sets it aside before shrinking.
    pub fn needs_compaction(&self, messages: &[ChatMessage], last_input_tokens: u32) -> bool {
        let window_len = match messages.first() {
            Some(first) if first.role == Role::System => messages.len() - 1,
            _ => messages.len(),
        };
        window_len > self.config.max_messages || last_input_tokens > self.config.max_input_tokens
    }

    /// Shrink `messages`. The system message (if leading) and the last
    /// `keep_recent` messages always survive verbatim.
    pub async fn compact(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let (system, mut window) = split_system(messages);

        structural_prune(&mut window);

        if window.len() > self.config.max_messages {
            window = self.summarize(window).await;
        }

        match system {
            Some(system) => std::iter::once(system).chain(window).collect(),
            None => window,
        }
    }

    /// Replace everything but the recent tail with a summary turn.
    async fn summarize(&self, window: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let keep = self.config.keep_recent.min(window.len());
        let split = window.len() - keep;
        let (older, recent) = window.split_at(split);

        let transcript = render_transcript(older);
        let request = CompletionRequest::new(vec![
            ChatMessage::system(SUMMARY_INSTRUCTION),
            ChatMessage::user(transcript),
        ])
        .with_max_tokens(1024)
        .with_temperature(0.2);

        match self.llm.complete(request).await {
            Ok(response) => {
                debug!(
                    summarized = older.len(),
                    kept = recent.len(),
                    "Window summarized"
                );
                let mut compacted = vec![
                    ChatMessage::user(format!(
                        "Summary of the conversation so far:\n{}",
                        response.content
                    )),
                    ChatMessage::assistant("Understood. Continuing from that summary."),
                ];
                compacted.extend_from_slice(recent);
                compacted
            }
            Err(e) => {
                // Degraded but safe: drop the older half entirely.
                warn!("Summarization failed, keeping recent tail only: {e}");
                recent.to_vec()
            }
        }
    }
}

/// Pull a leading system message out of the window.
fn split_system(messages: Vec<ChatMessage>) -> (Option<ChatMessage>, Vec<ChatMessage>) {
    let mut iter = messages.into_iter();
    match iter.next() {
        Some(first) if first.role == Role::System => (Some(first), iter.collect()),
        Some(first) => (None, std::iter::once(first).chain(iter).collect()),
        None => (None, Vec::new()),
    }
}

/// Strip tool payloads from everything before the second-to-last user
/// message. Orphaned tool results keep their text but lose the call id,
/// so providers render them as plain turns.
fn structural_prune(window: &mut Vec<ChatMessage>) {
    let user_positions: Vec<usize> = window
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::User)
        .map(|(i, _)| i)
        .collect();

    let Some(&boundary) = user_positions.len().checked_sub(2).and_then(|i| user_positions.get(i))
    else {
        return;
    };

    for message in window.iter_mut().take(boundary) {
        message.tool_calls.clear();
        message.tool_call_id = None;
    }
    window.retain(|m| !m.content.is_empty() || !m.tool_calls.is_empty());
}

fn render_transcript(messages: &[ChatMessage]) -> String {
    let mut transcript = String::new();
    for message in messages {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        transcript.push_str(role);
        transcript.push_str(": ");
        transcript.push_str(&message.content);
        if !message.tool_calls.is_empty() {
            let names: Vec<&str> = message.tool_calls.iter().map(|c| c.name.as_str()).collect();
            transcript.push_str(&format!(" [called: {}]", names.join(", ")));
        }
        transcript.push('\n');
    }
    transcript
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, FinishReason, ToolCall};
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedSummarizer {
        fail: bool,
    }

    #[async_trait]
    impl LlmProvider for FixedSummarizer {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            if self.fail {
                return Err(LlmError::RequestFailed {
                    provider: "mock".to_string(),
                    reason: "unreachable".to_string(),
                });
            }
            Ok(CompletionResponse {
                content: "They discussed the weekly report.".to_string(),
                tool_calls: Vec::new(),
                input_tokens: 50,
                output_tokens: 10,
                finish_reason: FinishReason::Stop,
            })
        }

        fn model_name(&self) -> &str {
            "mock"
        }
    }

    fn compactor(fail: bool) -> ContextCompactor {
        ContextCompactor::new(
            Arc::new(FixedSummarizer { fail }),
            CompactorConfig::default(),
        )
    }

    fn window_of(n: usize) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system("Be helpful.")];
        for i in 0..n {
            if i % 2 == 0 {
                messages.push(ChatMessage::user(format!("question {i}")));
            } else {
                messages.push(ChatMessage::assistant(format!("answer {i}")));
            }
        }
        messages
    }

    #[tokio::test]
    async fn small_windows_pass_through() {
        let compactor = compactor(false);
        let window = window_of(6);
        assert!(!compactor.needs_compaction(&window, 1_000));

        let compacted = compactor.compact(window.clone()).await;
        assert_eq!(compacted, window);
    }

    #[test]
    fn token_pressure_triggers_compaction() {
        let compactor = compactor(false);
        let window = window_of(4);
        assert!(compactor.needs_compaction(&window, 150_000));
    }

    #[tokio::test]
    async fn large_window_shrinks_to_summary_plus_tail() {
        let compactor = compactor(false);
        let window = window_of(30);
        assert!(compactor.needs_compaction(&window, 1_000));

        let compacted = compactor.compact(window.clone()).await;

        // system + summary pair + 10 recent
        assert_eq!(compacted.len(), 13);
        assert_eq!(compacted[0].role, Role::System);
        assert!(compacted[1].content.contains("weekly report"));
        assert_eq!(
            compacted[2].content,
            "Understood. Continuing from that summary."
        );
        assert_eq!(&compacted[3..], &window[window.len() - 10..]);
    }

    #[tokio::test]
    async fn twenty_five_messages_become_twelve() {
        let compactor = compactor(false);
        let mut window = Vec::new();
        for i in 0..25 {
            if i % 2 == 0 {
                window.push(ChatMessage::user(format!("question {i}")));
            } else {
                window.push(ChatMessage::assistant(format!("answer {i}")));
            }
        }

        let compacted = compactor.compact(window).await;
        // Oldest 15 replaced by the synthetic pair, last 10 kept.
        assert_eq!(compacted.len(), 12);
        assert_eq!(compacted[0].role, Role::User);
        assert_eq!(compacted[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn system_message_does_not_count_against_budget() {
        let compactor = compactor(false);

        // system + exactly max_messages stays under the threshold.
        let window = window_of(20);
        assert_eq!(window.len(), 21);
        assert!(!compactor.needs_compaction(&window, 1_000));
        assert!(compactor.needs_compaction(&window_of(21), 1_000));

        // A freshly compacted window does not trigger again next step.
        let compacted = compactor.compact(window_of(30)).await;
        assert!(!compactor.needs_compaction(&compacted, 1_000));
    }

    #[tokio::test]
    async fn compaction_is_idempotent() {
        let compactor = compactor(false);
        let once = compactor.compact(window_of(30)).await;
        let twice = compactor.compact(once.clone()).await;
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn summarizer_failure_keeps_recent_tail() {
        let compactor = compactor(true);
        let window = window_of(30);
        let compacted = compactor.compact(window.clone()).await;

        // system + exactly keep_recent messages, nothing invented.
        assert_eq!(compacted.len(), 11);
        assert_eq!(&compacted[1..], &window[window.len() - 10..]);
    }

    #[tokio::test]
    async fn pruning_strips_old_tool_payloads() {
        let mut window = vec![
            ChatMessage::user("look this up"),
            ChatMessage::assistant_with_tools(
                "checking",
                vec![ToolCall {
                    id: "c1".to_string(),
                    name: "web_search".to_string(),
                    arguments: json!({"query": "rust"}),
                }],
            ),
            ChatMessage::tool("big result blob", "c1"),
            ChatMessage::user("and summarize"),
            ChatMessage::assistant("done"),
            ChatMessage::user("thanks, one more thing"),
        ];
        structural_prune(&mut window);

        // Everything before the second-to-last user turn lost its payloads.
        assert!(window[1].tool_calls.is_empty());
        assert!(window[2].tool_call_id.is_none());
        assert_eq!(window[2].content, "big result blob");
        // The recent turns are untouched.
        assert_eq!(window.last().unwrap().content, "thanks, one more thing");
    }
}
